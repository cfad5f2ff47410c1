use std::path::Path;

use crate::error::Result;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GetFlags: u32 {
        const DECRYPTED = 1;
        const REBALANCE = 2;
        const SCRUB = 4;
        const PRIORITIZE = 8;
        const READAHEAD = 16;
        const UNSYNCED = 32;
        const REBUILD = 64;
        const IGNORE_READ_ERRORS = 128;
        const PREPEND_MD5SUM = 256;
        const BACKGROUND = 512;
        const NO_THROTTLE = 1024;
        const METADATA = 2048;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GetStatus: u32 {
        const REPAIRED = 1;
        const ENOSPC = 2;
        const NOT_FOUND = 4;
        const REPAIR_ERROR = 8;
        const SKIPPED = 16;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PutFlags: u32 {
        const ALREADY_COMPRESSED_ENCRYPTED = 1;
        const METADATA = 2;
    }
}

#[derive(Debug, Default)]
pub struct GetResult {
    pub md5sum: Vec<u8>,
    pub status: GetStatus,
}

#[derive(Debug)]
pub struct PutResult {
    pub md5sum: Vec<u8>,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct ListedObject {
    pub key: String,
    pub md5sum: Vec<u8>,
    pub size: i64,
    pub last_modified: i64,
}

/// Restartable lazy sequence of backend keys queued for deletion.
///
/// `reset` rewinds to the first key so a failed batch can be retried;
/// `clear` drops the in-memory state once the batch is durably consumed.
pub trait KeyStream: Send {
    fn next(&mut self) -> Option<String>;
    fn reset(&mut self);
    fn clear(&mut self);
}

/// Parallel sequence of backend location infos, in lockstep with a
/// [`KeyStream`] when the backend advertises `del_with_location_info`.
pub trait LocinfoStream: Send {
    fn next(&mut self) -> Option<Vec<u8>>;
    fn reset(&mut self);
    fn clear(&mut self);
}

/// Key stream over an in-memory list, for small ad-hoc deletions.
pub struct VecKeyStream {
    keys: Vec<String>,
    pos: usize,
}

impl VecKeyStream {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys, pos: 0 }
    }
}

impl KeyStream for VecKeyStream {
    fn next(&mut self) -> Option<String> {
        let key = self.keys.get(self.pos)?.clone();
        self.pos += 1;
        Some(key)
    }

    fn reset(&mut self) {
        self.pos = 0;
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.pos = 0;
    }
}

/// Locinfo stream over an in-memory list, in lockstep with
/// [`VecKeyStream`].
pub struct VecLocinfoStream {
    infos: Vec<Vec<u8>>,
    pos: usize,
}

impl VecLocinfoStream {
    pub fn new(infos: Vec<Vec<u8>>) -> Self {
        Self { infos, pos: 0 }
    }
}

impl LocinfoStream for VecLocinfoStream {
    fn next(&mut self) -> Option<Vec<u8>> {
        let info = self.infos.get(self.pos)?.clone();
        self.pos += 1;
        Some(info)
    }

    fn reset(&mut self) {
        self.pos = 0;
    }

    fn clear(&mut self) {
        self.infos.clear();
        self.pos = 0;
    }
}

/// Remote content-addressed object store.
///
/// Implementations never panic across this boundary and collapse soft
/// failures into [`GetStatus`] bits; `Err` is reserved for failures that
/// survived the backend's own retry policy.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug + 'static {
    /// Reads `key` into `dst`. A missing object is reported via
    /// `GetStatus::NOT_FOUND`, not an error.
    async fn get(
        &self,
        key: &str,
        want_md5: &[u8],
        flags: GetFlags,
        dst: &Path,
    ) -> Result<GetResult>;

    /// Atomic per object: readers see the full prior version or the full
    /// new one, never a partial write.
    async fn put(&self, key: &str, src: &Path, flags: PutFlags) -> Result<PutResult>;

    /// Enumerates visible objects in unspecified order. Returning `false`
    /// from the callback stops the listing.
    async fn list(
        &self,
        callback: &mut (dyn FnMut(ListedObject) -> bool + Send),
    ) -> Result<()>;

    /// Deletes the keys yielded by `keys`. When `del_with_location_info`
    /// is advertised, `locinfo` runs in lockstep and must have the same
    /// length. `background_queue` lets the backend defer the work.
    async fn del(
        &self,
        keys: &mut dyn KeyStream,
        locinfo: Option<&mut (dyn LocinfoStream + 'static)>,
        background_queue: bool,
    ) -> Result<()>;

    async fn sync(&self, background_queue: bool) -> Result<()>;

    // Capability advertisements. Immutable per instance.
    fn max_del_size(&self) -> usize;
    fn num_del_parallel(&self) -> usize {
        1
    }
    fn num_scrub_parallel(&self) -> usize {
        1
    }
    fn has_transactions(&self) -> bool {
        false
    }
    fn prefer_sequential_read(&self) -> bool {
        false
    }
    fn ordered_del(&self) -> bool {
        false
    }
    fn can_read_unsynced(&self) -> bool;
    fn is_put_sync(&self) -> bool;
    fn del_with_location_info(&self) -> bool {
        false
    }
    /// Whether deletes must run against the most recent key listing, as
    /// opposed to accepting batched historical keys.
    fn need_curr_del(&self) -> bool {
        false
    }
    fn fast_write_retry(&self) -> bool {
        false
    }
    fn want_put_metadata(&self) -> bool {
        false
    }

    async fn check_deleted(&self, _key: &str, _locinfo: &[u8]) -> bool {
        false
    }

    fn get_uploaded_bytes(&self) -> i64;
    fn get_downloaded_bytes(&self) -> i64;

    fn meminfo(&self) -> String {
        String::new()
    }
}
