use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use md5::{Digest, Md5};

use crate::blob_store::{
    BlobStore, GetFlags, GetResult, GetStatus, KeyStream, ListedObject, LocinfoStream, PutFlags,
    PutResult,
};
use crate::error::Result;

#[derive(Debug, Clone)]
struct MemObject {
    body: Vec<u8>,
    md5sum: Vec<u8>,
    last_modified: i64,
}

/// Backend keeping every object in process memory. Serves the
/// `only_memfiles` configuration and the test suite.
#[derive(Debug, Default)]
pub struct MemBackend {
    objects: Mutex<BTreeMap<String, MemObject>>,
    uploaded_bytes: AtomicI64,
    downloaded_bytes: AtomicI64,
    clock: AtomicI64,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn num_objects(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemBackend {
    async fn get(
        &self,
        key: &str,
        _want_md5: &[u8],
        flags: GetFlags,
        dst: &Path,
    ) -> Result<GetResult> {
        let obj = match self.objects.lock().unwrap().get(key) {
            Some(obj) => obj.clone(),
            None => {
                return Ok(GetResult {
                    md5sum: Vec::new(),
                    status: GetStatus::NOT_FOUND,
                })
            }
        };

        let mut out = Vec::with_capacity(obj.body.len() + 16);
        if flags.contains(GetFlags::PREPEND_MD5SUM) {
            out.extend_from_slice(&obj.md5sum);
        }
        out.extend_from_slice(&obj.body);
        tokio::fs::write(dst, &out).await?;

        self.downloaded_bytes.fetch_add(obj.body.len() as i64, Ordering::Relaxed);
        Ok(GetResult {
            md5sum: obj.md5sum,
            status: GetStatus::default(),
        })
    }

    async fn put(&self, key: &str, src: &Path, _flags: PutFlags) -> Result<PutResult> {
        let body = tokio::fs::read(src).await?;
        let md5sum = Md5::digest(&body).to_vec();
        let size = body.len() as i64;

        self.uploaded_bytes.fetch_add(size, Ordering::Relaxed);
        let last_modified = self.clock.fetch_add(1, Ordering::Relaxed);
        self.objects.lock().unwrap().insert(
            key.to_string(),
            MemObject {
                body,
                md5sum: md5sum.clone(),
                last_modified,
            },
        );
        Ok(PutResult { md5sum, size })
    }

    async fn list(
        &self,
        callback: &mut (dyn FnMut(ListedObject) -> bool + Send),
    ) -> Result<()> {
        let snapshot: Vec<ListedObject> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(key, obj)| ListedObject {
                key: key.clone(),
                md5sum: obj.md5sum.clone(),
                size: obj.body.len() as i64,
                last_modified: obj.last_modified,
            })
            .collect();
        for item in snapshot {
            if !callback(item) {
                break;
            }
        }
        Ok(())
    }

    async fn del(
        &self,
        keys: &mut dyn KeyStream,
        _locinfo: Option<&mut (dyn LocinfoStream + 'static)>,
        _background_queue: bool,
    ) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        while let Some(key) = keys.next() {
            objects.remove(&key);
        }
        keys.clear();
        Ok(())
    }

    async fn sync(&self, _background_queue: bool) -> Result<()> {
        Ok(())
    }

    fn max_del_size(&self) -> usize {
        1000
    }

    fn can_read_unsynced(&self) -> bool {
        true
    }

    fn is_put_sync(&self) -> bool {
        true
    }

    fn get_uploaded_bytes(&self) -> i64 {
        self.uploaded_bytes.load(Ordering::Relaxed)
    }

    fn get_downloaded_bytes(&self) -> i64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    fn meminfo(&self) -> String {
        let objects = self.objects.lock().unwrap();
        let bytes: usize = objects.values().map(|o| o.body.len()).sum();
        format!("mem backend: {} objects, {bytes} bytes\n", objects.len())
    }
}
