use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::background::{self, BackgroundCtl};
use crate::blob_store::{BlobStore, GetFlags, GetResult, GetStatus, PutFlags};
use crate::collector::DeleteHooks;
use crate::error::{FailBits, KvError, Result};
use crate::keys::{encode_key, prefix_key};
use crate::meta_db::{MetaDb, TASK_DELETE_PASS};
use crate::mirror;
use crate::put_worker::PutDbWorker;
use crate::scrub::{ScrubAction, ScrubState};

const GENERATION_RESERVE: i64 = 10_000;
pub(crate) const MIRROR_DEL_LOG_RPOS_KEY: &str = "backend_mirror_del_log_rpos";

pub struct StoreOptions {
    pub db_path: PathBuf,
    /// Directory for collector task files and the mirror-delete log.
    pub data_path: PathBuf,
    pub backend: Arc<dyn BlobStore>,
    pub backend_mirror: Option<Arc<dyn BlobStore>>,
    /// Hours/weekdays the mirror catch-up may run in; empty means always.
    pub mirror_window: String,
    pub background_worker_manual_run: bool,
    pub background_worker_multi_trans_delete: bool,
    pub with_prefix: bool,
    /// Seconds a freshly committed transaction waits before reclamation.
    pub task_delay: i64,
    pub synchronous: bool,
}

impl StoreOptions {
    pub fn new(db_path: PathBuf, data_path: PathBuf, backend: Arc<dyn BlobStore>) -> Self {
        Self {
            db_path,
            data_path,
            backend,
            backend_mirror: None,
            mirror_window: String::new(),
            background_worker_manual_run: false,
            background_worker_multi_trans_delete: false,
            with_prefix: true,
            task_delay: 0,
            synchronous: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct UnsyncedKey {
    transid: i64,
    md5sum: Vec<u8>,
}

/// Double-buffered map of writes whose metadata row is not yet durable.
/// Writers insert into `curr`; the sync swap retires `other` wholesale.
#[derive(Default)]
struct UnsyncedKeys {
    curr: HashMap<(i64, Vec<u8>), UnsyncedKey>,
    other: HashMap<(i64, Vec<u8>), UnsyncedKey>,
}

impl UnsyncedKeys {
    fn lookup(&self, cd_id: i64, tkey: &[u8]) -> Option<UnsyncedKey> {
        let k = (cd_id, tkey.to_vec());
        self.curr.get(&k).or_else(|| self.other.get(&k)).cloned()
    }
}

struct GenerationState {
    current: i64,
    last_persisted: i64,
}

pub(crate) struct Inner {
    pub(crate) backend: Arc<dyn BlobStore>,
    pub(crate) backend_mirror: Option<Arc<dyn BlobStore>>,
    pub(crate) db: MetaDb,
    pub(crate) put_db_worker: PutDbWorker,
    pub(crate) fail_bits: Arc<FailBits>,
    pub(crate) data_path: PathBuf,
    pub(crate) mirror_window: String,
    pub(crate) multi_trans_delete: bool,
    pub(crate) task_delay: i64,
    with_prefix: bool,

    unsynced_keys: Mutex<UnsyncedKeys>,
    put_shared: tokio::sync::RwLock<()>,
    generation: Mutex<GenerationState>,

    pub(crate) background: BackgroundCtl,
    pub(crate) scrub: Mutex<Option<Arc<ScrubState>>>,

    mirror_del_log: Mutex<Option<std::fs::File>>,
    pub(crate) mirror_del_log_rpos: AtomicI64,

    pub(crate) total_del_ops: AtomicI64,
    pub(crate) total_balance_ops: AtomicI64,
    pub(crate) objects_total_size: AtomicI64,
    pub(crate) objects_total_num: AtomicI64,
    objects_init_complete: AtomicBool,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStoreFrontend").finish()
    }
}

impl Inner {
    pub(crate) fn encode_backend_key(&self, cd_id: i64, tkey: &[u8], transid: i64) -> String {
        let key = encode_key(cd_id, tkey, transid);
        if self.with_prefix {
            prefix_key(&key)
        } else {
            key
        }
    }

    pub(crate) fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Appends a framed key record to the mirror-delete log: the delete on
    /// the primary still has to be applied to the mirror.
    pub(crate) fn append_del_mirror(&self, key: &str) -> Result<()> {
        let mut guard = self.mirror_del_log.lock().unwrap();
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };
        let mut frame = Vec::with_capacity(key.len() + 8);
        frame.extend_from_slice(&(key.len() as u32).to_le_bytes());
        frame.extend_from_slice(key.as_bytes());
        frame.extend_from_slice(&Md5::digest(key.as_bytes())[..4]);
        file.seek(SeekFrom::End(0))?;
        file.write_all(&frame)?;
        Ok(())
    }

    /// Next unconsumed mirror-delete record, advancing the read position.
    /// `None` once the log is drained.
    pub(crate) fn next_del_mirror_item(&self) -> Result<Option<String>> {
        let mut guard = self.mirror_del_log.lock().unwrap();
        let Some(file) = guard.as_mut() else {
            return Ok(None);
        };
        let rpos = self.mirror_del_log_rpos.load(Ordering::SeqCst) as u64;
        let wpos = file.seek(SeekFrom::End(0))?;
        if rpos >= wpos {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(rpos))?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len + 4];
        file.read_exact(&mut body)?;

        let (key, check) = body.split_at(len);
        if Md5::digest(key)[..4] != *check {
            return Err(KvError::Corruption("mirror delete log frame".to_string()));
        }
        let key = String::from_utf8(key.to_vec())
            .map_err(|_| KvError::Corruption("mirror delete log key".to_string()))?;
        self.mirror_del_log_rpos
            .store((rpos + 4 + len as u64 + 4) as i64, Ordering::SeqCst);
        Ok(Some(key))
    }

    /// Checks a backend listing key against the metadata rows; optionally
    /// refreshes the stored md5. Used by the rebuild pass.
    pub(crate) async fn has_backend_key(
        &self,
        backend_key: &str,
        md5sum: &[u8],
        update_md5sum: bool,
    ) -> Result<bool> {
        let stripped = crate::keys::strip_prefix_key(backend_key);
        let Ok((cd_id, tkey, transid)) = crate::keys::decode_key(stripped) else {
            return Ok(false);
        };
        let Some(row) = self.db.get_object_in_transid(cd_id, transid, &tkey).await? else {
            return Ok(false);
        };
        if update_md5sum && !md5sum.is_empty() && row.md5sum != md5sum {
            self.db.update_object_md5sum(cd_id, md5sum, transid, &tkey).await?;
        }
        Ok(true)
    }
}

impl DeleteHooks for Inner {
    fn backend_key(&self, cd_id: i64, tkey: &[u8], transid: i64) -> String {
        self.encode_backend_key(cd_id, tkey, transid)
    }

    fn log_del_mirror(&self, key: &str) {
        if let Err(err) = self.append_del_mirror(key) {
            warn!(error = %err, "mirror delete log append failed");
        }
    }

    fn incr_del_ops(&self) {
        self.total_del_ops.fetch_add(1, Ordering::Relaxed);
    }
}

/// The store frontend: transactional put/get/del over a [`BlobStore`], with
/// reclamation, mirroring and scrub run by background workers.
pub struct KvStore {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore").finish()
    }
}

impl KvStore {
    pub async fn open(options: StoreOptions) -> Result<Self> {
        tokio::fs::create_dir_all(&options.data_path).await?;
        let db = MetaDb::open(&options.db_path).await?;
        let fail_bits = Arc::new(FailBits::default());

        let current_generation = match db.get_generation(0).await? {
            Some(g) => g,
            None => {
                db.insert_generation(0).await?;
                0
            }
        };

        let mirror_del_log = if options.backend_mirror.is_some() {
            let path = options.data_path.join("mirror_del.log");
            Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .read(true)
                    .append(true)
                    .open(path)?,
            )
        } else {
            None
        };
        let mirror_del_log_rpos = match db.get_misc_value(MIRROR_DEL_LOG_RPOS_KEY).await? {
            Some(v) => v.parse().unwrap_or(0),
            None => 0,
        };

        let put_db_worker = PutDbWorker::spawn(db.clone(), fail_bits.clone());
        put_db_worker.set_synchronous(options.synchronous);

        let totals = db.get_size().await?;

        let inner = Arc::new(Inner {
            backend: options.backend,
            backend_mirror: options.backend_mirror,
            db,
            put_db_worker,
            fail_bits,
            data_path: options.data_path,
            mirror_window: options.mirror_window,
            multi_trans_delete: options.background_worker_multi_trans_delete,
            task_delay: options.task_delay,
            with_prefix: options.with_prefix,
            unsynced_keys: Mutex::new(UnsyncedKeys::default()),
            put_shared: tokio::sync::RwLock::new(()),
            generation: Mutex::new(GenerationState {
                current: current_generation,
                last_persisted: current_generation,
            }),
            background: BackgroundCtl::new(options.background_worker_manual_run),
            scrub: Mutex::new(None),
            mirror_del_log: Mutex::new(mirror_del_log),
            mirror_del_log_rpos: AtomicI64::new(mirror_del_log_rpos),
            total_del_ops: AtomicI64::new(0),
            total_balance_ops: AtomicI64::new(0),
            objects_total_size: AtomicI64::new(totals.size),
            objects_total_num: AtomicI64::new(totals.count),
            objects_init_complete: AtomicBool::new(true),
        });

        let mut workers = vec![background::spawn(inner.clone())];
        if inner.backend_mirror.is_some() {
            workers.push(mirror::spawn(inner.clone()));
        }

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    fn check_writable(&self) -> Result<()> {
        if self.inner.fail_bits.has(FailBits::DATABASE_CORRUPTED) {
            return Err(KvError::Corruption("store fail bit set".to_string()));
        }
        Ok(())
    }

    /// Stores `src` under `(cd_id, tkey)` within `transid`. Returns the
    /// stored (compressed) size.
    #[tracing::instrument(level = "debug", skip(self, tkey, src))]
    pub async fn put(
        &self,
        cd_id: i64,
        tkey: &[u8],
        transid: i64,
        generation: i64,
        src: &Path,
        flags: PutFlags,
    ) -> Result<i64> {
        self.check_writable()?;
        if transid < 0 {
            return Err(KvError::Misuse("negative transaction id".to_string()));
        }
        let inner = &self.inner;
        let _shared = inner.put_shared.read().await;

        let rowid = inner.put_db_worker.add(cd_id, transid, tkey, generation).await?;
        inner.unsynced_keys.lock().unwrap().curr.insert(
            (cd_id, tkey.to_vec()),
            UnsyncedKey { transid, md5sum: Vec::new() },
        );

        let backend_key = inner.encode_backend_key(cd_id, tkey, transid);
        let put_res = match inner.backend.put(&backend_key, src, flags).await {
            Ok(res) => res,
            Err(err) => {
                // roll the partial row back so the key does not dangle
                let _ = inner.put_db_worker.flush().await;
                let _ = inner.db.delete_partial_object(cd_id, rowid).await;
                inner.unsynced_keys.lock().unwrap().curr.remove(&(cd_id, tkey.to_vec()));
                return Err(err);
            }
        };

        inner
            .put_db_worker
            .update(cd_id, rowid, put_res.size, &put_res.md5sum, inner.now())
            .await?;
        if let Some(entry) = inner
            .unsynced_keys
            .lock()
            .unwrap()
            .curr
            .get_mut(&(cd_id, tkey.to_vec()))
        {
            if entry.transid == transid {
                entry.md5sum = put_res.md5sum.clone();
            }
        }

        inner.objects_total_size.fetch_add(put_res.size, Ordering::Relaxed);
        inner.objects_total_num.fetch_add(1, Ordering::Relaxed);
        Ok(put_res.size)
    }

    /// Reads the newest revision of `(cd_id, tkey)` visible at `transid`
    /// into `dst`. Tombstones and missing keys surface as
    /// [`KvError::NotFound`].
    #[tracing::instrument(level = "debug", skip(self, tkey, dst))]
    pub async fn get(
        &self,
        cd_id: i64,
        tkey: &[u8],
        transid: i64,
        dst: &Path,
    ) -> Result<GetResult> {
        let inner = &self.inner;

        let unsynced = if inner.backend.can_read_unsynced() {
            inner
                .unsynced_keys
                .lock()
                .unwrap()
                .lookup(cd_id, tkey)
                .filter(|e| e.transid <= transid)
        } else {
            None
        };
        let row = inner.db.get_object(cd_id, transid, tkey).await?;

        // newest visible revision wins, wherever it is recorded
        let (resolved_transid, want_md5, flags) = match (&unsynced, &row) {
            (Some(u), Some(r)) if u.transid > r.trans_id => {
                (u.transid, u.md5sum.clone(), GetFlags::UNSYNCED)
            }
            (Some(u), None) => (u.transid, u.md5sum.clone(), GetFlags::UNSYNCED),
            (_, Some(r)) if r.size == -1 => return Err(KvError::NotFound),
            (_, Some(r)) => (r.trans_id, r.md5sum.clone(), GetFlags::empty()),
            (None, None) => return Err(KvError::NotFound),
        };

        let backend_key = inner.encode_backend_key(cd_id, tkey, resolved_transid);
        let res = inner
            .backend
            .get(&backend_key, &want_md5, flags | GetFlags::DECRYPTED, dst)
            .await?;
        if res.status.contains(GetStatus::NOT_FOUND) {
            warn!(transid = resolved_transid, "indexed object missing in backend");
            return Err(KvError::NotFound);
        }
        Ok(res)
    }

    /// Transaction id [`KvStore::get`] would resolve to, without reading.
    pub async fn get_transid(&self, cd_id: i64, tkey: &[u8], transid: i64) -> Result<Option<i64>> {
        let row = self.inner.db.get_object(cd_id, transid, tkey).await?;
        match row {
            Some(row) if row.size != -1 => Ok(Some(row.trans_id)),
            Some(row) => {
                // tombstoned; expose the revision a fallback would use
                self.inner
                    .db
                    .get_lower_transid_object(cd_id, tkey, row.trans_id)
                    .await
            }
            None => Ok(None),
        }
    }

    /// Records tombstones for `keys` in `transid`. Blob removal happens
    /// later, during reclamation.
    pub async fn del(&self, cd_id: i64, keys: &[Vec<u8>], transid: i64) -> Result<()> {
        self.check_writable()?;
        let inner = &self.inner;
        let _shared = inner.put_shared.read().await;

        for tkey in keys {
            inner.db.add_del_marker_object(cd_id, transid, tkey).await?;
            let mut unsynced = inner.unsynced_keys.lock().unwrap();
            let k = (cd_id, tkey.clone());
            if unsynced.curr.get(&k).map(|e| e.transid <= transid).unwrap_or(false) {
                unsynced.curr.remove(&k);
            }
            if unsynced.other.get(&k).map(|e| e.transid <= transid).unwrap_or(false) {
                unsynced.other.remove(&k);
            }
        }
        Ok(())
    }

    /// Forgets a failed put: drops the partial row and pending state.
    pub async fn reset(&self, cd_id: i64, tkey: &[u8], transid: i64) -> Result<()> {
        let inner = &self.inner;
        inner.put_db_worker.flush().await?;
        inner.db.delete_object(cd_id, transid, tkey).await?;
        let mut unsynced = inner.unsynced_keys.lock().unwrap();
        let k = (cd_id, tkey.to_vec());
        if unsynced.curr.get(&k).map(|e| e.transid == transid).unwrap_or(false) {
            unsynced.curr.remove(&k);
        }
        if unsynced.other.get(&k).map(|e| e.transid == transid).unwrap_or(false) {
            unsynced.other.remove(&k);
        }
        Ok(())
    }

    pub async fn new_transaction(&self, cd_id: i64) -> Result<i64> {
        self.check_writable()?;
        self.inner.db.new_transaction(cd_id).await
    }

    /// Finalizes (`complete=false`) or commits (`complete=true`) the
    /// transaction. Committing queues a reclamation pass for superseded
    /// revisions. Idempotent.
    pub async fn transaction_finalize(
        &self,
        cd_id: i64,
        transid: i64,
        complete: bool,
    ) -> Result<()> {
        self.check_writable()?;
        let inner = &self.inner;
        if !complete {
            inner.db.set_transaction_complete(cd_id, 1, transid).await?;
            return Ok(());
        }

        inner.db.set_transaction_complete(cd_id, 2, transid).await?;
        inner
            .db
            .add_task(TASK_DELETE_PASS, transid, inner.now() + inner.task_delay, cd_id)
            .await?;
        inner.background.wake();
        Ok(())
    }

    /// Marks exactly the transactions in `active_ids` active; everything
    /// else of the tenant becomes invisible to reads.
    pub async fn set_active_transactions(&self, cd_id: i64, active_ids: &[i64]) -> Result<()> {
        self.check_writable()?;
        let inner = &self.inner;
        for trans in inner.db.get_transaction_ids(cd_id).await? {
            let active = i64::from(active_ids.contains(&trans.id));
            if active != trans.active {
                inner.db.set_transaction_active(cd_id, active, trans.id).await?;
            }
        }
        Ok(())
    }

    /// Atomically advances the global generation counter.
    pub async fn generation_inc(&self, inc: i64) -> Result<i64> {
        let (value, persist) = {
            let mut gen = self.inner.generation.lock().unwrap();
            gen.current += inc;
            let persist = if gen.current >= gen.last_persisted {
                gen.last_persisted = gen.current + GENERATION_RESERVE;
                Some(gen.last_persisted)
            } else {
                None
            };
            (gen.current, persist)
        };
        if let Some(persisted) = persist {
            self.inner.db.update_generation(persisted).await?;
        }
        Ok(value)
    }

    pub async fn get_generation(&self, cd_id: i64) -> Result<i64> {
        if cd_id == 0 {
            return Ok(self.inner.generation.lock().unwrap().current);
        }
        Ok(self.inner.db.get_generation(cd_id).await?.unwrap_or(0))
    }

    pub async fn update_generation_cd(&self, cd_id: i64, generation: i64) -> Result<()> {
        self.inner.db.update_generation_cd(cd_id, generation).await
    }

    /// Makes every put completed-before this call durable and visible.
    pub async fn sync(&self) -> Result<()> {
        self.sync_internal(true).await
    }

    /// Metadata-only sync; skips the backend round trip.
    pub async fn sync_db(&self) -> Result<()> {
        self.sync_internal(false).await
    }

    async fn sync_internal(&self, backend_sync: bool) -> Result<()> {
        let inner = &self.inner;
        let _excl = inner.put_shared.write().await;
        inner.put_db_worker.flush().await?;
        if backend_sync {
            inner.backend.sync(false).await?;
        }
        let mut unsynced = inner.unsynced_keys.lock().unwrap();
        let retired = std::mem::take(&mut unsynced.other);
        unsynced.other = std::mem::take(&mut unsynced.curr);
        drop(retired);
        Ok(())
    }

    /// Checks a backend listing key against the metadata rows; optionally
    /// refreshes the stored md5. Used by the rebuild pass.
    pub async fn has_backend_key(
        &self,
        backend_key: &str,
        md5sum: &[u8],
        update_md5sum: bool,
    ) -> Result<bool> {
        self.inner.has_backend_key(backend_key, md5sum, update_md5sum).await
    }

    pub fn max_del_size(&self) -> usize {
        self.inner.backend.max_del_size()
    }

    pub fn is_put_sync(&self) -> bool {
        self.inner.backend.is_put_sync()
    }

    pub fn fast_write_retry(&self) -> bool {
        self.inner.backend.fast_write_retry()
    }

    pub fn want_put_metadata(&self) -> bool {
        self.inner.backend.want_put_metadata()
    }

    pub fn get_uploaded_bytes(&self) -> i64 {
        self.inner.backend.get_uploaded_bytes()
    }

    pub fn get_downloaded_bytes(&self) -> i64 {
        self.inner.backend.get_downloaded_bytes()
    }

    pub fn get_total_del_ops(&self) -> i64 {
        self.inner.total_del_ops.load(Ordering::Relaxed)
    }

    pub fn get_total_balance_ops(&self) -> i64 {
        self.inner.total_balance_ops.load(Ordering::Relaxed)
    }

    // ---- background worker control ----

    pub fn enable_background_worker(&self, enabled: bool) {
        self.inner.background.set_pause(!enabled);
    }

    pub fn is_background_worker_enabled(&self) -> bool {
        !self.inner.background.user_paused()
    }

    pub fn is_background_worker_running(&self) -> bool {
        self.inner.background.is_running()
    }

    pub fn is_startup_finished(&self) -> bool {
        self.inner.background.is_startup_finished()
    }

    /// Triggers one pass in manual-run mode.
    pub fn start_background_worker(&self) -> bool {
        if !self.inner.background.is_manual_run() {
            return false;
        }
        self.inner.background.wake();
        true
    }

    pub async fn has_background_task(&self) -> Result<bool> {
        Ok(self.inner.db.get_task(i64::MAX).await?.is_some())
    }

    /// Re-queues deletion passes that previously failed.
    pub async fn retry_all_deletion(&self) -> Result<()> {
        self.inner.db.clear_active_tasks().await?;
        self.inner.background.wake();
        Ok(())
    }

    // ---- mirror ----

    pub async fn set_all_mirrored(&self, mirrored: bool) -> Result<()> {
        self.inner.db.set_all_mirrored(mirrored).await
    }

    pub async fn set_backend_mirror_del_log_rpos(&self, rpos: i64) -> Result<()> {
        self.inner.mirror_del_log_rpos.store(rpos, Ordering::SeqCst);
        self.inner
            .db
            .set_misc_value(MIRROR_DEL_LOG_RPOS_KEY, &rpos.to_string())
            .await
    }

    pub fn get_backend_mirror_del_log_rpos(&self) -> i64 {
        self.inner.mirror_del_log_rpos.load(Ordering::SeqCst)
    }

    pub async fn mirror_stats(&self) -> Result<String> {
        let unmirrored = self.inner.db.get_unmirrored_objects_size().await?;
        Ok(format!(
            "{{ \"unmirrored_size\": {}\n, \"unmirrored_count\": {} }}\n",
            unmirrored.size, unmirrored.count
        ))
    }

    // ---- scrub ----

    pub fn start_scrub(&self, action: ScrubAction, position: &str) {
        let mut scrub = self.inner.scrub.lock().unwrap();
        if scrub.as_ref().map(|s| !s.is_done()).unwrap_or(false) {
            warn!("scrub already running");
            return;
        }
        let state = crate::scrub::spawn(self.inner.clone(), action, position.to_string());
        *scrub = Some(state);
    }

    pub fn stop_scrub(&self) {
        if let Some(state) = self.inner.scrub.lock().unwrap().as_ref() {
            state.quit();
        }
    }

    pub fn scrub_stats(&self) -> String {
        match self.inner.scrub.lock().unwrap().as_ref() {
            Some(state) => state.stats(),
            None => String::new(),
        }
    }

    pub fn scrub_position(&self) -> String {
        match self.inner.scrub.lock().unwrap().as_ref() {
            Some(state) => state.position(),
            None => String::new(),
        }
    }

    pub fn is_scrub_active(&self) -> bool {
        self.inner
            .scrub
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| !s.is_done())
            .unwrap_or(false)
    }

    /// `(oks, errors, repaired)` of the current or last scrub run.
    pub fn scrub_counters(&self) -> (i64, i64, i64) {
        match self.inner.scrub.lock().unwrap().as_ref() {
            Some(state) => (
                state.scrub_oks.load(Ordering::Relaxed),
                state.scrub_errors.load(Ordering::Relaxed),
                state.scrub_repaired.load(Ordering::Relaxed),
            ),
            None => (0, 0, 0),
        }
    }

    // ---- telemetry ----

    pub fn get_stats(&self) -> String {
        let inner = &self.inner;
        format!(
            "{{ \"total_size\": {}\n, \"total_num\": {}\n, \"init_complete\": {}\n, \
             \"uploaded_bytes\": {}\n, \"downloaded_bytes\": {}\n, \"del_ops\": {} }}\n",
            inner.objects_total_size.load(Ordering::Relaxed),
            inner.objects_total_num.load(Ordering::Relaxed),
            inner.objects_init_complete.load(Ordering::Relaxed),
            inner.backend.get_uploaded_bytes(),
            inner.backend.get_downloaded_bytes(),
            inner.total_del_ops.load(Ordering::Relaxed),
        )
    }

    pub fn meminfo(&self) -> String {
        let inner = &self.inner;
        let unsynced = inner.unsynced_keys.lock().unwrap();
        let mut out = format!(
            "##KvStore:\nunsynced keys: {}+{}\n",
            unsynced.curr.len(),
            unsynced.other.len()
        );
        drop(unsynced);
        out += &inner.put_db_worker.meminfo();
        out += &inner.backend.meminfo();
        if let Some(mirror) = &inner.backend_mirror {
            out += &mirror.meminfo();
        }
        out
    }

    pub fn reset_fail_bits(&self) {
        self.inner.fail_bits.reset();
    }

    pub fn fail_bits(&self) -> &FailBits {
        &self.inner.fail_bits
    }

    /// Stops the workers, flushing pending metadata first.
    pub async fn shutdown(&self) {
        self.stop_scrub();
        self.inner.background.quit();
        if let Some(state) = self.inner.scrub.lock().unwrap().take() {
            state.quit();
        }
        let workers = {
            let mut guard = self.workers.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            let _ = handle.await;
        }
        self.inner.put_db_worker.shutdown().await;
    }
}
