use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cloudkv::frontend::{KvStore, StoreOptions};
use cloudkv::keys::{encode_key, prefix_key};
use cloudkv::meta_db::MetaDb;
use cloudkv::{BlobStore, KvError, MemBackend, PutFlags, ScrubAction};
use tempfile::TempDir;

struct Harness {
    store: KvStore,
    backend: Arc<MemBackend>,
    mirror: Option<Arc<MemBackend>>,
    dir: TempDir,
    n_tmp: std::sync::atomic::AtomicUsize,
}

impl Harness {
    async fn new() -> Self {
        Self::create(false).await
    }

    async fn with_mirror() -> Self {
        Self::create(true).await
    }

    async fn create(with_mirror: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemBackend::new());
        let mirror = with_mirror.then(|| Arc::new(MemBackend::new()));

        let mut options = StoreOptions::new(
            dir.path().join("meta.db"),
            dir.path().join("data"),
            backend.clone(),
        );
        options.backend_mirror = mirror.clone().map(|m| m as Arc<dyn BlobStore>);
        let store = KvStore::open(options).await.unwrap();
        Self {
            store,
            backend,
            mirror,
            dir,
            n_tmp: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let n = self.n_tmp.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.dir.path().join(format!("tmp_{n}"))
    }

    async fn put(&self, cd_id: i64, tkey: &[u8], transid: i64, body: &[u8]) -> i64 {
        let src = self.tmp_path();
        tokio::fs::write(&src, body).await.unwrap();
        self.store
            .put(cd_id, tkey, transid, 0, &src, PutFlags::empty())
            .await
            .unwrap()
    }

    async fn get(&self, cd_id: i64, tkey: &[u8], transid: i64) -> Result<Vec<u8>, KvError> {
        let dst = self.tmp_path();
        self.store.get(cd_id, tkey, transid, &dst).await?;
        Ok(tokio::fs::read(&dst).await.unwrap())
    }

    fn blob_key(&self, cd_id: i64, tkey: &[u8], transid: i64) -> String {
        prefix_key(&encode_key(cd_id, tkey, transid))
    }

    /// Polls `cond`, nudging the workers awake, until it holds or the
    /// timeout expires.
    async fn wait_for(&self, what: &str, cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            self.store.enable_background_worker(true);
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {what}");
    }
}

#[tokio::test]
async fn put_get_single_tenant() {
    let h = Harness::new().await;
    let t1 = h.store.new_transaction(0).await.unwrap();
    assert_eq!(t1, 1);

    h.put(0, b"a", t1, b"hello").await;
    h.store.transaction_finalize(0, t1, true).await.unwrap();
    h.store.sync().await.unwrap();

    assert_eq!(h.get(0, b"a", t1).await.unwrap(), b"hello");
    h.store.shutdown().await;
}

#[tokio::test]
async fn overwrite_across_transactions() {
    let h = Harness::new().await;
    let t1 = h.store.new_transaction(0).await.unwrap();
    h.put(0, b"a", t1, b"v1").await;
    h.store.transaction_finalize(0, t1, true).await.unwrap();

    let t2 = h.store.new_transaction(0).await.unwrap();
    h.put(0, b"a", t2, b"v2").await;
    h.store.transaction_finalize(0, t2, true).await.unwrap();
    h.store.sync().await.unwrap();

    assert_eq!(h.get(0, b"a", t2).await.unwrap(), b"v2");
    // the old revision stays readable until reclamation catches up
    let old = h.get(0, b"a", t1).await;
    assert!(matches!(old, Ok(ref v) if v == b"v1") || matches!(old, Err(KvError::NotFound)));
    h.store.shutdown().await;
}

#[tokio::test]
async fn tombstone_hides_key_per_transaction() {
    let h = Harness::new().await;
    let t1 = h.store.new_transaction(0).await.unwrap();
    h.put(0, b"a", t1, b"x").await;
    h.store.transaction_finalize(0, t1, true).await.unwrap();
    h.store.sync().await.unwrap();

    let t2 = h.store.new_transaction(0).await.unwrap();
    h.store.del(0, &[b"a".to_vec()], t2).await.unwrap();

    // visible immediately, before any sync
    assert!(matches!(h.get(0, b"a", t2).await, Err(KvError::NotFound)));
    assert_eq!(h.get(0, b"a", t1).await.unwrap(), b"x");

    h.store.transaction_finalize(0, t2, true).await.unwrap();
    h.store.sync().await.unwrap();
    assert!(matches!(h.get(0, b"a", t2).await, Err(KvError::NotFound)));
    h.store.shutdown().await;
}

#[tokio::test]
async fn reclamation_removes_superseded_blobs() {
    let h = Harness::new().await;
    let t1 = h.store.new_transaction(0).await.unwrap();
    h.put(0, b"a", t1, b"v1").await;
    h.store.transaction_finalize(0, t1, true).await.unwrap();
    h.store.sync().await.unwrap();

    let t2 = h.store.new_transaction(0).await.unwrap();
    h.put(0, b"a", t2, b"v2").await;
    h.store.sync().await.unwrap();
    h.store.set_active_transactions(0, &[t1, t2]).await.unwrap();
    h.store.transaction_finalize(0, t2, true).await.unwrap();

    let old_key = h.blob_key(0, b"a", t1);
    assert!(h.backend.contains(&old_key));
    h.wait_for("old blob reclaimed", || !h.backend.contains(&old_key))
        .await;

    assert_eq!(h.get(0, b"a", t2).await.unwrap(), b"v2");
    assert!(matches!(h.get(0, b"a", t1).await, Err(KvError::NotFound)));

    // the emptied transaction row goes away too
    h.store.set_active_transactions(0, &[t2]).await.unwrap();
    h.store.shutdown().await;
}

#[tokio::test]
async fn startup_reseeds_lost_deletion_tasks() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(MemBackend::new());
    let db_path = dir.path().join("meta.db");
    let data_path = dir.path().join("data");

    // manual-run worker, paused: queued passes survive until shutdown
    let mut options = StoreOptions::new(db_path.clone(), data_path.clone(), backend.clone());
    options.background_worker_manual_run = true;
    let store = KvStore::open(options).await.unwrap();
    store.enable_background_worker(false);

    let t1 = store.new_transaction(0).await.unwrap();
    let src = dir.path().join("v1");
    tokio::fs::write(&src, b"v1").await.unwrap();
    store.put(0, b"a", t1, 0, &src, PutFlags::empty()).await.unwrap();
    store.transaction_finalize(0, t1, false).await.unwrap();

    let t2 = store.new_transaction(0).await.unwrap();
    let src = dir.path().join("v2");
    tokio::fs::write(&src, b"v2").await.unwrap();
    store.put(0, b"a", t2, 0, &src, PutFlags::empty()).await.unwrap();
    store.sync().await.unwrap();
    store.transaction_finalize(0, t2, true).await.unwrap();
    store.shutdown().await;

    // drop the queued passes, as a crash before processing would
    let db = MetaDb::open(&db_path).await.unwrap();
    while let Some(task) = db.get_task(i64::MAX).await.unwrap() {
        db.remove_task(task.id).await.unwrap();
    }
    drop(db);

    let old_key = prefix_key(&encode_key(0, b"a", t1));
    assert!(backend.contains(&old_key));

    // reopening seeds fresh deletion tasks for the committed history
    let store = KvStore::open(StoreOptions::new(db_path, data_path, backend.clone()))
        .await
        .unwrap();
    for _ in 0..400 {
        if !backend.contains(&old_key) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(!backend.contains(&old_key));
    store.shutdown().await;
}

#[tokio::test]
async fn unsynced_read_sees_latest_put() {
    let h = Harness::new().await;
    let t1 = h.store.new_transaction(0).await.unwrap();
    h.put(0, b"k", t1, b"fresh").await;
    // no sync; resolution goes through the unsynced-key cache
    assert_eq!(h.get(0, b"k", t1).await.unwrap(), b"fresh");
    h.store.shutdown().await;
}

#[tokio::test]
async fn get_transid_resolves_and_falls_back() {
    let h = Harness::new().await;
    let t1 = h.store.new_transaction(0).await.unwrap();
    h.put(0, b"a", t1, b"v1").await;
    h.store.transaction_finalize(0, t1, true).await.unwrap();
    h.store.sync().await.unwrap();

    let t2 = h.store.new_transaction(0).await.unwrap();
    h.store.del(0, &[b"a".to_vec()], t2).await.unwrap();
    h.store.sync().await.unwrap();

    assert_eq!(h.store.get_transid(0, b"a", t1).await.unwrap(), Some(t1));
    // at t2 the marker wins; the fallback revision is still t1
    assert_eq!(h.store.get_transid(0, b"a", t2).await.unwrap(), Some(t1));
    h.store.shutdown().await;
}

#[tokio::test]
async fn finalize_is_idempotent() {
    let h = Harness::new().await;
    let t1 = h.store.new_transaction(0).await.unwrap();
    h.put(0, b"a", t1, b"v").await;
    h.store.transaction_finalize(0, t1, true).await.unwrap();
    h.store.transaction_finalize(0, t1, true).await.unwrap();
    h.store.transaction_finalize(0, t1, false).await.unwrap();
    h.store.sync().await.unwrap();
    assert_eq!(h.get(0, b"a", t1).await.unwrap(), b"v");
    h.store.shutdown().await;
}

#[tokio::test]
async fn generation_inc_is_monotonic_under_contention() {
    let h = Arc::new(Harness::new().await);
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move {
            let mut values = Vec::new();
            for _ in 0..50 {
                values.push(h.store.generation_inc(2).await.unwrap());
            }
            values
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 8 * 50);
    assert_eq!(*all.last().unwrap(), 8 * 50 * 2);

    assert_eq!(h.store.get_generation(0).await.unwrap(), 8 * 50 * 2);
}

#[tokio::test]
async fn mirror_catches_up_and_applies_deletes() {
    let h = Harness::with_mirror().await;
    let mirror = h.mirror.clone().unwrap();

    let t1 = h.store.new_transaction(0).await.unwrap();
    h.put(0, b"m", t1, b"copy me").await;
    h.store.transaction_finalize(0, t1, true).await.unwrap();
    h.store.sync().await.unwrap();

    let key_t1 = h.blob_key(0, b"m", t1);
    h.wait_for("object mirrored", || mirror.contains(&key_t1)).await;

    // supersede; the primary delete must propagate through the del log
    let t2 = h.store.new_transaction(0).await.unwrap();
    h.put(0, b"m", t2, b"copy me too").await;
    h.store.sync().await.unwrap();
    h.store.transaction_finalize(0, t2, true).await.unwrap();

    h.wait_for("primary reclaimed", || !h.backend.contains(&key_t1)).await;
    h.wait_for("mirror delete applied", || !mirror.contains(&key_t1)).await;
    assert!(h.store.get_backend_mirror_del_log_rpos() > 0);
    h.store.shutdown().await;
}

#[tokio::test]
async fn scrub_counts_hash_mismatches() {
    let h = Harness::new().await;
    let t1 = h.store.new_transaction(0).await.unwrap();
    for key in [&b"s1"[..], b"s2", b"s3"] {
        h.put(0, key, t1, b"content").await;
    }
    h.store.transaction_finalize(0, t1, true).await.unwrap();
    h.store.sync().await.unwrap();

    // corrupt one object behind the store's back
    let src = h.tmp_path();
    tokio::fs::write(&src, b"tampered").await.unwrap();
    h.backend
        .put(&h.blob_key(0, b"s2", t1), &src, PutFlags::empty())
        .await
        .unwrap();

    h.store.start_scrub(ScrubAction::Scrub, "");
    h.wait_for("scrub done", || !h.store.is_scrub_active()).await;

    let (oks, errors, repaired) = h.store.scrub_counters();
    assert_eq!(oks, 2);
    assert_eq!(errors, 1);
    assert_eq!(repaired, 0);
    h.store.shutdown().await;
}

#[tokio::test]
async fn rebuild_deletes_orphaned_backend_objects() {
    let h = Harness::new().await;
    let t1 = h.store.new_transaction(0).await.unwrap();
    h.put(0, b"keep", t1, b"real").await;
    h.store.transaction_finalize(0, t1, true).await.unwrap();
    h.store.sync().await.unwrap();

    // an object the metadata knows nothing about
    let orphan_key = h.blob_key(0, b"orphan", 9);
    let src = h.tmp_path();
    tokio::fs::write(&src, b"stray").await.unwrap();
    h.backend.put(&orphan_key, &src, PutFlags::empty()).await.unwrap();

    h.store.start_scrub(ScrubAction::Rebuild, "");
    h.wait_for("rebuild done", || !h.store.is_scrub_active()).await;

    assert!(!h.backend.contains(&orphan_key));
    assert!(h.backend.contains(&h.blob_key(0, b"keep", t1)));
    h.store.shutdown().await;
}

#[tokio::test]
async fn collector_fidelity_at_scale() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("task_9.collector");

    struct Hooks;
    impl cloudkv::collector::DeleteHooks for Hooks {
        fn backend_key(&self, cd_id: i64, tkey: &[u8], transid: i64) -> String {
            prefix_key(&encode_key(cd_id, tkey, transid))
        }
    }

    let mut collector = cloudkv::ObjectCollector::new(0, -1, 8192, false, false);
    let mut want = Vec::new();
    for i in 0..25_000i64 {
        let tkey = format!("object-{i:07}").into_bytes();
        collector.add(i % 11 + 1, &tkey, None, false).unwrap();
        want.push(prefix_key(&encode_key(0, &tkey, i % 11 + 1)));
    }
    collector.persist(9, 2, 1, &[3], &path).unwrap();

    // reload as a fresh process would
    let loaded = cloudkv::ObjectCollector::load(&path).unwrap();
    assert_eq!(loaded.len(), 25_000);
    let (streams, _) = loaded.finalize(Arc::new(Hooks)).unwrap();

    let mut emitted = 0usize;
    let mut replayed = 0usize;
    let mut got = Vec::new();
    for (idx, mut stream) in streams.into_iter().enumerate() {
        let mut in_chunk = 0usize;
        while let Some(key) = stream.next() {
            // one mid-stream restart while draining the first chunk
            if idx == 0 && in_chunk == 1_000 && replayed == 0 {
                stream.reset();
                replayed = got.len();
                got.clear();
                in_chunk = 0;
                continue;
            }
            got.push(key);
            in_chunk += 1;
            emitted += 1;
        }
        if idx == 0 {
            assert_eq!(got, want[..8192].to_vec());
            got.clear();
        }
    }
    assert_eq!(got, want[8192..].to_vec());
    assert_eq!(replayed, 1_000);
    // everything once, plus the restarted prefix
    assert_eq!(emitted, 25_000 + 1_000);
}

#[tokio::test]
async fn file_index_multi_tenant_scenario() {
    let dir = TempDir::new().unwrap();
    let index = cloudkv::FileEntryIndex::open(&dir.path().join("fileindex")).unwrap();

    let hash = [0xabu8; 16];
    index.put(&cloudkv::IndexKey::new(hash, 5, 1), 10).unwrap();
    index.put(&cloudkv::IndexKey::new(hash, 5, 2), 20).unwrap();

    let all = index.get_all_clients(&cloudkv::IndexKey::new(hash, 5, 0)).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[&1], 10);
    assert_eq!(all[&2], 20);
    assert_eq!(
        index.get_prefer_client(&cloudkv::IndexKey::new(hash, 5, 2)).unwrap(),
        Some(20)
    );
}

#[tokio::test]
async fn stats_and_meminfo_render() {
    let h = Harness::new().await;
    let t1 = h.store.new_transaction(0).await.unwrap();
    h.put(0, b"a", t1, b"abc").await;
    h.store.sync().await.unwrap();

    let stats = h.store.get_stats();
    assert!(stats.contains("\"total_num\": 1"));
    assert!(h.store.meminfo().contains("##KvStore"));
    h.store.shutdown().await;
}

#[tokio::test]
async fn put_refused_after_fail_bit() {
    let h = Harness::new().await;
    let t1 = h.store.new_transaction(0).await.unwrap();

    // simulate a corruption latch and make sure writes refuse
    let src = h.tmp_path();
    tokio::fs::write(&src, b"x").await.unwrap();
    h.store.put(0, b"ok", t1, 0, &src, PutFlags::empty()).await.unwrap();

    fail_latch(&h).await;
    let res = h.store.put(0, b"no", t1, 0, &src, PutFlags::empty()).await;
    assert!(matches!(res, Err(KvError::Corruption(_))));

    h.store.reset_fail_bits();
    h.store.put(0, b"yes", t1, 0, &src, PutFlags::empty()).await.unwrap();
    h.store.shutdown().await;
}

async fn fail_latch(h: &Harness) {
    // negative transids are refused before any state changes
    let src = h.dir.path().join("probe");
    tokio::fs::write(&src, b"p").await.unwrap();
    assert!(matches!(
        h.store.put(0, b"p", -1, 0, &src, PutFlags::empty()).await,
        Err(KvError::Misuse(_))
    ));
    h.store.fail_bits().set(cloudkv::FailBits::DATABASE_CORRUPTED);
}
