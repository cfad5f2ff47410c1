use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collector::{DeleteHooks, ObjectCollector, DEFAULT_STRIDE_SIZE};
use crate::error::Result;
use crate::frontend::Inner;
use crate::keys::locinfo;
use crate::meta_db::TASK_DELETE_PASS;

const IDLE_WAIT: Duration = Duration::from_millis(500);
const ERROR_WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct PauseFlags {
    user: bool,
    scrub: bool,
    mirror: bool,
}

/// Shared control block of the reclamation worker. The three pause flags
/// are independent; the worker pauses on their OR at its next checkpoint.
pub struct BackgroundCtl {
    pause: Mutex<PauseFlags>,
    manual_run: bool,
    manual_trigger: AtomicBool,
    do_quit: AtomicBool,
    notify: Notify,
    running: AtomicBool,
    paused: AtomicBool,
    startup_finished: AtomicBool,
    nwork: AtomicI64,
}

impl BackgroundCtl {
    pub(crate) fn new(manual_run: bool) -> Self {
        Self {
            pause: Mutex::new(PauseFlags::default()),
            manual_run,
            manual_trigger: AtomicBool::new(false),
            do_quit: AtomicBool::new(false),
            notify: Notify::new(),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            startup_finished: AtomicBool::new(false),
            nwork: AtomicI64::new(0),
        }
    }

    pub fn set_pause(&self, b: bool) {
        self.pause.lock().unwrap().user = b;
        self.notify.notify_waiters();
    }

    pub fn set_scrub_pause(&self, b: bool) {
        self.pause.lock().unwrap().scrub = b;
        self.notify.notify_waiters();
    }

    pub fn set_mirror_pause(&self, b: bool) {
        self.pause.lock().unwrap().mirror = b;
        self.notify.notify_waiters();
    }

    pub fn get_pause(&self) -> bool {
        let flags = self.pause.lock().unwrap();
        flags.user || flags.scrub || flags.mirror
    }

    pub fn user_paused(&self) -> bool {
        self.pause.lock().unwrap().user
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn is_startup_finished(&self) -> bool {
        self.startup_finished.load(Ordering::Relaxed)
    }

    pub fn is_manual_run(&self) -> bool {
        self.manual_run
    }

    pub fn get_nwork(&self) -> i64 {
        self.nwork.load(Ordering::Relaxed)
    }

    pub fn wake(&self) {
        self.manual_trigger.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn quit(&self) {
        self.do_quit.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn should_quit(&self) -> bool {
        self.do_quit.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_wake(&self, timeout: Duration) {
        let mut notified = std::pin::pin!(self.notify.notified());
        // register before re-checking quit, or a wake in between is lost
        notified.as_mut().enable();
        if self.should_quit() {
            return;
        }
        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }
}

pub(crate) fn spawn(inner: Arc<Inner>) -> JoinHandle<()> {
    tokio::spawn(run(inner))
}

async fn run(inner: Arc<Inner>) {
    let ctl = &inner.background;
    ctl.running.store(true, Ordering::Relaxed);

    if let Err(err) = startup_recovery(&inner).await {
        error!(error = %err, "deletion task recovery failed");
    }
    ctl.startup_finished.store(true, Ordering::Relaxed);
    info!("background worker startup finished");

    loop {
        if ctl.should_quit() {
            break;
        }
        if ctl.get_pause() {
            ctl.paused.store(true, Ordering::Relaxed);
            ctl.wait_wake(IDLE_WAIT).await;
            continue;
        }
        ctl.paused.store(false, Ordering::Relaxed);

        if ctl.manual_run && !ctl.manual_trigger.swap(false, Ordering::SeqCst) {
            ctl.wait_wake(IDLE_WAIT).await;
            continue;
        }

        match process_next_task(&inner).await {
            Ok(true) => {
                ctl.nwork.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                if ctl.manual_run {
                    ctl.manual_trigger.store(false, Ordering::SeqCst);
                }
                ctl.wait_wake(IDLE_WAIT).await;
            }
            Err(err) => {
                // the task stays queued; transient backend errors and
                // ENOSPC retry on a later pass
                warn!(error = %err, "deletion pass failed");
                ctl.wait_wake(ERROR_WAIT).await;
            }
        }
    }

    ctl.running.store(false, Ordering::Relaxed);
}

/// Re-submits collector files persisted before a crash (their metadata
/// rows are already gone, only the backend deletes may be missing), then
/// re-seeds deletion tasks for reclaimable transactions that lost theirs.
async fn startup_recovery(inner: &Arc<Inner>) -> Result<()> {
    let mut dir = match tokio::fs::read_dir(&inner.data_path).await {
        Ok(dir) => dir,
        Err(_) => return Ok(()),
    };

    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("collector") {
            continue;
        }
        info!(?path, "resuming persisted deletion batch");
        let collector = match ObjectCollector::load(&path) {
            Ok(c) => c,
            Err(err) => {
                error!(?path, error = %err, "unreadable collector file");
                continue;
            }
        };
        let task_id = collector.task_id;
        backend_del_collector(inner, collector, false).await?;
        inner.db.remove_task(task_id).await?;
        tokio::fs::remove_file(&path).await?;
    }

    inner.db.insert_all_deletion_tasks().await?;
    Ok(())
}

/// Takes the oldest eligible deletion task and runs one reclamation pass.
/// Returns whether there was a task to run.
async fn process_next_task(inner: &Arc<Inner>) -> Result<bool> {
    let Some(task) = inner.db.get_task(inner.now()).await? else {
        return Ok(false);
    };
    inner.db.set_task_active(task.id).await?;

    if task.task_id == TASK_DELETE_PASS {
        reclaim_transaction(inner, task.cd_id, task.trans_id, task.id).await?;
    } else {
        warn!(task_id = task.task_id, "dropping unknown task");
    }

    inner.db.remove_task(task.id).await?;
    Ok(true)
}

/// Deletes object rows superseded by `curr_trans_id` and their backend
/// blobs, then drops transactions that ended up empty.
async fn reclaim_transaction(
    inner: &Arc<Inner>,
    cd_id: i64,
    curr_trans_id: i64,
    task_id: i64,
) -> Result<()> {
    let backend = &inner.backend;
    let deletable = inner
        .db
        .get_deletable_objects(cd_id, curr_trans_id, backend.ordered_del())
        .await?;

    if !deletable.is_empty() {
        let with_locinfo = backend.del_with_location_info();
        let mut collector = ObjectCollector::new(
            cd_id,
            -1,
            DEFAULT_STRIDE_SIZE,
            inner.backend_mirror.is_some(),
            with_locinfo,
        );
        let mut freed_size = 0i64;
        let mut trans_ids = Vec::new();
        let mut deleted_pairs = Vec::new();
        for obj in &deletable {
            collector.add(
                obj.trans_id,
                &obj.tkey,
                with_locinfo.then(|| locinfo(&obj.md5sum)),
                obj.mirrored,
            )?;
            freed_size += obj.size;
            if trans_ids.last() != Some(&obj.trans_id) {
                trans_ids.push(obj.trans_id);
            }
            deleted_pairs.push((obj.trans_id, obj.tkey.clone()));
        }
        trans_ids.sort_unstable();
        trans_ids.dedup();

        // persist before touching the backend so a crash after the row
        // deletes can resume the blob deletes
        let file = inner.data_path.join(format!("task_{task_id}.collector"));
        collector.persist(task_id, 2, 1, &trans_ids, &file)?;

        inner.db.delete_deletable_objects(cd_id, curr_trans_id).await?;

        // a concurrent scrub must not flag these as missing
        if let Some(scrub) = inner.scrub.lock().unwrap().as_ref() {
            scrub.add_deleted_objects(cd_id, &deleted_pairs);
        }

        backend_del_collector(inner, collector, inner.multi_trans_delete).await?;
        tokio::fs::remove_file(&file).await?;

        inner.objects_total_size.fetch_sub(freed_size, Ordering::Relaxed);
        inner
            .objects_total_num
            .fetch_sub(deletable.len() as i64, Ordering::Relaxed);
        debug!(
            n = deletable.len(),
            curr_trans_id, "reclaimed superseded objects"
        );
    }

    for trans_id in inner.db.get_deletable_transactions(cd_id, curr_trans_id).await? {
        inner.db.delete_transaction(cd_id, trans_id).await?;
        debug!(trans_id, "dropped empty transaction");
    }
    Ok(())
}

/// Streams the collector's chunks into `BlobStore::del`, at most
/// `num_del_parallel` chunk deletions in flight.
async fn backend_del_collector(
    inner: &Arc<Inner>,
    collector: ObjectCollector,
    background_queue: bool,
) -> Result<()> {
    if collector.is_empty() {
        return Ok(());
    }
    let hooks: Arc<dyn DeleteHooks> = inner.clone();
    let (key_streams, locinfo_streams) = collector.finalize(hooks)?;

    let parallel = inner.backend.num_del_parallel().max(1);
    let mut in_flight = FuturesUnordered::new();
    let mut pairs = key_streams.into_iter().zip(locinfo_streams);

    loop {
        while in_flight.len() < parallel {
            let Some((mut keys, mut locinfo)) = pairs.next() else {
                break;
            };
            let backend = inner.backend.clone();
            in_flight.push(tokio::spawn(async move {
                let locinfo_ref = locinfo.as_deref_mut();
                backend.del(keys.as_mut(), locinfo_ref, background_queue).await
            }));
        }
        match in_flight.next().await {
            None => break,
            Some(join) => {
                join.map_err(|e| crate::error::KvError::TransientBackend(e.to_string()))??
            }
        }
    }
    Ok(())
}
