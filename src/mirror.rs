use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Timelike};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blob_store::{GetFlags, GetStatus, PutFlags, VecKeyStream};
use crate::error::Result;
use crate::frontend::{Inner, MIRROR_DEL_LOG_RPOS_KEY};
use crate::keys::md5sum;
use crate::meta_db::UnmirroredObject;

const CATCHUP_WAIT: Duration = Duration::from_secs(60);
const MIRROR_THREADS: usize = 4;
const DEL_LOG_BATCH: usize = 1000;

/// Replicates objects the primary accepted but the mirror has not seen,
/// and applies logged primary-side deletes to the mirror.
pub(crate) fn spawn(inner: Arc<Inner>) -> JoinHandle<()> {
    tokio::spawn(run(inner))
}

async fn run(inner: Arc<Inner>) {
    while !inner.background.is_startup_finished() {
        if inner.background.should_quit() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    while !inner.background.should_quit() {
        if !in_mirror_window(&inner.mirror_window) {
            inner.background.wait_wake(CATCHUP_WAIT).await;
            continue;
        }

        match catchup_pass(&inner).await {
            Ok(true) => {}
            Ok(false) => inner.background.wait_wake(CATCHUP_WAIT).await,
            Err(err) => {
                warn!(error = %err, "mirror catch-up failed");
                inner.background.wait_wake(CATCHUP_WAIT).await;
            }
        }
    }
}

/// "days/hours" window, e.g. "1-7/0-24"; empty means always. Days are
/// ISO weekdays (1 = Monday).
fn in_mirror_window(window: &str) -> bool {
    if window.is_empty() {
        return true;
    }
    let Some((days, hours)) = window.split_once('/') else {
        return true;
    };
    let now = chrono::Local::now();
    let day = now.weekday().number_from_monday() as i64;
    let hour = now.hour() as i64;
    in_range(days, day) && in_range(hours, hour)
}

fn in_range(spec: &str, value: i64) -> bool {
    match spec.split_once('-') {
        Some((lo, hi)) => {
            let lo: i64 = lo.trim().parse().unwrap_or(i64::MIN);
            let hi: i64 = hi.trim().parse().unwrap_or(i64::MAX);
            value >= lo && value < hi.max(lo + 1)
        }
        None => spec.trim().parse() == Ok(value),
    }
}

/// One mirror batch: ≤1000 unmirrored objects copied primary → mirror,
/// then logged deletes, then transaction-level bookkeeping. Returns
/// whether any replication work was found.
async fn catchup_pass(inner: &Arc<Inner>) -> Result<bool> {
    let batch = inner.db.get_unmirrored_objects().await?;
    if batch.is_empty() {
        apply_del_log(inner).await?;
        mark_mirrored_transactions(inner).await?;
        return Ok(false);
    }

    inner.background.set_mirror_pause(true);
    let res = mirror_batch(inner, batch).await;
    inner.background.set_mirror_pause(false);
    res?;
    Ok(true)
}

/// FIFO pipe between the batch reader and the per-object writers; each
/// writer keeps its own error flag, joined at the end of the batch.
async fn mirror_batch(inner: &Arc<Inner>, batch: Vec<UnmirroredObject>) -> Result<()> {
    let n = batch.len();
    let (tx, rx) = mpsc::channel::<UnmirroredObject>(MIRROR_THREADS * 2);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let has_error = Arc::new(AtomicBool::new(false));

    let mut writers = Vec::new();
    for idx in 0..MIRROR_THREADS.min(n) {
        let inner = inner.clone();
        let rx = rx.clone();
        let has_error = has_error.clone();
        writers.push(tokio::spawn(async move {
            let tmp = inner.data_path.join(format!("mirror_tmp_{idx}"));
            loop {
                let obj = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some(obj) = obj else { break };
                if let Err(err) = mirror_object(&inner, &obj, &tmp).await {
                    warn!(error = %err, "mirroring object failed");
                    has_error.store(true, Ordering::Relaxed);
                }
            }
            let _ = tokio::fs::remove_file(&tmp).await;
        }));
    }

    for obj in batch {
        if tx.send(obj).await.is_err() {
            break;
        }
    }
    drop(tx);
    for writer in writers {
        let _ = writer.await;
    }

    if has_error.load(Ordering::Relaxed) {
        return Err(crate::error::KvError::TransientBackend(
            "mirror batch had failures".to_string(),
        ));
    }
    debug!(n, "mirrored batch");
    Ok(())
}

async fn mirror_object(inner: &Arc<Inner>, obj: &UnmirroredObject, tmp: &std::path::Path) -> Result<()> {
    let mirror = inner.backend_mirror.as_ref().expect("mirror worker without mirror");
    let key = inner.encode_backend_key(0, &obj.tkey, obj.trans_id);

    let res = inner
        .backend
        .get(&key, md5sum(&obj.md5sum), GetFlags::BACKGROUND, tmp)
        .await?;
    if res.status.contains(GetStatus::NOT_FOUND) {
        // reclaimed between the scan and the read; nothing to replicate
        inner.db.set_object_mirrored(obj.id).await?;
        return Ok(());
    }

    mirror
        .put(&key, tmp, PutFlags::ALREADY_COMPRESSED_ENCRYPTED)
        .await?;
    inner.db.set_object_mirrored(obj.id).await?;
    Ok(())
}

/// Applies primary-side deletes recorded in the mirror-delete log.
async fn apply_del_log(inner: &Arc<Inner>) -> Result<()> {
    let mirror = inner.backend_mirror.as_ref().expect("mirror worker without mirror");
    loop {
        let mut keys = Vec::new();
        while keys.len() < DEL_LOG_BATCH {
            match inner.next_del_mirror_item()? {
                Some(key) => keys.push(key),
                None => break,
            }
        }
        if keys.is_empty() {
            return Ok(());
        }
        let n = keys.len();
        let mut stream = VecKeyStream::new(keys);
        mirror.del(&mut stream, None, false).await?;
        inner
            .db
            .set_misc_value(
                MIRROR_DEL_LOG_RPOS_KEY,
                &inner.mirror_del_log_rpos.load(Ordering::SeqCst).to_string(),
            )
            .await?;
        info!(n, "applied mirror deletes");
    }
}

/// Transactions whose objects are all mirrored get the flag themselves.
async fn mark_mirrored_transactions(inner: &Arc<Inner>) -> Result<()> {
    for trans in inner.db.get_unmirrored_transactions().await? {
        if !inner.db.has_unmirrored_objects(trans.id).await? {
            inner.db.set_transaction_mirrored(trans.id).await?;
        }
    }
    Ok(())
}
