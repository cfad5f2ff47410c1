use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::blob_store::{GetFlags, GetStatus, PutFlags, VecKeyStream};
use crate::error::Result;
use crate::frontend::Inner;
use crate::keys::md5sum;
use crate::meta_db::IterObject;

const QUEUE_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubAction {
    Balance,
    Rebuild,
    Scrub,
}

impl ScrubAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrubAction::Balance => "balance",
            ScrubAction::Rebuild => "rebuild",
            ScrubAction::Scrub => "scrub",
        }
    }
}

/// Shared state of one scrub run; survives as a handle for stats and
/// stop requests after the run finishes.
pub struct ScrubState {
    pub action: ScrubAction,
    do_quit: AtomicBool,
    done: AtomicBool,
    position: Mutex<String>,
    pub scrub_oks: AtomicI64,
    pub scrub_errors: AtomicI64,
    pub scrub_repaired: AtomicI64,
    done_size: AtomicI64,
    total_size: AtomicI64,
    complete_pc: AtomicI64,
    curr_paused: AtomicBool,
    // objects legally reclaimed while the scrub runs; not errors
    deleted_objects: Mutex<HashSet<(i64, Vec<u8>)>>,
}

impl ScrubState {
    pub fn quit(&self) {
        self.do_quit.store(true, Ordering::SeqCst);
    }

    fn should_quit(&self) -> bool {
        self.do_quit.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn position(&self) -> String {
        self.position.lock().unwrap().clone()
    }

    pub fn stats(&self) -> String {
        format!(
            "{{ \"done_size\": {}\n,\"total_size\": {}\n,\"paused\": {}\n,\"complete_pc\": {} }}\n",
            self.done_size.load(Ordering::Relaxed),
            self.total_size.load(Ordering::Relaxed),
            i64::from(self.curr_paused.load(Ordering::Relaxed)),
            self.complete_pc.load(Ordering::Relaxed),
        )
    }

    pub fn add_deleted_objects(&self, _cd_id: i64, pairs: &[(i64, Vec<u8>)]) {
        let mut deleted = self.deleted_objects.lock().unwrap();
        for pair in pairs {
            deleted.insert(pair.clone());
        }
    }

    fn was_deleted(&self, trans_id: i64, tkey: &[u8]) -> bool {
        self.deleted_objects
            .lock()
            .unwrap()
            .contains(&(trans_id, tkey.to_vec()))
    }

    fn advance(&self, item: &IterObject, with_last_modified: bool) {
        let mut pos = self.position.lock().unwrap();
        *pos = if with_last_modified {
            item.last_modified.to_string()
        } else {
            format!(
                "{}|{}",
                hex_simd::encode_to_string(&item.tkey, hex_simd::AsciiCase::Lower),
                item.trans_id
            )
        };
        let done = self.done_size.fetch_add(item.size, Ordering::Relaxed) + item.size;
        let total = self.total_size.load(Ordering::Relaxed);
        if total > 0 {
            self.complete_pc.store((done * 100 / total).min(100), Ordering::Relaxed);
        }
    }
}

fn parse_position(position: &str, with_last_modified: bool) -> (Vec<u8>, i64) {
    if with_last_modified {
        return (Vec::new(), position.parse().unwrap_or(0));
    }
    match position.split_once('|') {
        Some((hexkey, transid)) => (
            hex_simd::decode_to_vec(hexkey).unwrap_or_default(),
            transid.parse().unwrap_or(0),
        ),
        None => (Vec::new(), 0),
    }
}

/// Starts a scrub/rebuild/balance run: one database producer feeding
/// `num_scrub_parallel` verification consumers.
pub(crate) fn spawn(inner: Arc<Inner>, action: ScrubAction, position: String) -> Arc<ScrubState> {
    let state = Arc::new(ScrubState {
        action,
        do_quit: AtomicBool::new(false),
        done: AtomicBool::new(false),
        position: Mutex::new(position),
        scrub_oks: AtomicI64::new(0),
        scrub_errors: AtomicI64::new(0),
        scrub_repaired: AtomicI64::new(0),
        done_size: AtomicI64::new(0),
        total_size: AtomicI64::new(0),
        complete_pc: AtomicI64::new(0),
        curr_paused: AtomicBool::new(false),
        deleted_objects: Mutex::new(HashSet::new()),
    });

    let run_state = state.clone();
    tokio::spawn(async move {
        info!(action = run_state.action.as_str(), "scrub starting");
        if let Err(err) = run(inner, run_state.clone()).await {
            warn!(error = %err, "scrub failed");
            run_state.scrub_errors.fetch_add(1, Ordering::Relaxed);
        }
        run_state.done.store(true, Ordering::SeqCst);
        info!(action = run_state.action.as_str(), "scrub finished");
    });
    state
}

async fn run(inner: Arc<Inner>, state: Arc<ScrubState>) -> Result<()> {
    // balance moves objects around; the deletion queue must not race it
    if state.action == ScrubAction::Balance {
        inner.background.set_scrub_pause(true);
    }
    let res = run_inner(&inner, &state).await;
    if state.action == ScrubAction::Balance {
        inner.background.set_scrub_pause(false);
    }
    res
}

async fn run_inner(inner: &Arc<Inner>, state: &Arc<ScrubState>) -> Result<()> {
    let with_last_modified = inner.backend.prefer_sequential_read();
    let start_position = state.position();

    let totals = inner.db.get_size().await?;
    state.total_size.store(totals.size, Ordering::Relaxed);
    if !start_position.is_empty() {
        let (tkey, transid) = parse_position(&start_position, with_last_modified);
        let remaining = if with_last_modified {
            inner.db.get_size_partial_lm(transid, None).await?
        } else {
            inner.db.get_size_partial(&tkey, transid).await?
        };
        state
            .done_size
            .store(totals.size - remaining, Ordering::Relaxed);
    }

    let (tx, rx) = mpsc::channel::<IterObject>(QUEUE_DEPTH);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let n_consumers = inner.backend.num_scrub_parallel().max(1);
    let new_md5sums: Arc<Mutex<Vec<IterObject>>> = Arc::new(Mutex::new(Vec::new()));

    let mut consumers = Vec::new();
    for idx in 0..n_consumers {
        let inner = inner.clone();
        let state = state.clone();
        let rx = rx.clone();
        let new_md5sums = new_md5sums.clone();
        consumers.push(tokio::spawn(async move {
            let tmp = inner.data_path.join(format!("scrub_tmp_{idx}"));
            loop {
                let item = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some(item) = item else { break };
                scrub_one(&inner, &state, item, &tmp, &new_md5sums).await;
            }
            let _ = tokio::fs::remove_file(&tmp).await;
        }));
    }

    // producer: page through live objects from the saved cursor
    let (mut tkey, mut transid) = if start_position.is_empty() {
        (Vec::new(), 0)
    } else {
        parse_position(&start_position, with_last_modified)
    };
    'produce: loop {
        if state.should_quit() {
            break;
        }
        while inner.background.user_paused() {
            state.curr_paused.store(true, Ordering::Relaxed);
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            if state.should_quit() {
                break 'produce;
            }
        }
        state.curr_paused.store(false, Ordering::Relaxed);

        let page = if with_last_modified {
            inner.db.get_iter_objects_lm(transid, None).await?
        } else {
            inner.db.get_iter_objects(&tkey, transid).await?
        };
        let Some(last) = page.last() else { break };
        if with_last_modified {
            transid = last.last_modified + 1;
        } else {
            tkey = last.tkey.clone();
            transid = last.trans_id;
        }
        for item in page {
            if tx.send(item).await.is_err() {
                break 'produce;
            }
        }
    }
    drop(tx);
    for consumer in consumers {
        let _ = consumer.await;
    }

    // repaired hashes learned during the run land back in the metadata
    let updates = std::mem::take(&mut *new_md5sums.lock().unwrap());
    for item in updates {
        inner
            .db
            .update_object_md5sum(0, &item.md5sum, item.trans_id, &item.tkey)
            .await?;
    }

    if state.action == ScrubAction::Rebuild && !state.should_quit() {
        rebuild_reconcile(inner).await?;
    }

    state.complete_pc.store(100, Ordering::Relaxed);
    Ok(())
}

async fn scrub_one(
    inner: &Arc<Inner>,
    state: &Arc<ScrubState>,
    item: IterObject,
    tmp: &std::path::Path,
    new_md5sums: &Arc<Mutex<Vec<IterObject>>>,
) {
    let with_last_modified = inner.backend.prefer_sequential_read();
    let key = inner.encode_backend_key(0, &item.tkey, item.trans_id);
    let flags = match state.action {
        ScrubAction::Scrub => GetFlags::SCRUB | GetFlags::BACKGROUND,
        ScrubAction::Rebuild => {
            GetFlags::REBUILD | GetFlags::IGNORE_READ_ERRORS | GetFlags::BACKGROUND
        }
        ScrubAction::Balance => GetFlags::REBALANCE | GetFlags::BACKGROUND,
    };

    match inner.backend.get(&key, md5sum(&item.md5sum), flags, tmp).await {
        Ok(res) if res.status.contains(GetStatus::NOT_FOUND) => {
            if state.was_deleted(item.trans_id, &item.tkey) {
                state.scrub_oks.fetch_add(1, Ordering::Relaxed);
            } else {
                warn!(trans_id = item.trans_id, "object missing in backend");
                state.scrub_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(res) => match state.action {
            ScrubAction::Scrub => {
                let stored = md5sum(&item.md5sum);
                if stored.is_empty() || res.md5sum == stored {
                    state.scrub_oks.fetch_add(1, Ordering::Relaxed);
                } else if res.status.contains(GetStatus::REPAIRED) {
                    state.scrub_repaired.fetch_add(1, Ordering::Relaxed);
                    let mut repaired = item.clone();
                    repaired.md5sum = res.md5sum;
                    new_md5sums.lock().unwrap().push(repaired);
                } else {
                    warn!(trans_id = item.trans_id, "content hash mismatch");
                    state.scrub_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            ScrubAction::Rebuild => {
                state.scrub_oks.fetch_add(1, Ordering::Relaxed);
            }
            ScrubAction::Balance => {
                // rewrite through the envelope to the object's target shard
                match inner
                    .backend
                    .put(&key, tmp, PutFlags::ALREADY_COMPRESSED_ENCRYPTED)
                    .await
                {
                    Ok(_) => {
                        inner.total_balance_ops.fetch_add(1, Ordering::Relaxed);
                        state.scrub_oks.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        warn!(error = %err, "balance rewrite failed");
                        state.scrub_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        },
        Err(err) => {
            warn!(error = %err, "scrub read failed");
            state.scrub_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
    state.advance(&item, with_last_modified);
}

/// Rebuild's second leg: walk the backend listing. Matched rows get their
/// stored md5 refreshed; anything with no metadata row is an orphan and
/// gets deleted.
async fn rebuild_reconcile(inner: &Arc<Inner>) -> Result<()> {
    let mut listed = Vec::new();
    inner
        .backend
        .list(&mut |item| {
            listed.push((item.key, item.md5sum));
            true
        })
        .await?;

    let mut orphans = Vec::new();
    for (key, md5sum) in listed {
        if !inner.has_backend_key(&key, &md5sum, true).await? {
            orphans.push(key);
        }
    }
    if orphans.is_empty() {
        return Ok(());
    }

    info!(n = orphans.len(), "deleting orphaned backend objects");
    let mut stream = VecKeyStream::new(orphans);
    inner.backend.del(&mut stream, None, false).await
}
