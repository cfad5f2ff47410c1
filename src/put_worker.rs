use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::{FailBits, KvError, Result};
use crate::meta_db::MetaDb;

const QUEUE_CAPACITY: usize = 4096;
const BATCH_MAX: usize = 512;
const COMMIT_RETRIES: usize = 3;

enum DbItem {
    Add {
        cd_id: i64,
        transid: i64,
        tkey: Vec<u8>,
        generation: i64,
        rowid: oneshot::Sender<i64>,
    },
    Add2 {
        cd_id: i64,
        transid: i64,
        tkey: Vec<u8>,
        md5sum: Vec<u8>,
        size: i64,
        last_modified: i64,
        generation: i64,
    },
    Update {
        cd_id: i64,
        objectid: i64,
        size: i64,
        md5sum: Vec<u8>,
        last_modified: i64,
    },
    Flush {
        ack: oneshot::Sender<()>,
    },
}

/// Dedicated owner of the metadata-write path. Clients enqueue records;
/// the worker folds each drain into a single database transaction, so a
/// burst of puts costs one commit.
pub struct PutDbWorker {
    tx: mpsc::Sender<DbItem>,
    synchronous: Arc<AtomicBool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PutDbWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PutDbWorker").finish()
    }
}

impl PutDbWorker {
    pub fn spawn(db: MetaDb, fail_bits: Arc<FailBits>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let synchronous = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(worker_loop(db, rx, synchronous.clone(), fail_bits));
        Self {
            tx,
            synchronous,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    pub fn set_synchronous(&self, b: bool) {
        self.synchronous.store(b, Ordering::Relaxed);
    }

    /// Inserts a partial object row; resolves to its rowid.
    pub async fn add(&self, cd_id: i64, transid: i64, tkey: &[u8], generation: i64) -> Result<i64> {
        let (rowid_tx, rowid_rx) = oneshot::channel();
        self.send(DbItem::Add {
            cd_id,
            transid,
            tkey: tkey.to_vec(),
            generation,
            rowid: rowid_tx,
        })
        .await?;
        rowid_rx
            .await
            .map_err(|_| KvError::Corruption("metadata writer gone".to_string()))
    }

    /// Inserts a complete object row in one step.
    pub async fn add2(
        &self,
        cd_id: i64,
        transid: i64,
        tkey: &[u8],
        md5sum: &[u8],
        size: i64,
        last_modified: i64,
        generation: i64,
    ) -> Result<()> {
        self.send(DbItem::Add2 {
            cd_id,
            transid,
            tkey: tkey.to_vec(),
            md5sum: md5sum.to_vec(),
            size,
            last_modified,
            generation,
        })
        .await
    }

    pub async fn update(
        &self,
        cd_id: i64,
        objectid: i64,
        size: i64,
        md5sum: &[u8],
        last_modified: i64,
    ) -> Result<()> {
        self.send(DbItem::Update {
            cd_id,
            objectid,
            size,
            md5sum: md5sum.to_vec(),
            last_modified,
        })
        .await
    }

    /// Resolves once everything enqueued before it is committed.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(DbItem::Flush { ack: ack_tx }).await?;
        ack_rx
            .await
            .map_err(|_| KvError::Corruption("metadata writer gone".to_string()))
    }

    /// Flushes remaining items and stops the worker.
    pub async fn shutdown(&self) {
        let _ = self.flush().await;
        let handle = {
            let mut guard = self.handle.lock().unwrap();
            guard.take()
        };
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn send(&self, item: DbItem) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| KvError::Corruption("metadata writer gone".to_string()))
    }

    pub fn meminfo(&self) -> String {
        format!("put db worker: {} queued items\n", QUEUE_CAPACITY - self.tx.capacity())
    }
}

async fn worker_loop(
    db: MetaDb,
    mut rx: mpsc::Receiver<DbItem>,
    synchronous: Arc<AtomicBool>,
    fail_bits: Arc<FailBits>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < BATCH_MAX {
            match rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }

        let mut committed = false;
        for attempt in 0..COMMIT_RETRIES {
            match commit_batch(&db, &batch).await {
                Ok(rowids) => {
                    for (item, rowid) in batch.drain(..).zip(rowids) {
                        match item {
                            DbItem::Add { rowid: tx, .. } => {
                                let _ = tx.send(rowid.unwrap_or(0));
                            }
                            DbItem::Flush { ack } => {
                                let _ = ack.send(());
                            }
                            _ => {}
                        }
                    }
                    committed = true;
                    break;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "metadata batch commit failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100 << attempt)).await;
                }
            }
        }

        if !committed {
            error!("metadata writes keep failing, refusing further writes");
            fail_bits.set(FailBits::DATABASE_CORRUPTED);
            // dropping the senders fails the callers waiting on this batch
            batch.clear();
            continue;
        }

        if synchronous.load(Ordering::Relaxed) {
            if let Err(err) = sqlx::query("PRAGMA wal_checkpoint(FULL)")
                .execute(db.pool())
                .await
            {
                warn!(error = %err, "wal checkpoint failed");
            }
        }
    }
}

/// Applies the batch inside one transaction; returns per-item rowids for
/// `Add` records.
async fn commit_batch(db: &MetaDb, batch: &[DbItem]) -> Result<Vec<Option<i64>>> {
    let mut tx = db.pool().begin().await?;
    let mut rowids = Vec::with_capacity(batch.len());
    let mut max_generation: Option<(i64, i64)> = None;

    for item in batch {
        match item {
            DbItem::Add { cd_id, transid, tkey, generation, .. } => {
                let res = if *cd_id == 0 {
                    sqlx::query("INSERT OR REPLACE INTO objects (trans_id, tkey) VALUES (?, ?)")
                        .bind(transid)
                        .bind(tkey)
                        .execute(&mut *tx)
                        .await?
                } else {
                    sqlx::query("INSERT OR REPLACE INTO objects_cd (cd_id, trans_id, tkey) VALUES (?, ?, ?)")
                        .bind(cd_id)
                        .bind(transid)
                        .bind(tkey)
                        .execute(&mut *tx)
                        .await?
                };
                rowids.push(Some(res.last_insert_rowid()));
                track_generation(&mut max_generation, *cd_id, *generation);
            }
            DbItem::Add2 { cd_id, transid, tkey, md5sum, size, last_modified, generation } => {
                if *cd_id == 0 {
                    sqlx::query(
                        "INSERT OR REPLACE INTO objects (trans_id, tkey, md5sum, size, last_modified) VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(transid)
                    .bind(tkey)
                    .bind(md5sum)
                    .bind(size)
                    .bind(last_modified)
                    .execute(&mut *tx)
                    .await?;
                } else {
                    sqlx::query(
                        "INSERT OR REPLACE INTO objects_cd (cd_id, trans_id, tkey, md5sum, size, last_modified) VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(cd_id)
                    .bind(transid)
                    .bind(tkey)
                    .bind(md5sum)
                    .bind(size)
                    .bind(last_modified)
                    .execute(&mut *tx)
                    .await?;
                }
                rowids.push(None);
                track_generation(&mut max_generation, *cd_id, *generation);
            }
            DbItem::Update { cd_id, objectid, size, md5sum, last_modified } => {
                let table = if *cd_id == 0 { "objects" } else { "objects_cd" };
                let sql = format!(
                    "UPDATE {table} SET md5sum=?, size=?, last_modified=? WHERE rowid=?"
                );
                sqlx::query(&sql)
                    .bind(md5sum)
                    .bind(size)
                    .bind(last_modified)
                    .bind(objectid)
                    .execute(&mut *tx)
                    .await?;
                rowids.push(None);
            }
            DbItem::Flush { .. } => rowids.push(None),
        }
    }

    if let Some((cd_id, generation)) = max_generation {
        if cd_id == 0 {
            sqlx::query("UPDATE generation SET generation=?")
                .bind(generation)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("INSERT OR REPLACE INTO generation_cd (cd_id, generation) VALUES (?, ?)")
                .bind(cd_id)
                .bind(generation)
                .execute(&mut *tx)
                .await?;
        }
    }

    tx.commit().await?;
    Ok(rowids)
}

fn track_generation(slot: &mut Option<(i64, i64)>, cd_id: i64, generation: i64) {
    if generation <= 0 {
        return;
    }
    match slot {
        Some((_, g)) if *g >= generation => {}
        _ => *slot = Some((cd_id, generation)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_update_flush() {
        let db = MetaDb::open_memory().await.unwrap();
        let t = db.new_transaction(0).await.unwrap();
        let worker = PutDbWorker::spawn(db.clone(), Arc::new(FailBits::default()));

        let rowid = worker.add(0, t, b"k", 0).await.unwrap();
        assert!(rowid > 0);
        worker.update(0, rowid, 11, &[5u8; 16], 99).await.unwrap();
        worker.flush().await.unwrap();

        let got = db.get_object(0, t, b"k").await.unwrap().unwrap();
        assert_eq!(got.size, 11);
        assert_eq!(got.md5sum, vec![5u8; 16]);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn add2_persists_generation() {
        let db = MetaDb::open_memory().await.unwrap();
        db.insert_generation(0).await.unwrap();
        let t = db.new_transaction(0).await.unwrap();
        let worker = PutDbWorker::spawn(db.clone(), Arc::new(FailBits::default()));

        worker.add2(0, t, b"a", &[1u8; 16], 4, 50, 9).await.unwrap();
        worker.flush().await.unwrap();

        assert_eq!(db.get_generation(0).await.unwrap(), Some(9));
        assert!(db.get_object(0, t, b"a").await.unwrap().is_some());

        worker.shutdown().await;
    }
}
