use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, PutFlags};
use tracing::{debug, info};

use crate::error::{KvError, Result};
use crate::varint::{read_varint, write_varint};

const INITIAL_MAP_SIZE: usize = 1024 * 1024;
const CREATE_COMMIT_N: usize = 10_000;
const GROW_RETRIES: usize = 32;

pub const INDEX_KEY_SIZE: usize = 28;

/// Composite index key. Serialized as hash, then size (i64 LE), then
/// client (i32 LE), and compared bytewise, so all clients holding the
/// same `(hash, size)` content are adjacent in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexKey {
    pub hash: [u8; 16],
    pub size: i64,
    pub client: i32,
}

impl IndexKey {
    pub fn new(hash: [u8; 16], size: i64, client: i32) -> Self {
        Self { hash, size, client }
    }

    pub fn to_bytes(&self) -> [u8; INDEX_KEY_SIZE] {
        let mut out = [0u8; INDEX_KEY_SIZE];
        out[..16].copy_from_slice(&self.hash);
        out[16..24].copy_from_slice(&self.size.to_le_bytes());
        out[24..].copy_from_slice(&self.client.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != INDEX_KEY_SIZE {
            return None;
        }
        Some(Self {
            hash: bytes[..16].try_into().ok()?,
            size: i64::from_le_bytes(bytes[16..24].try_into().ok()?),
            client: i32::from_le_bytes(bytes[24..].try_into().ok()?),
        })
    }

    /// Same content, any client.
    pub fn matches_content(&self, other: &IndexKey) -> bool {
        self.hash == other.hash && self.size == other.size
    }

    fn content_prefix(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..16].copy_from_slice(&self.hash);
        out[16..].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

#[derive(Debug)]
enum LogOp {
    Put { key: [u8; INDEX_KEY_SIZE], entry_id: i64 },
    Del { key: [u8; INDEX_KEY_SIZE] },
}

struct State {
    env: Option<Env>,
    db: Database<Bytes, Bytes>,
    map_size: usize,
    path: PathBuf,
    // write log of the open transaction; replayed after a map grow
    txn_log: Option<Vec<LogOp>>,
    // read-your-writes overlay while a transaction is open
    pending: BTreeMap<[u8; INDEX_KEY_SIZE], Option<i64>>,
}

/// Embedded ordered index mapping `(hash, size, client) → entry_id`.
///
/// Readers run concurrently; writers take the exclusive side of the lock.
/// Writes between `start_transaction` and `commit_transaction` appear
/// atomically. When the backing map fills up, the store is reopened at
/// twice the size and the transaction log is replayed.
pub struct FileEntryIndex {
    state: RwLock<State>,
}

impl std::fmt::Debug for FileEntryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEntryIndex").finish()
    }
}

fn open_env(path: &Path, map_size: usize) -> Result<(Env, Database<Bytes, Bytes>)> {
    std::fs::create_dir_all(path)?;
    let env = unsafe { EnvOpenOptions::new().map_size(map_size).max_dbs(1).open(path)? };
    let mut wtxn = env.write_txn()?;
    let db = env.create_database::<Bytes, Bytes>(&mut wtxn, None)?;
    wtxn.commit()?;
    Ok((env, db))
}

fn encode_entry_id(entry_id: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    write_varint(&mut out, entry_id);
    out
}

fn decode_entry_id(bytes: &[u8]) -> Result<i64> {
    let mut pos = 0;
    read_varint(bytes, &mut pos)
        .ok_or_else(|| KvError::Corruption("truncated file index value".to_string()))
}

impl State {
    fn grow(&mut self) -> Result<()> {
        if let Some(env) = self.env.take() {
            env.prepare_for_closing().wait();
        }
        self.map_size *= 2;
        info!(map_size = self.map_size, "growing file index map");
        let (env, db) = open_env(&self.path, self.map_size)?;
        self.env = Some(env);
        self.db = db;
        Ok(())
    }

    fn env(&self) -> &Env {
        self.env.as_ref().expect("file index env is only vacated during grow")
    }

    /// Applies `ops` in one write transaction, growing the map as needed.
    fn apply(&mut self, ops: &[LogOp]) -> Result<()> {
        for _ in 0..GROW_RETRIES {
            let res = (|| -> std::result::Result<(), heed::Error> {
                let mut wtxn = self.env().write_txn()?;
                for op in ops {
                    match op {
                        LogOp::Put { key, entry_id } => {
                            self.db.put(&mut wtxn, key, &encode_entry_id(*entry_id))?;
                        }
                        LogOp::Del { key } => {
                            self.db.delete(&mut wtxn, key)?;
                        }
                    }
                }
                wtxn.commit()
            })();

            match res {
                Ok(()) => return Ok(()),
                Err(heed::Error::Mdb(heed::MdbError::MapFull)) => self.grow()?,
                Err(e) => return Err(e.into()),
            }
        }
        Err(KvError::Enospc)
    }

    fn lookup(&self, key: &[u8; INDEX_KEY_SIZE]) -> Result<Option<i64>> {
        if self.txn_log.is_some() {
            if let Some(pending) = self.pending.get(key) {
                return Ok(*pending);
            }
        }
        let rtxn = self.env().read_txn()?;
        let Some(val) = self.db.get(&rtxn, key)? else {
            return Ok(None);
        };
        Ok(Some(decode_entry_id(val)?))
    }
}

impl FileEntryIndex {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_map_size(path, INITIAL_MAP_SIZE)
    }

    pub fn open_with_map_size(path: &Path, map_size: usize) -> Result<Self> {
        let (env, db) = open_env(path, map_size)?;
        Ok(Self {
            state: RwLock::new(State {
                env: Some(env),
                db,
                map_size,
                path: path.to_path_buf(),
                txn_log: None,
                pending: BTreeMap::new(),
            }),
        })
    }

    pub fn start_transaction(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.txn_log.is_some() {
            return Err(KvError::Misuse("file index transaction already open".to_string()));
        }
        state.txn_log = Some(Vec::new());
        state.pending.clear();
        Ok(())
    }

    pub fn commit_transaction(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let Some(ops) = state.txn_log.take() else {
            return Err(KvError::Misuse("no file index transaction open".to_string()));
        };
        state.pending.clear();
        state.apply(&ops)
    }

    pub fn abort_transaction(&self) {
        let mut state = self.state.write().unwrap();
        state.txn_log = None;
        state.pending.clear();
    }

    pub fn put(&self, key: &IndexKey, entry_id: i64) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let kb = key.to_bytes();
        if let Some(log) = state.txn_log.as_mut() {
            log.push(LogOp::Put { key: kb, entry_id });
            state.pending.insert(kb, Some(entry_id));
            return Ok(());
        }
        state.apply(&[LogOp::Put { key: kb, entry_id }])
    }

    pub fn delete(&self, key: &IndexKey) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let kb = key.to_bytes();
        if let Some(log) = state.txn_log.as_mut() {
            log.push(LogOp::Del { key: kb });
            state.pending.insert(kb, None);
            return Ok(());
        }
        state.apply(&[LogOp::Del { key: kb }])
    }

    /// Exact-match lookup.
    pub fn get(&self, key: &IndexKey) -> Result<Option<i64>> {
        let state = self.state.read().unwrap();
        state.lookup(&key.to_bytes())
    }

    /// First entry with the same `(hash, size)` regardless of client.
    pub fn get_any_client(&self, key: &IndexKey) -> Result<Option<i64>> {
        let state = self.state.read().unwrap();
        let rtxn = state.env().read_txn()?;
        let start = key.content_prefix();
        let mut iter = state
            .db
            .range(&rtxn, &(Bound::Included(&start[..]), Bound::Unbounded))?;
        match iter.next().transpose()? {
            Some((k, v)) if k.starts_with(&start) => Ok(Some(decode_entry_id(v)?)),
            _ => Ok(None),
        }
    }

    /// All clients holding `(hash, size)`.
    pub fn get_all_clients(&self, key: &IndexKey) -> Result<BTreeMap<i32, i64>> {
        let state = self.state.read().unwrap();
        let rtxn = state.env().read_txn()?;
        let start = key.content_prefix();
        let mut out = BTreeMap::new();
        for item in state
            .db
            .range(&rtxn, &(Bound::Included(&start[..]), Bound::Unbounded))?
        {
            let (k, v) = item?;
            if !k.starts_with(&start) {
                break;
            }
            let Some(entry_key) = IndexKey::from_bytes(k) else {
                return Err(KvError::Corruption("malformed file index key".to_string()));
            };
            out.insert(entry_key.client, decode_entry_id(v)?);
        }
        Ok(out)
    }

    /// Exact client match when present, otherwise a same-content neighbor.
    /// The neighbor search steps at most two entries backward from the
    /// range position; `(hash, size)` is unique per client, so a matching
    /// entry cannot be further away.
    pub fn get_prefer_client(&self, key: &IndexKey) -> Result<Option<i64>> {
        let state = self.state.read().unwrap();
        let rtxn = state.env().read_txn()?;
        let kb = key.to_bytes();

        let mut iter = state
            .db
            .range(&rtxn, &(Bound::Included(&kb[..]), Bound::Unbounded))?;
        if let Some((k, v)) = iter.next().transpose()? {
            if let Some(entry_key) = IndexKey::from_bytes(k) {
                if entry_key.matches_content(key) {
                    return Ok(Some(decode_entry_id(v)?));
                }
            }
        }
        drop(iter);

        let mut stepped = 0;
        for item in state
            .db
            .rev_range(&rtxn, &(Bound::Unbounded, Bound::Excluded(&kb[..])))?
        {
            let (k, v) = item?;
            if let Some(entry_key) = IndexKey::from_bytes(k) {
                if entry_key.matches_content(key) {
                    return Ok(Some(decode_entry_id(v)?));
                }
            }
            stepped += 1;
            if stepped >= 2 {
                break;
            }
        }
        Ok(None)
    }

    /// Initial population from a sorted reader. `next_batch` yields batches
    /// in ascending key order until exhausted; entries land via the append
    /// fast path with a commit every 10,000 rows. When two input rows share
    /// a key the later one wins and `on_duplicate(kept, superseded)` lets
    /// the caller patch its entry chain.
    pub fn create(
        &self,
        mut next_batch: impl FnMut() -> Result<Option<Vec<(IndexKey, i64)>>>,
        mut on_duplicate: impl FnMut(i64, i64),
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.txn_log.is_some() {
            return Err(KvError::Misuse("file index transaction open during create".to_string()));
        }

        let mut last: Option<(IndexKey, i64)> = None;
        let mut chunk: Vec<(IndexKey, i64)> = Vec::with_capacity(CREATE_COMMIT_N);
        let mut n_done = 0usize;

        let mut flush = |state: &mut State, chunk: &mut Vec<(IndexKey, i64)>| -> Result<()> {
            for _ in 0..GROW_RETRIES {
                let res = (|| -> std::result::Result<(), heed::Error> {
                    let mut wtxn = state.env().write_txn()?;
                    for (key, entry_id) in chunk.iter() {
                        state.db.put_with_flags(
                            &mut wtxn,
                            PutFlags::APPEND,
                            &key.to_bytes(),
                            &encode_entry_id(*entry_id),
                        )?;
                    }
                    wtxn.commit()
                })();
                match res {
                    Ok(()) => {
                        chunk.clear();
                        return Ok(());
                    }
                    Err(heed::Error::Mdb(heed::MdbError::MapFull)) => state.grow()?,
                    Err(e) => return Err(e.into()),
                }
            }
            Err(KvError::Enospc)
        };

        while let Some(batch) = next_batch()? {
            for (key, entry_id) in batch {
                if let Some((last_key, last_id)) = last {
                    if last_key == key {
                        // later row wins; replace the queued earlier one,
                        // or overwrite in place if it was already flushed
                        on_duplicate(entry_id, last_id);
                        match chunk.last_mut() {
                            Some(slot) => *slot = (key, entry_id),
                            None => state.apply(&[LogOp::Put {
                                key: key.to_bytes(),
                                entry_id,
                            }])?,
                        }
                        last = Some((key, entry_id));
                        continue;
                    }
                }
                chunk.push((key, entry_id));
                last = Some((key, entry_id));
                n_done += 1;

                if chunk.len() >= CREATE_COMMIT_N {
                    flush(&mut state, &mut chunk)?;
                    debug!(entries = n_done, "file index create progress");
                }
            }
        }
        if !chunk.is_empty() {
            flush(&mut state, &mut chunk)?;
        }
        info!(entries = n_done, "file index created");
        Ok(())
    }

    pub fn start_iteration(&self) -> Iteration {
        Iteration { pos: Some(Vec::new()) }
    }

    /// Next group of entries sharing `(hash, size)`, as `client → entry_id`.
    /// `None` once the index is exhausted.
    pub fn next_batch_same_prefix(&self, iter: &mut Iteration) -> Result<Option<BTreeMap<i32, i64>>> {
        let Some(pos) = iter.pos.clone() else {
            return Ok(None);
        };
        let state = self.state.read().unwrap();
        let rtxn = state.env().read_txn()?;

        let mut group: Option<[u8; 24]> = None;
        let mut out = BTreeMap::new();
        for item in state
            .db
            .range(&rtxn, &(Bound::Included(&pos[..]), Bound::Unbounded))?
        {
            let (k, v) = item?;
            let Some(entry_key) = IndexKey::from_bytes(k) else {
                return Err(KvError::Corruption("malformed file index key".to_string()));
            };
            match group {
                None => group = Some(entry_key.content_prefix()),
                Some(prefix) if entry_key.content_prefix() != prefix => {
                    iter.pos = Some(k.to_vec());
                    return Ok(Some(out));
                }
                Some(_) => {}
            }
            out.insert(entry_key.client, decode_entry_id(v)?);
        }

        iter.pos = None;
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }

    pub fn meminfo(&self) -> String {
        let state = self.state.read().unwrap();
        format!("file index map size: {} bytes\n", state.map_size)
    }
}

/// Cursor for [`FileEntryIndex::next_batch_same_prefix`]. Dropping it ends
/// the iteration.
pub struct Iteration {
    pos: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(h: u8, size: i64, client: i32) -> IndexKey {
        IndexKey::new([h; 16], size, client)
    }

    fn open_index(dir: &TempDir) -> FileEntryIndex {
        FileEntryIndex::open(&dir.path().join("fileindex")).unwrap()
    }

    #[test]
    fn put_get_delete() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        let k = key(1, 10, 1);
        assert_eq!(index.get(&k).unwrap(), None);
        index.put(&k, 42).unwrap();
        assert_eq!(index.get(&k).unwrap(), Some(42));
        index.delete(&k).unwrap();
        assert_eq!(index.get(&k).unwrap(), None);
    }

    #[test]
    fn multi_client_range_ops() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        index.put(&key(5, 5, 1), 10).unwrap();
        index.put(&key(5, 5, 2), 20).unwrap();
        index.put(&key(5, 6, 1), 30).unwrap();
        index.put(&key(6, 5, 3), 40).unwrap();

        let all = index.get_all_clients(&key(5, 5, 0)).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&1], 10);
        assert_eq!(all[&2], 20);

        assert!(index.get_any_client(&key(5, 5, 99)).unwrap().is_some());
        assert_eq!(index.get_any_client(&key(9, 9, 0)).unwrap(), None);

        // exact client wins
        assert_eq!(index.get_prefer_client(&key(5, 5, 2)).unwrap(), Some(20));
        // missing client falls back to a same-content neighbor
        let fallback = index.get_prefer_client(&key(5, 5, 7)).unwrap();
        assert!(matches!(fallback, Some(10) | Some(20)));
        // no same-content entry at all
        assert_eq!(index.get_prefer_client(&key(7, 7, 1)).unwrap(), None);
    }

    #[test]
    fn transaction_commit_and_abort() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        index.start_transaction().unwrap();
        index.put(&key(1, 1, 1), 1).unwrap();
        index.put(&key(2, 2, 2), 2).unwrap();
        // read-your-writes inside the transaction
        assert_eq!(index.get(&key(1, 1, 1)).unwrap(), Some(1));
        index.commit_transaction().unwrap();
        assert_eq!(index.get(&key(2, 2, 2)).unwrap(), Some(2));

        index.start_transaction().unwrap();
        index.delete(&key(1, 1, 1)).unwrap();
        index.put(&key(3, 3, 3), 3).unwrap();
        assert_eq!(index.get(&key(1, 1, 1)).unwrap(), None);
        index.abort_transaction();

        assert_eq!(index.get(&key(1, 1, 1)).unwrap(), Some(1));
        assert_eq!(index.get(&key(3, 3, 3)).unwrap(), None);
    }

    #[test]
    fn map_grows_under_load() {
        let dir = TempDir::new().unwrap();
        let index =
            FileEntryIndex::open_with_map_size(&dir.path().join("fileindex"), 64 * 1024).unwrap();

        index.start_transaction().unwrap();
        for i in 0..20_000i64 {
            let mut hash = [0u8; 16];
            hash[..8].copy_from_slice(&i.to_be_bytes());
            index.put(&IndexKey::new(hash, i, 1), i).unwrap();
        }
        index.commit_transaction().unwrap();

        for i in (0..20_000i64).step_by(997) {
            let mut hash = [0u8; 16];
            hash[..8].copy_from_slice(&i.to_be_bytes());
            assert_eq!(index.get(&IndexKey::new(hash, i, 1)).unwrap(), Some(i));
        }
    }

    #[test]
    fn bulk_create_dedups_and_iterates() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        let mut rows = vec![
            (key(1, 1, 1), 100),
            (key(1, 1, 2), 101),
            (key(1, 1, 2), 102), // duplicate key, later row wins
            (key(2, 2, 1), 200),
        ];
        let mut batches = vec![rows.split_off(2), rows];
        let mut duplicates = Vec::new();
        index
            .create(
                || Ok(batches.pop()),
                |kept, superseded| duplicates.push((kept, superseded)),
            )
            .unwrap();

        assert_eq!(duplicates, vec![(102, 101)]);
        assert_eq!(index.get(&key(1, 1, 2)).unwrap(), Some(102));

        let mut iter = index.start_iteration();
        let g1 = index.next_batch_same_prefix(&mut iter).unwrap().unwrap();
        assert_eq!(g1.len(), 2);
        assert_eq!(g1[&1], 100);
        assert_eq!(g1[&2], 102);
        let g2 = index.next_batch_same_prefix(&mut iter).unwrap().unwrap();
        assert_eq!(g2[&1], 200);
        assert!(index.next_batch_same_prefix(&mut iter).unwrap().is_none());
    }
}
