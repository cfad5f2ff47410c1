use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use md5::{Digest, Md5};

use crate::blob_store::{KeyStream, LocinfoStream};
use crate::error::{KvError, Result};
use crate::varint::{read_varint, write_varint};

const COLLECTOR_SIG: &[u8] = b"OBJECTCOLLECTOR";
pub const DEFAULT_STRIDE_SIZE: i64 = 8192;

/// Callbacks a draining key stream needs from the frontend: key encoding,
/// the mirror-delete log, and the deletion-op counter.
pub trait DeleteHooks: Send + Sync + 'static {
    fn backend_key(&self, cd_id: i64, tkey: &[u8], transid: i64) -> String;

    fn log_del_mirror(&self, _key: &str) {}

    fn incr_del_ops(&self) {}
}

/// One stride of entries. Filled uncompressed, then deflated in place when
/// the next chunk starts; rehydrated lazily when the stream first reads it.
struct Chunk {
    data: Vec<u8>,
    compressed: Option<(Vec<u8>, usize)>,
}

impl Chunk {
    fn new() -> Self {
        Self { data: Vec::new(), compressed: None }
    }

    fn from_compressed(bytes: Vec<u8>, decompressed_len: Option<usize>) -> Self {
        match decompressed_len {
            Some(len) => Self { data: Vec::new(), compressed: Some((bytes, len)) },
            // never compressed (the final chunk)
            None => Self { data: bytes, compressed: None },
        }
    }

    fn compress(&mut self) -> Result<()> {
        if self.compressed.is_some() {
            return Ok(());
        }
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&self.data)?;
        let bytes = enc.finish()?;
        self.compressed = Some((bytes, self.data.len()));
        self.data = Vec::new();
        Ok(())
    }

    fn decompress(&mut self) -> Result<()> {
        if let Some((bytes, len)) = &self.compressed {
            let mut out = Vec::with_capacity(*len);
            ZlibDecoder::new(&bytes[..])
                .read_to_end(&mut out)
                .map_err(|e| KvError::Corruption(format!("collector chunk: {e}")))?;
            if out.len() != *len {
                return Err(KvError::Corruption("collector chunk length mismatch".to_string()));
            }
            self.data = out;
        }
        Ok(())
    }

    fn stored_bytes(&self) -> (&[u8], i64) {
        match &self.compressed {
            Some((bytes, len)) => (bytes, *len as i64),
            None => (&self.data, -1),
        }
    }

    fn memsize(&self) -> (usize, usize) {
        let compressed = self.compressed.as_ref().map_or(0, |(b, _)| b.capacity());
        (compressed, self.data.capacity())
    }
}

fn write_blob(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as i64);
    out.extend_from_slice(bytes);
}

fn read_blob(data: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
    let len = read_varint(data, pos)?;
    let len = usize::try_from(len).ok()?;
    let end = pos.checked_add(len)?;
    if end > data.len() {
        return None;
    }
    let out = data[*pos..end].to_vec();
    *pos = end;
    Some(out)
}

/// Persisted, chunked batch of backend keys (and optional location infos)
/// queued for deletion. Scales to millions of entries: all but the current
/// chunk are held deflated.
pub struct ObjectCollector {
    pub task_id: i64,
    pub completed: i64,
    pub active: i64,
    pub trans_ids: Vec<i64>,
    pub cd_id: i64,

    global_transid: i64,
    stride_size: i64,
    with_mirrored: bool,
    with_locinfo: bool,
    n_chunk_entries: i64,
    total_entries: i64,

    backend_keys: Vec<Chunk>,
    backend_locinfo: Vec<Option<Chunk>>,
}

impl ObjectCollector {
    /// `global_transid < 0` stores a per-entry transaction id instead.
    pub fn new(
        cd_id: i64,
        global_transid: i64,
        stride_size: i64,
        with_mirrored: bool,
        with_locinfo: bool,
    ) -> Self {
        Self {
            task_id: 0,
            completed: 0,
            active: 0,
            trans_ids: Vec::new(),
            cd_id,
            global_transid,
            stride_size,
            with_mirrored,
            with_locinfo,
            n_chunk_entries: 0,
            total_entries: 0,
            backend_keys: Vec::new(),
            backend_locinfo: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_entries == 0
    }

    pub fn len(&self) -> i64 {
        self.total_entries
    }

    pub fn add(
        &mut self,
        transid: i64,
        tkey: &[u8],
        locinfo: Option<&[u8]>,
        mirrored: bool,
    ) -> Result<()> {
        if self.n_chunk_entries >= self.stride_size || self.backend_keys.is_empty() {
            if let Some(chunk) = self.backend_keys.last_mut() {
                chunk.compress()?;
            }
            if let Some(Some(chunk)) = self.backend_locinfo.last_mut() {
                chunk.compress()?;
            }
            self.backend_keys.push(Chunk::new());
            self.backend_locinfo
                .push(self.with_locinfo.then(Chunk::new));
            self.n_chunk_entries = 0;
        }

        self.n_chunk_entries += 1;
        self.total_entries += 1;

        let chunk = self.backend_keys.last_mut().expect("chunk pushed above");
        if self.global_transid < 0 {
            write_varint(&mut chunk.data, transid);
        }
        write_blob(&mut chunk.data, tkey);
        if self.with_mirrored {
            chunk.data.push(u8::from(mirrored));
        }

        if let Some(Some(chunk)) = self.backend_locinfo.last_mut() {
            write_blob(&mut chunk.data, locinfo.unwrap_or_default());
        }
        Ok(())
    }

    /// Writes the collector to `path` (create-or-truncate, fsynced) so a
    /// crash between metadata commit and backend acknowledgement can be
    /// resumed.
    pub fn persist(
        &mut self,
        task_id: i64,
        completed: i64,
        active: i64,
        trans_ids: &[i64],
        path: &Path,
    ) -> Result<()> {
        self.task_id = task_id;
        self.completed = completed;
        self.active = active;
        self.trans_ids = trans_ids.to_vec();

        let mut header = Vec::new();
        header.extend_from_slice(COLLECTOR_SIG);
        header.extend_from_slice(&[0u8; 4]); // patched below
        write_varint(&mut header, task_id);
        write_varint(&mut header, completed);
        write_varint(&mut header, active);
        write_varint(&mut header, trans_ids.len() as i64);
        for trans_id in trans_ids {
            write_varint(&mut header, *trans_id);
        }
        write_varint(&mut header, self.global_transid);
        write_varint(&mut header, self.total_entries);
        write_varint(&mut header, self.stride_size);
        header.push(u8::from(self.with_mirrored));
        write_varint(&mut header, self.cd_id);

        write_varint(&mut header, self.backend_keys.len() as i64);
        for chunk in &self.backend_keys {
            let (bytes, decompressed_len) = chunk.stored_bytes();
            write_varint(&mut header, bytes.len() as i64);
            write_varint(&mut header, decompressed_len);
        }
        let n_locinfo = self.backend_locinfo.iter().flatten().count();
        write_varint(&mut header, n_locinfo as i64);
        for chunk in self.backend_locinfo.iter().flatten() {
            let (bytes, decompressed_len) = chunk.stored_bytes();
            write_varint(&mut header, bytes.len() as i64);
            write_varint(&mut header, decompressed_len);
        }

        let header_size = (header.len() + 16) as u32;
        header[COLLECTOR_SIG.len()..COLLECTOR_SIG.len() + 4]
            .copy_from_slice(&header_size.to_le_bytes());
        let md5 = Md5::digest(&header);

        let mut out = std::fs::File::create(path)?;
        out.write_all(&header)?;
        out.write_all(&md5)?;
        for chunk in &self.backend_keys {
            out.write_all(chunk.stored_bytes().0)?;
        }
        for chunk in self.backend_locinfo.iter().flatten() {
            out.write_all(chunk.stored_bytes().0)?;
        }
        out.sync_all()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let corrupt = |what: &str| KvError::Corruption(format!("collector file: {what}"));

        if bytes.len() < COLLECTOR_SIG.len() + 4 || !bytes.starts_with(COLLECTOR_SIG) {
            return Err(corrupt("bad signature"));
        }
        let mut pos = COLLECTOR_SIG.len();
        let header_size =
            u32::from_le_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        pos += 4;
        if header_size < pos + 16 || header_size > bytes.len() {
            return Err(corrupt("bad header size"));
        }

        let md5 = Md5::digest(&bytes[..header_size - 16]);
        if md5[..] != bytes[header_size - 16..header_size] {
            return Err(corrupt("header checksum mismatch"));
        }

        let data = &bytes[..header_size - 16];
        let rv = |pos: &mut usize, what: &'static str| -> Result<i64> {
            read_varint(data, pos).ok_or_else(|| corrupt(what))
        };

        let task_id = rv(&mut pos, "task_id")?;
        let completed = rv(&mut pos, "completed")?;
        let active = rv(&mut pos, "active")?;
        let n_trans_ids = rv(&mut pos, "trans id count")?;
        let mut trans_ids = Vec::new();
        for _ in 0..n_trans_ids {
            trans_ids.push(rv(&mut pos, "trans id")?);
        }
        let global_transid = rv(&mut pos, "global transid")?;
        let total_entries = rv(&mut pos, "entry count")?;
        let stride_size = rv(&mut pos, "stride size")?;
        let with_mirrored = *data.get(pos).ok_or_else(|| corrupt("mirrored flag"))? != 0;
        pos += 1;
        let cd_id = rv(&mut pos, "tenant id")?;

        let n_key_chunks = rv(&mut pos, "key chunk count")?;
        let mut key_lens = Vec::new();
        for _ in 0..n_key_chunks {
            key_lens.push((rv(&mut pos, "key chunk len")?, rv(&mut pos, "key chunk dlen")?));
        }
        let n_locinfo_chunks = rv(&mut pos, "locinfo chunk count")?;
        let mut locinfo_lens = Vec::new();
        for _ in 0..n_locinfo_chunks {
            locinfo_lens.push((rv(&mut pos, "locinfo chunk len")?, rv(&mut pos, "locinfo chunk dlen")?));
        }

        let mut pos = header_size;
        let mut take = |len: i64| -> Result<Vec<u8>> {
            let len = usize::try_from(len).map_err(|_| corrupt("negative chunk len"))?;
            let end = pos.checked_add(len).filter(|e| *e <= bytes.len());
            let end = end.ok_or_else(|| corrupt("truncated chunk"))?;
            let out = bytes[pos..end].to_vec();
            pos = end;
            Ok(out)
        };

        let mut backend_keys = Vec::new();
        for (len, dlen) in key_lens {
            let chunk_bytes = take(len)?;
            let dlen = (dlen >= 0).then_some(dlen as usize);
            backend_keys.push(Chunk::from_compressed(chunk_bytes, dlen));
        }
        let mut backend_locinfo: Vec<Option<Chunk>> = Vec::new();
        for (len, dlen) in locinfo_lens {
            let chunk_bytes = take(len)?;
            let dlen = (dlen >= 0).then_some(dlen as usize);
            backend_locinfo.push(Some(Chunk::from_compressed(chunk_bytes, dlen)));
        }
        let with_locinfo = !backend_locinfo.is_empty();
        while backend_locinfo.len() < backend_keys.len() {
            backend_locinfo.push(None);
        }

        Ok(Self {
            task_id,
            completed,
            active,
            trans_ids,
            cd_id,
            global_transid,
            stride_size,
            with_mirrored,
            with_locinfo,
            n_chunk_entries: 0,
            total_entries,
            backend_keys,
            backend_locinfo,
        })
    }

    /// Consumes the collector into per-chunk key/locinfo streams for
    /// [`crate::blob_store::BlobStore::del`]. Streams decompress their
    /// chunk on first read and support mid-stream `reset` for retries.
    pub fn finalize(
        mut self,
        hooks: Arc<dyn DeleteHooks>,
    ) -> Result<(Vec<Box<dyn KeyStream>>, Vec<Option<Box<dyn LocinfoStream>>>)> {
        if let Some(chunk) = self.backend_keys.last_mut() {
            chunk.compress()?;
        }
        if let Some(Some(chunk)) = self.backend_locinfo.last_mut() {
            chunk.compress()?;
        }

        let mut key_streams: Vec<Box<dyn KeyStream>> = Vec::new();
        let mut locinfo_streams: Vec<Option<Box<dyn LocinfoStream>>> = Vec::new();
        for (chunk, locinfo) in self.backend_keys.drain(..).zip(self.backend_locinfo.drain(..)) {
            key_streams.push(Box::new(ChunkKeyStream {
                chunk,
                pos: 0,
                hydrated: false,
                cd_id: self.cd_id,
                global_transid: self.global_transid,
                with_mirrored: self.with_mirrored,
                hooks: hooks.clone(),
            }));
            locinfo_streams.push(locinfo.map(|chunk| {
                Box::new(ChunkLocinfoStream { chunk, pos: 0, hydrated: false })
                    as Box<dyn LocinfoStream>
            }));
        }
        Ok((key_streams, locinfo_streams))
    }

    pub fn meminfo(&self) -> String {
        let (mut compressed, mut uncompressed) = (0usize, 0usize);
        for chunk in &self.backend_keys {
            let (c, u) = chunk.memsize();
            compressed += c;
            uncompressed += u;
        }
        for chunk in self.backend_locinfo.iter().flatten() {
            let (c, u) = chunk.memsize();
            compressed += c;
            uncompressed += u;
        }
        format!(
            "collector: {} entries, {compressed} bytes compressed, {uncompressed} bytes buffered\n",
            self.total_entries
        )
    }
}

struct ChunkKeyStream {
    chunk: Chunk,
    pos: usize,
    hydrated: bool,
    cd_id: i64,
    global_transid: i64,
    with_mirrored: bool,
    hooks: Arc<dyn DeleteHooks>,
}

impl KeyStream for ChunkKeyStream {
    fn next(&mut self) -> Option<String> {
        if !self.hydrated {
            self.chunk.decompress().ok()?;
            self.hydrated = true;
        }
        let data = &self.chunk.data;
        let transid = if self.global_transid < 0 {
            read_varint(data, &mut self.pos)?
        } else {
            self.global_transid
        };
        let tkey = read_blob(data, &mut self.pos)?;
        let mirrored = if self.with_mirrored {
            let flag = *data.get(self.pos)?;
            self.pos += 1;
            flag == 1
        } else {
            false
        };

        self.hooks.incr_del_ops();
        let key = self.hooks.backend_key(self.cd_id, &tkey, transid);
        if mirrored {
            self.hooks.log_del_mirror(&key);
        }
        Some(key)
    }

    fn reset(&mut self) {
        self.pos = 0;
    }

    fn clear(&mut self) {
        self.chunk = Chunk::new();
        self.pos = 0;
        self.hydrated = true;
    }
}

struct ChunkLocinfoStream {
    chunk: Chunk,
    pos: usize,
    hydrated: bool,
}

impl LocinfoStream for ChunkLocinfoStream {
    fn next(&mut self) -> Option<Vec<u8>> {
        if !self.hydrated {
            self.chunk.decompress().ok()?;
            self.hydrated = true;
        }
        read_blob(&self.chunk.data, &mut self.pos)
    }

    fn reset(&mut self) {
        self.pos = 0;
    }

    fn clear(&mut self) {
        self.chunk = Chunk::new();
        self.pos = 0;
        self.hydrated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct PlainHooks {
        mirror_log: Mutex<Vec<String>>,
    }

    impl PlainHooks {
        fn new() -> Arc<Self> {
            Arc::new(Self { mirror_log: Mutex::new(Vec::new()) })
        }
    }

    impl DeleteHooks for PlainHooks {
        fn backend_key(&self, cd_id: i64, tkey: &[u8], transid: i64) -> String {
            crate::keys::prefix_key(&crate::keys::encode_key(cd_id, tkey, transid))
        }

        fn log_del_mirror(&self, key: &str) {
            self.mirror_log.lock().unwrap().push(key.to_string());
        }
    }

    fn drain(stream: &mut dyn KeyStream) -> Vec<String> {
        std::iter::from_fn(|| stream.next()).collect()
    }

    #[test]
    fn persist_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("task_1.collector");

        let mut collector = ObjectCollector::new(0, -1, 100, false, false);
        let mut want = Vec::new();
        for i in 0..2_500i64 {
            let tkey = format!("key{i}").into_bytes();
            collector.add(i % 7 + 1, &tkey, None, false).unwrap();
            want.push(crate::keys::prefix_key(&crate::keys::encode_key(0, &tkey, i % 7 + 1)));
        }
        collector.persist(3, 2, 1, &[5, 6], &path).unwrap();

        let loaded = ObjectCollector::load(&path).unwrap();
        assert_eq!(loaded.task_id, 3);
        assert_eq!(loaded.completed, 2);
        assert_eq!(loaded.active, 1);
        assert_eq!(loaded.trans_ids, vec![5, 6]);
        assert_eq!(loaded.len(), 2_500);

        let hooks = PlainHooks::new();
        let (streams, locinfos) = loaded.finalize(hooks).unwrap();
        assert_eq!(streams.len(), 25);
        assert!(locinfos.iter().all(|l| l.is_none()));

        let got: Vec<String> = streams.into_iter().flat_map(|mut s| drain(s.as_mut())).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn reset_replays_the_chunk() {
        let mut collector = ObjectCollector::new(0, 4, 1_000, false, false);
        for i in 0..1_000i64 {
            collector.add(4, format!("k{i}").as_bytes(), None, false).unwrap();
        }

        let (mut streams, _) = collector.finalize(PlainHooks::new()).unwrap();
        assert_eq!(streams.len(), 1);
        let stream = streams[0].as_mut();

        let mut emitted = Vec::new();
        for _ in 0..600 {
            emitted.push(stream.next().unwrap());
        }
        stream.reset();
        while let Some(key) = stream.next() {
            emitted.push(key);
        }
        assert_eq!(emitted.len(), 600 + 1_000);
        assert_eq!(emitted[0], emitted[600]);

        // cleared chunks yield nothing
        stream.clear();
        assert!(stream.next().is_none());
    }

    #[test]
    fn locinfo_stream_runs_in_lockstep() {
        let mut collector = ObjectCollector::new(2, -1, 10, true, true);
        for i in 0..25i64 {
            collector
                .add(i + 1, format!("k{i}").as_bytes(), Some(format!("loc{i}").as_bytes()), i % 2 == 0)
                .unwrap();
        }

        let hooks = PlainHooks::new();
        let (key_streams, locinfo_streams) = collector.finalize(hooks.clone()).unwrap();
        assert_eq!(key_streams.len(), locinfo_streams.len());

        let mut n = 0;
        for (mut keys, locinfo) in key_streams.into_iter().zip(locinfo_streams) {
            let mut locinfo = locinfo.unwrap();
            while let Some(_key) = keys.next() {
                let loc = locinfo.next().unwrap();
                assert_eq!(loc, format!("loc{n}").into_bytes());
                n += 1;
            }
            assert!(locinfo.next().is_none());
        }
        assert_eq!(n, 25);
        // every even entry was flagged for the mirror-delete log
        assert_eq!(hooks.mirror_log.lock().unwrap().len(), 13);
    }

    #[test]
    fn load_rejects_corrupted_header() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("c");

        let mut collector = ObjectCollector::new(0, 1, 10, false, false);
        collector.add(1, b"k", None, false).unwrap();
        collector.persist(1, 0, 0, &[], &path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[COLLECTOR_SIG.len() + 5] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(ObjectCollector::load(&path), Err(KvError::Corruption(_))));
    }
}
