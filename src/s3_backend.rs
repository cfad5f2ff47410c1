use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use md5::{Digest, Md5};
use rand::Rng;
use tracing::{debug, warn};

use crate::blob_store::{
    BlobStore, GetFlags, GetResult, GetStatus, KeyStream, ListedObject, LocinfoStream, PutFlags,
    PutResult,
};
use crate::compress_encrypt::EnvelopeFactory;
use crate::config::CloudSettings;
use crate::error::{KvError, Result};

const MAX_RETRIES: usize = 8;
const BASE_TIMEOUT_MS: i64 = 30_000;
const DEL_BATCH: usize = 100;

/// S3 instantiation of [`BlobStore`]. Object bodies go through the
/// compress/encrypt envelope; clients come from a per-shard stack pool with
/// an adaptive request timeout tracking the observed worst case.
pub struct S3Backend {
    buckets: Vec<String>,
    endpoint: String,
    region: String,
    credentials: Credentials,
    envelope_factory: Arc<dyn EnvelopeFactory>,
    comp_method: u32,
    comp_method_metadata: u32,

    clients: Vec<Mutex<Vec<(i64, Client)>>>,
    max_request_timems: AtomicI64,
    n_requests: AtomicI64,

    uploaded_bytes: AtomicI64,
    downloaded_bytes: AtomicI64,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend").field("buckets", &self.buckets).finish()
    }
}

impl S3Backend {
    pub fn new(settings: &CloudSettings, envelope_factory: Arc<dyn EnvelopeFactory>) -> Self {
        let credentials = Credentials::new(
            settings.s3.access_key.clone(),
            settings.s3.secret_access_key.clone(),
            None,
            None,
            "cloudkv-settings",
        );

        Self {
            buckets: vec![settings.s3.bucket_name.clone()],
            endpoint: settings.s3.endpoint.clone(),
            region: settings.s3.region.clone(),
            credentials,
            envelope_factory,
            comp_method: settings.compression.submit_compression,
            comp_method_metadata: settings.compression.metadata_submit_compression,
            clients: vec![Mutex::new(Vec::new())],
            max_request_timems: AtomicI64::new(0),
            n_requests: AtomicI64::new(0),
            uploaded_bytes: AtomicI64::new(0),
            downloaded_bytes: AtomicI64::new(0),
        }
    }

    fn shard_of(&self, key: &str) -> usize {
        if self.clients.len() <= 1 {
            return 0;
        }
        let digest = Md5::digest(key.as_bytes());
        digest[0] as usize % self.clients.len()
    }

    fn bucket_of(&self, shard: usize) -> &str {
        &self.buckets[shard % self.buckets.len()]
    }

    /// Pops a pooled client for `shard` or builds one sized to the current
    /// adaptive timeout.
    fn obtain_client(&self, shard: usize) -> (i64, Client) {
        if let Some(entry) = self.clients[shard].lock().unwrap().pop() {
            let worst = self.max_request_timems.load(Ordering::Relaxed);
            if entry.0 >= worst * 2 || worst == 0 {
                return entry;
            }
            // observed latencies outgrew this client's timeout; rebuild
        }
        self.new_client()
    }

    fn release_client(&self, shard: usize, entry: (i64, Client)) {
        self.clients[shard].lock().unwrap().push(entry);
    }

    fn new_client(&self) -> (i64, Client) {
        let worst = self.max_request_timems.load(Ordering::Relaxed);
        let timeout_ms = (worst * 2).max(BASE_TIMEOUT_MS);

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::v2023_11_09())
            .credentials_provider(self.credentials.clone())
            .region(Region::new(self.region.clone()))
            .force_path_style(true)
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(Duration::from_millis(timeout_ms as u64))
                    .build(),
            );
        if !self.endpoint.is_empty() {
            builder = builder.endpoint_url(self.endpoint.clone());
        }

        (timeout_ms, Client::from_conf(builder.build()))
    }

    fn record_request(&self, elapsed: Duration) {
        self.n_requests.fetch_add(1, Ordering::Relaxed);
        let ms = elapsed.as_millis() as i64;
        self.max_request_timems.fetch_max(ms, Ordering::Relaxed);
    }

    async fn backoff(&self, attempt: usize) {
        let base = 100u64 * (1 << attempt.min(8));
        let jitter = rand::thread_rng().gen_range(0..100);
        tokio::time::sleep(Duration::from_millis((base + jitter).min(30_000))).await;
    }

    fn envelope_codec(&self, metadata: bool) -> u32 {
        if metadata {
            self.comp_method_metadata
        } else {
            self.comp_method
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for S3Backend {
    #[tracing::instrument(level = "debug", skip(self, dst))]
    async fn get(
        &self,
        key: &str,
        _want_md5: &[u8],
        flags: GetFlags,
        dst: &Path,
    ) -> Result<GetResult> {
        let shard = self.shard_of(key);
        let mut last_err = String::new();

        for attempt in 0..MAX_RETRIES {
            let client = self.obtain_client(shard);
            let started = std::time::Instant::now();
            let res = client
                .1
                .get_object()
                .bucket(self.bucket_of(shard))
                .key(key)
                .send()
                .await;
            self.record_request(started.elapsed());

            match res {
                Ok(resp) => {
                    self.release_client(shard, client);
                    let body = resp
                        .body
                        .collect()
                        .await
                        .map_err(|e| KvError::TransientBackend(e.to_string()))?
                        .into_bytes();
                    self.downloaded_bytes.fetch_add(body.len() as i64, Ordering::Relaxed);

                    let md5sum = Md5::digest(&body).to_vec();
                    let out = if flags.contains(GetFlags::DECRYPTED) {
                        self.envelope_factory.create(0).unwrap(&body)?
                    } else {
                        body.to_vec()
                    };

                    let mut payload = Vec::with_capacity(out.len() + 16);
                    if flags.contains(GetFlags::PREPEND_MD5SUM) {
                        payload.extend_from_slice(&md5sum);
                    }
                    payload.extend_from_slice(&out);
                    tokio::fs::write(dst, &payload).await?;

                    return Ok(GetResult { md5sum, status: GetStatus::default() });
                }
                Err(err) => {
                    if err
                        .as_service_error()
                        .map(|e| e.is_no_such_key())
                        .unwrap_or(false)
                    {
                        self.release_client(shard, client);
                        return Ok(GetResult {
                            md5sum: Vec::new(),
                            status: GetStatus::NOT_FOUND,
                        });
                    }
                    // drop the client; its connection may be the problem
                    last_err = err.to_string();
                    warn!(key, attempt, error = %last_err, "backend get failed");
                    self.backoff(attempt).await;
                }
            }
        }
        Err(KvError::TransientBackend(last_err))
    }

    #[tracing::instrument(level = "debug", skip(self, src))]
    async fn put(&self, key: &str, src: &Path, flags: PutFlags) -> Result<PutResult> {
        let plain = tokio::fs::read(src).await?;
        let body = if flags.contains(PutFlags::ALREADY_COMPRESSED_ENCRYPTED) {
            plain
        } else {
            let codec = self.envelope_codec(flags.contains(PutFlags::METADATA));
            self.envelope_factory.create(codec).wrap(&plain)?
        };
        let md5sum = Md5::digest(&body).to_vec();
        let size = body.len() as i64;
        let shard = self.shard_of(key);

        let mut last_err = String::new();
        for attempt in 0..MAX_RETRIES {
            let client = self.obtain_client(shard);
            let started = std::time::Instant::now();
            let res = client
                .1
                .put_object()
                .bucket(self.bucket_of(shard))
                .key(key)
                .body(bytes::Bytes::from(body.clone()).into())
                .send()
                .await;
            self.record_request(started.elapsed());

            match res {
                Ok(_) => {
                    self.release_client(shard, client);
                    self.uploaded_bytes.fetch_add(size, Ordering::Relaxed);
                    return Ok(PutResult { md5sum, size });
                }
                Err(err) => {
                    last_err = err.to_string();
                    warn!(key, attempt, error = %last_err, "backend put failed");
                    self.backoff(attempt).await;
                }
            }
        }
        Err(KvError::TransientBackend(last_err))
    }

    async fn list(
        &self,
        callback: &mut (dyn FnMut(ListedObject) -> bool + Send),
    ) -> Result<()> {
        let client = self.obtain_client(0);
        let mut continuation: Option<String> = None;

        'pages: loop {
            let mut req = client.1.list_objects_v2().bucket(self.bucket_of(0));
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| KvError::TransientBackend(e.to_string()))?;

            for obj in resp.contents() {
                let key = obj.key().unwrap_or_default().to_string();
                let md5sum = obj
                    .e_tag()
                    .map(|etag| {
                        hex_simd::decode_to_vec(etag.trim_matches('"')).unwrap_or_default()
                    })
                    .unwrap_or_default();
                let item = ListedObject {
                    key,
                    md5sum,
                    size: obj.size().unwrap_or(0),
                    last_modified: obj
                        .last_modified()
                        .map(|t| t.secs())
                        .unwrap_or(0),
                };
                if !callback(item) {
                    break 'pages;
                }
            }

            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        self.release_client(0, client);
        Ok(())
    }

    async fn del(
        &self,
        keys: &mut dyn KeyStream,
        mut locinfo: Option<&mut (dyn LocinfoStream + 'static)>,
        _background_queue: bool,
    ) -> Result<()> {
        loop {
            let mut batch = Vec::with_capacity(DEL_BATCH);
            while batch.len() < DEL_BATCH {
                let Some(key) = keys.next() else { break };
                // location info runs in lockstep; S3 keys are self-locating
                if let Some(locinfo) = locinfo.as_deref_mut() {
                    locinfo.next();
                }
                batch.push(key);
            }
            if batch.is_empty() {
                break;
            }

            let shard = self.shard_of(&batch[0]);
            let mut objects = Vec::with_capacity(batch.len());
            for key in &batch {
                objects.push(
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| KvError::Misuse(e.to_string()))?,
                );
            }
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| KvError::Misuse(e.to_string()))?;

            let mut last_err = String::new();
            let mut done = false;
            for attempt in 0..MAX_RETRIES {
                let client = self.obtain_client(shard);
                let started = std::time::Instant::now();
                let res = client
                    .1
                    .delete_objects()
                    .bucket(self.bucket_of(shard))
                    .delete(delete.clone())
                    .send()
                    .await;
                self.record_request(started.elapsed());

                match res {
                    Ok(_) => {
                        self.release_client(shard, client);
                        done = true;
                        break;
                    }
                    Err(err) => {
                        last_err = err.to_string();
                        warn!(attempt, error = %last_err, "backend delete batch failed");
                        self.backoff(attempt).await;
                    }
                }
            }
            if !done {
                return Err(KvError::TransientBackend(last_err));
            }
            debug!(n = batch.len(), "deleted backend objects");
        }

        keys.clear();
        if let Some(locinfo) = locinfo {
            locinfo.clear();
        }
        Ok(())
    }

    async fn sync(&self, _background_queue: bool) -> Result<()> {
        // puts are durable on return
        Ok(())
    }

    fn max_del_size(&self) -> usize {
        100
    }

    fn can_read_unsynced(&self) -> bool {
        true
    }

    fn is_put_sync(&self) -> bool {
        true
    }

    fn del_with_location_info(&self) -> bool {
        true
    }

    async fn check_deleted(&self, key: &str, _locinfo: &[u8]) -> bool {
        let shard = self.shard_of(key);
        let client = self.obtain_client(shard);
        let res = client
            .1
            .head_object()
            .bucket(self.bucket_of(shard))
            .key(key)
            .send()
            .await;
        self.release_client(shard, client);
        matches!(res, Err(ref e) if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false))
    }

    fn get_uploaded_bytes(&self) -> i64 {
        self.uploaded_bytes.load(Ordering::Relaxed)
    }

    fn get_downloaded_bytes(&self) -> i64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    fn meminfo(&self) -> String {
        let pooled: usize = self.clients.iter().map(|s| s.lock().unwrap().len()).sum();
        format!(
            "s3 backend: {pooled} pooled clients, {} requests, worst request {} ms\n",
            self.n_requests.load(Ordering::Relaxed),
            self.max_request_timems.load(Ordering::Relaxed),
        )
    }
}
