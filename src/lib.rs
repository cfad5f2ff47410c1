//! Cloud-backed, content-addressed, transactional key-value store.
//!
//! A local SQLite metadata database indexes what should exist remotely; a
//! [`blob_store::BlobStore`] holds the object bodies. Writes are staged
//! through a single-writer database worker, deletes become tombstones that
//! a background worker later reclaims together with the superseded backend
//! blobs, and optional mirror/scrub workers keep a replica in step and the
//! content hashes honest.

#[macro_use]
mod error;

pub mod background;
pub mod blob_store;
pub mod collector;
pub mod compress_encrypt;
pub mod config;
pub mod file_index;
pub mod frontend;
pub mod keys;
pub mod mem_backend;
pub mod meta_db;
pub mod mirror;
pub mod put_worker;
pub mod s3_backend;
pub mod scrub;
mod varint;

pub use blob_store::{BlobStore, GetFlags, GetResult, GetStatus, PutFlags, PutResult};
pub use collector::ObjectCollector;
pub use config::CloudSettings;
pub use error::{FailBits, KvError, Result};
pub use file_index::{FileEntryIndex, IndexKey};
pub use frontend::{KvStore, StoreOptions};
pub use mem_backend::MemBackend;
pub use s3_backend::S3Backend;
pub use scrub::ScrubAction;

use std::sync::Arc;

use compress_encrypt::ZlibEnvelopeFactory;

/// Builds the remote store the settings describe: the in-process backend
/// when `only_memfiles` is set, otherwise S3 with the envelope keyed off
/// the derived data key.
pub fn create_backend(settings: &CloudSettings) -> Result<Arc<dyn BlobStore>> {
    if settings.behavior.only_memfiles {
        return Ok(Arc::new(MemBackend::new()));
    }
    match settings.endpoint.as_str() {
        "s3" => {
            let envelope = Arc::new(ZlibEnvelopeFactory::new(settings.derive_data_key()));
            Ok(Arc::new(S3Backend::new(settings, envelope)))
        }
        other => Err(KvError::Misuse(format!("unknown endpoint {other}"))),
    }
}
