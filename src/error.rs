use std::panic::Location;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::error;

/// Error kinds surfaced across the store boundary.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("object not found")]
    NotFound,

    #[error("backend request failed: {0}")]
    TransientBackend(String),

    #[error("content hash mismatch for key {0}")]
    IntegrityMismatch(String),

    #[error("out of space")]
    Enospc,

    #[error("store corrupted: {0}")]
    Corruption(String),

    #[error("invalid argument: {0}")]
    Misuse(String),

    #[error("metadata database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("file index error: {0}")]
    Index(#[from] heed::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KvError>;

impl KvError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::NotFound)
    }
}

#[inline]
#[track_caller]
pub(crate) fn log(source: &dyn std::error::Error) {
    let location = Location::caller();
    let span_trace = tracing_error::SpanTrace::capture();

    error!(
        target: "cloudkv",
        %location,
        error=%source,
        "span trace:\n{span_trace}"
    );
}

macro_rules! try_log {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(err) => {
                crate::error::log(&err);
                return Err(err.into());
            }
        }
    };
}

/// Process-wide failure latch. Once the corruption bit is set, mutating
/// entry points refuse work until `reset` is called.
#[derive(Debug, Default)]
pub struct FailBits(AtomicU32);

impl FailBits {
    pub const DATABASE_CORRUPTED: u32 = 1;
    pub const DATABASE_FULL: u32 = 2;

    pub fn set(&self, bit: u32) {
        self.0.fetch_or(bit, Ordering::SeqCst);
    }

    pub fn has(&self, bit: u32) -> bool {
        self.0.load(Ordering::SeqCst) & bit != 0
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}
