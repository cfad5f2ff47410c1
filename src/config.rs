use config::{Config, Environment, File};
use pbkdf2::pbkdf2_hmac;
use serde::Deserialize;
use sha2::Sha256;

const DATA_KEY_ITERS: u32 = 100_000;
const DATA_KEY_SIZE: usize = 32;

/// Engine settings. Loaded from a config file layered with `CLOUDKV_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudSettings {
    /// Remote endpoint kind. Currently only "s3".
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Master secret. The data-encryption key is derived from it, never
    /// used directly.
    #[serde(default)]
    pub encryption_key: String,

    #[serde(default)]
    pub s3: S3Settings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub compression: CompressionSettings,

    #[serde(default)]
    pub behavior: BehaviorSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Settings {
    pub access_key: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub storage_class: String,
    #[serde(default)]
    pub cache_db_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub memcache_size: i64,
    #[serde(default)]
    pub reserved_cache_device_space: i64,
    #[serde(default)]
    pub min_metadata_cache_free: i64,
    #[serde(default = "default_memory_usage_factor")]
    pub memory_usage_factor: f64,
}

/// Codec tags per object class. `0` is "store uncompressed".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompressionSettings {
    #[serde(default)]
    pub background_compression: u32,
    #[serde(default)]
    pub cache_object_compression: u32,
    #[serde(default)]
    pub metadata_cache_object_compression: u32,
    #[serde(default)]
    pub submit_compression: u32,
    #[serde(default)]
    pub metadata_submit_compression: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BehaviorSettings {
    #[serde(default)]
    pub verify_cache: bool,
    #[serde(default)]
    pub background_compress: bool,
    #[serde(default)]
    pub no_compress_cpu_mult: u32,
    #[serde(default)]
    pub cpu_multiplier: u32,
    #[serde(default)]
    pub with_prev_link: bool,
    #[serde(default)]
    pub allow_evict: bool,
    #[serde(default)]
    pub with_submitted_files: bool,
    #[serde(default)]
    pub resubmit_compressed_ratio: f64,
    #[serde(default)]
    pub only_memfiles: bool,
}

fn default_endpoint() -> String {
    "s3".to_string()
}

fn default_memory_usage_factor() -> f64 {
    1.0
}

impl CloudSettings {
    pub fn new(config_path: &str) -> anyhow::Result<Self> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(Environment::with_prefix("CLOUDKV").separator("__"))
            .build()?;

        Ok(s.try_deserialize()?)
    }

    /// Derives the 32-byte data-encryption key from the master secret.
    pub fn derive_data_key(&self) -> [u8; DATA_KEY_SIZE] {
        let mut out = [0u8; DATA_KEY_SIZE];
        pbkdf2_hmac::<Sha256>(self.encryption_key.as_bytes(), b"", DATA_KEY_ITERS, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_key_is_deterministic() {
        let mut settings = CloudSettings {
            endpoint: default_endpoint(),
            encryption_key: "hunter2".to_string(),
            s3: S3Settings::default(),
            cache: CacheSettings::default(),
            compression: CompressionSettings::default(),
            behavior: BehaviorSettings::default(),
        };
        let k1 = settings.derive_data_key();
        let k2 = settings.derive_data_key();
        assert_eq!(k1, k2);

        settings.encryption_key = "hunter3".to_string();
        assert_ne!(k1, settings.derive_data_key());
    }
}
