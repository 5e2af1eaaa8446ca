//! Server configuration.
//!
//! The configuration is a single JSON document. Everything is
//! read-only after startup: the signing keys, the namespace table and
//! the storage layout never change while the server is running.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use granary::chunking::ChunkerParams;
use granary::namespace::Namespace;
use granary::signing::{Keypair, PublicKey};

/// Configuration for the granary server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address to listen on.
    #[serde(default = "default_listen_address")]
    pub listen: SocketAddr,

    /// Logging.
    #[serde(default = "Default::default")]
    pub log: LogConfig,

    /// Root directory of the local tier.
    ///
    /// Chunks live under `store/`, indices under `index/<namespace>/`,
    /// and upload scratch files under `tmp/`.
    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,

    /// Data chunking.
    ///
    /// Warning: If you change any of the values here, it will be
    /// difficult to reuse existing chunks for newly-ingested artifacts
    /// since the cutpoints will be different. As a result, the
    /// deduplication ratio will suffer for a while after the change.
    pub chunking: ChunkingConfig,

    /// Compression applied to chunks on the local tier.
    ///
    /// Invisible to readers; changing it only affects newly written
    /// chunks.
    #[serde(rename = "chunk-compression")]
    #[serde(default = "Default::default")]
    pub chunk_compression: ChunkCompression,

    /// Local-tier size budget, in GiB.
    ///
    /// If 0, LRU eviction is disabled and the local tier grows without
    /// bound.
    #[serde(rename = "max-cache-size")]
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,

    /// Garbage collection.
    #[serde(rename = "garbage-collection")]
    #[serde(default = "Default::default")]
    pub garbage_collection: GarbageCollectionConfig,

    /// Request deadlines.
    #[serde(default = "Default::default")]
    pub timeouts: TimeoutConfig,

    /// Object-store tier (optional).
    #[serde(rename = "object-store")]
    pub object_store: Option<S3StorageConfig>,

    /// Namespaces served by this instance.
    pub namespaces: HashMap<Namespace, NamespaceConfig>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log filter, in `tracing_subscriber::EnvFilter` syntax.
    ///
    /// `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output mode.
    #[serde(default = "Default::default")]
    pub mode: LogMode,
}

/// Log output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum LogMode {
    /// Human-readable output.
    #[serde(rename = "full")]
    #[default]
    Full,

    /// Condensed single-line output.
    #[serde(rename = "compact")]
    Compact,

    /// One line of JSON per event.
    #[serde(rename = "json")]
    Json,
}

/// Data chunking.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    /// The preferred minimum size of a chunk, in bytes.
    #[serde(rename = "min-size")]
    pub min_size: usize,

    /// The preferred average size of a chunk, in bytes.
    #[serde(rename = "avg-size")]
    pub avg_size: usize,

    /// The preferred maximum size of a chunk, in bytes.
    #[serde(rename = "max-size")]
    pub max_size: usize,
}

/// Compression applied to stored chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum ChunkCompression {
    /// Store chunks as-is.
    #[serde(rename = "none")]
    #[default]
    None,

    /// ZSTD.
    #[serde(rename = "zstd")]
    Zstd,
}

/// Garbage collection config.
#[derive(Debug, Clone, Deserialize)]
pub struct GarbageCollectionConfig {
    /// The frequency to run garbage collection at.
    ///
    /// If zero, automatic garbage collection is disabled, but it can
    /// still be run manually with `granaryd --mode garbage-collector-once`.
    #[serde(with = "humantime_serde", default = "default_gc_interval")]
    pub interval: Duration,

    /// Whether each pass re-hashes every stored chunk.
    #[serde(default = "default_gc_verify")]
    pub verify: bool,
}

/// Request deadlines.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Deadline for HEAD requests.
    #[serde(with = "humantime_serde", default = "default_head_timeout")]
    pub head: Duration,

    /// Deadline for narinfo GET requests.
    #[serde(rename = "narinfo-get")]
    #[serde(with = "humantime_serde", default = "default_narinfo_get_timeout")]
    pub narinfo_get: Duration,

    /// Deadline for NAR GET requests.
    #[serde(rename = "nar-get")]
    #[serde(with = "humantime_serde", default = "default_nar_get_timeout")]
    pub nar_get: Duration,

    /// How long an ingest sink may stall before it is dropped.
    #[serde(rename = "ingest-stall")]
    #[serde(with = "humantime_serde", default = "default_ingest_stall_timeout")]
    pub ingest_stall: Duration,
}

/// S3-compatible object store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    /// The AWS region.
    pub region: String,

    /// The name of the bucket.
    pub bucket: String,

    /// Custom S3 endpoint.
    ///
    /// Set this if you are using an S3-compatible object storage (e.g., Minio).
    pub endpoint: Option<String>,

    /// Key prefix for all objects written by this instance.
    #[serde(default = "Default::default")]
    pub prefix: String,

    /// Compression applied to chunks stored in the bucket.
    ///
    /// Invisible to readers, like the local-tier setting.
    #[serde(rename = "chunk-compression")]
    #[serde(default = "Default::default")]
    pub chunk_compression: ChunkCompression,

    /// Path to a JSON file holding the S3 credentials.
    ///
    /// If not specified, credentials are read from the `AWS_ACCESS_KEY_ID`
    /// and `AWS_SECRET_ACCESS_KEY` environment variables.
    #[serde(rename = "credentials-file")]
    pub credentials_file: Option<PathBuf>,
}

/// S3 credential file contents.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Credentials {
    /// Access key ID.
    pub access_key_id: String,

    /// Secret access key.
    pub secret_access_key: String,
}

/// Per-namespace configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceConfig {
    /// Upstream caches consulted on a local miss, in no particular order.
    #[serde(default = "Vec::new")]
    pub substituters: Vec<String>,

    /// Public keys whose manifest signatures are preserved on ingress.
    #[serde(rename = "trusted-public-keys")]
    #[serde(default = "Vec::new")]
    pub trusted_public_keys: Vec<String>,

    /// Path to the secret key used to sign unsigned manifests.
    ///
    /// The file contains a key in the `{name}:{base64}` format produced
    /// by `nix-store --generate-binary-cache-key`.
    #[serde(rename = "secret-key-file")]
    pub secret_key_file: Option<PathBuf>,

    /// The priority advertised in `nix-cache-info`.
    ///
    /// A lower number denotes a higher priority.
    /// <https://cache.nixos.org> has a priority of 40.
    #[serde(default = "default_priority")]
    pub priority: i32,
}

/// Key material for one namespace, loaded at startup.
#[derive(Debug)]
pub struct NamespaceKeys {
    /// The signing keypair, if configured.
    pub keypair: Option<Keypair>,

    /// The set of trusted public keys.
    pub trusted_keys: Vec<PublicKey>,
}

impl Config {
    /// Returns the validated chunker parameters.
    pub fn chunker_params(&self) -> Result<ChunkerParams> {
        ChunkerParams::new(
            self.chunking.min_size,
            self.chunking.avg_size,
            self.chunking.max_size,
        )
        .map_err(|e| anyhow!("Invalid chunking configuration: {}", e))
    }

    /// Returns the local-tier byte budget, or `None` if eviction is disabled.
    pub fn max_cache_bytes(&self) -> Option<u64> {
        if self.max_cache_size == 0 {
            None
        } else {
            Some(self.max_cache_size * 1024 * 1024 * 1024)
        }
    }
}

/// Loads the configuration from a file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration from {}", path.display()))?;
    let config: Config = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse configuration from {}", path.display()))?;

    config.chunker_params()?;

    Ok(config)
}

/// Loads the key material for every configured namespace.
///
/// A missing or unreadable secret key is fatal. A malformed trusted
/// public key only disables verification under that key.
pub fn load_keys(config: &Config) -> Result<HashMap<Namespace, NamespaceKeys>> {
    let mut keys = HashMap::new();

    for (namespace, ns_config) in &config.namespaces {
        let keypair = match &ns_config.secret_key_file {
            Some(path) => {
                let content = std::fs::read_to_string(path).with_context(|| {
                    format!(
                        "Failed to read the secret key for namespace \"{}\" from {}",
                        namespace,
                        path.display()
                    )
                })?;

                let keypair = Keypair::from_str(content.trim()).map_err(|e| {
                    anyhow!(
                        "Invalid secret key for namespace \"{}\": {}",
                        namespace,
                        e
                    )
                })?;

                Some(keypair)
            }
            None => None,
        };

        let mut trusted_keys = Vec::new();
        for key in &ns_config.trusted_public_keys {
            match PublicKey::from_str(key) {
                Ok(key) => trusted_keys.push(key),
                Err(e) => {
                    tracing::warn!(
                        "Ignoring malformed trusted public key \"{}\" in namespace \"{}\": {}",
                        key,
                        namespace,
                        e
                    );
                }
            }
        }

        keys.insert(
            namespace.clone(),
            NamespaceKeys {
                keypair,
                trusted_keys,
            },
        );
    }

    Ok(keys)
}

/// Loads S3 credentials from the configured file.
pub fn load_s3_credentials(config: &S3StorageConfig) -> Result<Option<S3Credentials>> {
    match &config.credentials_file {
        Some(path) => {
            let content = std::fs::read_to_string(path).with_context(|| {
                format!("Failed to read S3 credentials from {}", path.display())
            })?;
            let credentials = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse S3 credentials from {}", path.display()))?;
            Ok(Some(credentials))
        }
        None => Ok(None),
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            mode: LogMode::Full,
        }
    }
}

impl Default for GarbageCollectionConfig {
    fn default() -> Self {
        Self {
            interval: default_gc_interval(),
            verify: default_gc_verify(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            head: default_head_timeout(),
            narinfo_get: default_narinfo_get_timeout(),
            nar_get: default_nar_get_timeout(),
            ingest_stall: default_ingest_stall_timeout(),
        }
    }
}

fn default_listen_address() -> SocketAddr {
    "[::]:8080".parse().unwrap()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_cache_size() -> u64 {
    0
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(43200)
}

fn default_gc_verify() -> bool {
    false
}

fn default_head_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_narinfo_get_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_nar_get_timeout() -> Duration {
    Duration::from_secs(1800)
}

fn default_ingest_stall_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_priority() -> i32 {
    40
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let json = r#"
        {
            "data-dir": "/var/lib/granary",
            "chunking": { "min-size": 16384, "avg-size": 65536, "max-size": 262144 },
            "namespaces": {
                "oss": {
                    "substituters": ["https://cache.nixos.org"],
                    "trusted-public-keys": ["cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY="]
                }
            }
        }
        "#;

        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!("[::]:8080".parse::<SocketAddr>().unwrap(), config.listen);
        assert_eq!(None, config.max_cache_bytes());
        assert_eq!(Duration::from_secs(60), config.timeouts.head);
        assert_eq!(Duration::from_secs(1800), config.timeouts.nar_get);
        assert_eq!(ChunkCompression::None, config.chunk_compression);
        assert!(config.object_store.is_none());

        let ns: Namespace = "oss".parse().unwrap();
        let ns_config = &config.namespaces[&ns];
        assert_eq!(40, ns_config.priority);
        assert!(ns_config.secret_key_file.is_none());

        config.chunker_params().unwrap();
    }

    #[test]
    fn test_parse_full() {
        let json = r#"
        {
            "listen": "127.0.0.1:5000",
            "log": { "level": "debug", "mode": "json" },
            "data-dir": "/var/lib/granary",
            "chunking": { "min-size": 16384, "avg-size": 65536, "max-size": 262144 },
            "chunk-compression": "zstd",
            "max-cache-size": 100,
            "garbage-collection": { "interval": "1h", "verify": true },
            "timeouts": { "head": "30s", "narinfo-get": "45s", "nar-get": "10m", "ingest-stall": "5s" },
            "object-store": {
                "region": "us-east-1",
                "bucket": "granary",
                "endpoint": "http://127.0.0.1:9000",
                "prefix": "cache/"
            },
            "namespaces": {
                "prod": { "priority": 30 }
            }
        }
        "#;

        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(Some(100 * 1024 * 1024 * 1024), config.max_cache_bytes());
        assert_eq!(Duration::from_secs(3600), config.garbage_collection.interval);
        assert!(config.garbage_collection.verify);
        assert_eq!(Duration::from_secs(600), config.timeouts.nar_get);
        assert_eq!(ChunkCompression::Zstd, config.chunk_compression);
        assert_eq!("cache/", config.object_store.unwrap().prefix);
    }

    #[test]
    fn test_log_modes() {
        for (value, mode) in [
            ("full", LogMode::Full),
            ("compact", LogMode::Compact),
            ("json", LogMode::Json),
        ] {
            let json = format!(r#"{{ "level": "info", "mode": "{}" }}"#, value);
            let parsed: LogConfig = serde_json::from_str(&json).unwrap();
            assert_eq!(mode, parsed.mode);
        }

        assert!(serde_json::from_str::<LogConfig>(r#"{ "mode": "verbose" }"#).is_err());
    }

    #[test]
    fn test_rejects_bad_chunking() {
        let json = r#"
        {
            "data-dir": "/var/lib/granary",
            "chunking": { "min-size": 65536, "avg-size": 16384, "max-size": 262144 },
            "namespaces": {}
        }
        "#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.chunker_params().is_err());
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let json = r#"{ "data-dir": "/tmp", "chunking": { "min-size": 1, "avg-size": 2, "max-size": 3 }, "namespaces": {}, "surprise": true }"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }
}
