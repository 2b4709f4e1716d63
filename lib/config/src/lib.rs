//! Configuration management for VSentry.
//!
//! Uses [Config](https://docs.rs/config/latest/config/index.html), supports loading from:
//! - Configuration files (YAML, JSON, TOML)
//! - Environment variables (VSENTRY_ prefix)
//! - Defaults
//!
//! Environment variables override file settings, enabling Docker/K8s
//! deployments without rebuilding config files.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use config::Config;
use serde::{Deserialize, Serialize};
use url::Url;

/// HTTP listener configuration for the API server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080)),
        }
    }
}

/// Location of the external columnar log store.
///
/// VSentry composes `<url>/insert/jsonline` for forwarder flushes and
/// `<url>/select/logsql/query` for rule evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: Url,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            url: Url::parse("http://127.0.0.1:9428").expect("default backend url"),
        }
    }
}

impl BackendConfig {
    /// Base URL with any trailing slash removed, ready for path joining.
    pub fn base(&self) -> String {
        self.url.as_str().trim_end_matches('/').to_string()
    }

    pub fn insert_url(&self) -> String {
        format!("{}/insert/jsonline", self.base())
    }

    pub fn query_url(&self) -> String {
        format!("{}/select/logsql/query", self.base())
    }
}

/// Ingest pipeline tuning. The queue capacity exists as a knob mostly so
/// tests can build small isolated pipelines; production deployments keep
/// the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestTuning {
    pub queue_capacity: usize,
}

impl Default for IngestTuning {
    fn default() -> Self {
        IngestTuning {
            queue_capacity: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
struct VSentryConfigOptions {
    /// API server listener
    server: Option<ServerConfig>,

    /// Log backend (insert + query endpoints)
    backend: Option<BackendConfig>,

    /// Path to the SQLite database file
    db: Option<PathBuf>,

    /// Path to the sled token-cache directory
    cache: Option<PathBuf>,

    /// Ingest pipeline tuning
    ingest: Option<IngestTuning>,
}

#[derive(Debug, Clone)]
pub struct VSentryConfig {
    pub server: ServerConfig,

    pub backend: BackendConfig,

    pub db: PathBuf,

    pub cache: PathBuf,

    pub ingest: IngestTuning,
}

impl From<VSentryConfigOptions> for VSentryConfig {
    fn from(val: VSentryConfigOptions) -> Self {
        VSentryConfig {
            server: val.server.unwrap_or_default(),
            backend: val.backend.unwrap_or_default(),
            db: val.db.unwrap_or_else(|| PathBuf::from("vsentry.db")),
            cache: val.cache.unwrap_or_else(|| PathBuf::from("vsentry-cache")),
            ingest: val.ingest.unwrap_or_default(),
        }
    }
}

impl VSentryConfig {
    pub fn new() -> Result<Self> {
        let builder = Config::builder()
            .add_source(config::File::from_str(
                serde_json::to_string(&VSentryConfigOptions::default())?.as_str(),
                config::FileFormat::Json,
            ))
            .add_source(config::Environment::with_prefix("VSENTRY").separator("_"))
            .build()?;

        let config: VSentryConfigOptions = builder.try_deserialize()?;
        Self::check(&config)?;

        Ok(config.into())
    }

    pub fn from_file(file: &str) -> Result<Self> {
        let builder = Config::builder()
            .add_source(config::File::from_str(
                serde_json::to_string(&VSentryConfigOptions::default())?.as_str(),
                config::FileFormat::Json,
            ))
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("VSENTRY").separator("_"))
            .build()?;

        let config: VSentryConfigOptions = builder.try_deserialize()?;
        Self::check(&config)?;

        Ok(config.into())
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        let builder = Config::builder()
            .add_source(config::File::from_str(
                serde_json::to_string(&VSentryConfigOptions::default())?.as_str(),
                config::FileFormat::Json,
            ))
            .add_source(config::File::from_str(s, config::FileFormat::Yaml))
            .add_source(config::Environment::with_prefix("VSENTRY").separator("_"))
            .build()?;

        let config: VSentryConfigOptions = builder.try_deserialize()?;
        Self::check(&config)?;

        Ok(config.into())
    }

    fn check(config: &VSentryConfigOptions) -> Result<()> {
        if let Some(backend) = &config.backend {
            match backend.url.scheme() {
                "http" | "https" => {}
                other => Err(anyhow!("unsupported backend url scheme: {other}"))?,
            }
        }
        if let Some(ingest) = &config.ingest
            && ingest.queue_capacity == 0
        {
            Err(anyhow!("ingest.queue_capacity must be > 0"))?
        }
        Ok(())
    }
}

mod tests;
