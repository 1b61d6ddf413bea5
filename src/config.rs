//! Configuration loader and validator shared by every pipeline stage.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
///
/// Every section is optional in the file; missing keys take the defaults
/// below, so a minimal config only needs the values that differ.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub database: Database,
    pub fetcher: Fetcher,
    pub compiler: Compiler,
    pub publisher: Publisher,
    pub public: Public,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Database {
    pub url: String,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/rssmix.db".into(),
        }
    }
}

/// Fetch cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Fetcher {
    pub interval_secs: u64,
    pub store_dir: String,
    /// Number of one-character directory levels above each cache file (0 = flat).
    pub shard_depth: usize,
    pub request_timeout_secs: u64,
    /// Sources probed concurrently within one pass.
    pub concurrency: usize,
    pub tls_insecure: bool,
    pub user_agent: String,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            store_dir: "./data/cache".into(),
            shard_depth: 3,
            request_timeout_secs: 5,
            concurrency: 1,
            tls_insecure: false,
            user_agent: concat!("rssmix/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

/// Merge engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Compiler {
    pub interval_secs: u64,
    /// Maximum items per compilation after sorting; 0 keeps everything.
    pub max_items: usize,
}

impl Default for Compiler {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_items: 0,
        }
    }
}

/// Publish gate settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Publisher {
    pub interval_secs: u64,
    pub command: Option<String>,
}

impl Default for Publisher {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            command: None,
        }
    }
}

/// Where compiled feeds are written and how they are addressed publicly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Public {
    pub protocol: String,
    pub hostname: String,
    pub subdirs: usize,
    pub output_dir: String,
    pub id_length: usize,
}

impl Default for Public {
    fn default() -> Self {
        Self {
            protocol: "https".into(),
            hostname: "localhost".into(),
            subdirs: 0,
            output_dir: "./data/public".into(),
            id_length: 10,
        }
    }
}

impl Config {
    /// Ensure the cache and output directories exist.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(&self.fetcher.store_dir)?;
        fs::create_dir_all(&self.public.output_dir)
    }

    /// Database URL, honouring a `DATABASE_URL` override from the environment.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| self.database.url.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.fetcher.request_timeout_secs)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetcher.interval_secs)
    }

    pub fn compile_interval(&self) -> Duration {
        Duration::from_secs(self.compiler.interval_secs)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publisher.interval_secs)
    }

    /// The publish command, or an error if the publish stage cannot run.
    pub fn publish_command(&self) -> Result<&str, ConfigError> {
        match self.publisher.command.as_deref().map(str::trim) {
            Some(cmd) if !cmd.is_empty() => Ok(cmd),
            _ => Err(ConfigError::Invalid("publisher.command must be set to run the publish stage")),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.database.url.trim().is_empty() {
        return Err(ConfigError::Invalid("database.url must be non-empty"));
    }

    if cfg.fetcher.interval_secs == 0 {
        return Err(ConfigError::Invalid("fetcher.interval_secs must be > 0"));
    }
    if cfg.fetcher.store_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("fetcher.store_dir must be non-empty"));
    }
    if cfg.fetcher.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("fetcher.request_timeout_secs must be > 0"));
    }
    if cfg.fetcher.concurrency == 0 {
        return Err(ConfigError::Invalid("fetcher.concurrency must be > 0"));
    }
    // shard_depth beyond the digest length would only repeat the full hash.
    if cfg.fetcher.shard_depth > 64 {
        return Err(ConfigError::Invalid("fetcher.shard_depth must be <= 64"));
    }

    if cfg.compiler.interval_secs == 0 {
        return Err(ConfigError::Invalid("compiler.interval_secs must be > 0"));
    }
    if cfg.publisher.interval_secs == 0 {
        return Err(ConfigError::Invalid("publisher.interval_secs must be > 0"));
    }

    if cfg.public.hostname.trim().is_empty() {
        return Err(ConfigError::Invalid("public.hostname must be non-empty"));
    }
    if cfg.public.protocol.trim().is_empty() {
        return Err(ConfigError::Invalid("public.protocol must be non-empty"));
    }
    if cfg.public.output_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("public.output_dir must be non-empty"));
    }
    if !(4..=32).contains(&cfg.public.id_length) {
        return Err(ConfigError::Invalid("public.id_length must be between 4 and 32"));
    }
    if cfg.public.subdirs > cfg.public.id_length {
        return Err(ConfigError::Invalid("public.subdirs must not exceed public.id_length"));
    }

    Ok(())
}

/// Example configuration with every key spelled out.
pub fn example() -> &'static str {
    r#"database:
  url: "sqlite://./data/rssmix.db"

fetcher:
  interval_secs: 600
  store_dir: "./data/cache"
  shard_depth: 3
  request_timeout_secs: 5
  concurrency: 1
  tls_insecure: false
  user_agent: "rssmix/0.1"

compiler:
  interval_secs: 60
  max_items: 100

publisher:
  interval_secs: 60
  command: "/usr/local/bin/rssmix-publish"

public:
  protocol: "https"
  hostname: "feeds.example.org"
  subdirs: 2
  output_dir: "./data/public"
  id_length: 10
"#
}
