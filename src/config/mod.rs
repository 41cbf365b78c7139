use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::cluster::ClusterKind;
use crate::lb::Algorithm;

/// Which cluster to talk to and where to start
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Backend product: memcache or search
    #[serde(default)]
    pub kind: ClusterKind,

    /// Seed endpoints used to build the initial pool
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Skip TLS certificate verification (search clusters over https)
    #[serde(default)]
    pub insecure_tls: bool,
}

/// Transport behaviour: discovery cadence, retry policy and resurrection
///
/// Durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Refresh topology in the background
    #[serde(default = "default_discover")]
    pub discover: bool,

    /// Seconds between background discoveries
    #[serde(default = "default_discover_interval")]
    pub discover_interval: u64,

    /// Refresh topology every N requests (0 disables)
    #[serde(default = "default_discover_after")]
    pub discover_after: u64,

    /// Retry on another connection after a network fault
    #[serde(default)]
    pub retry_on_failure: bool,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Seconds without a successful request before dead connections whose
    /// backoff has elapsed are brought back
    #[serde(default = "default_resurrect_after")]
    pub resurrect_after: u64,

    /// Resurrection backoff unit in seconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u64,

    /// Connection selection: round_robin or random
    #[serde(default)]
    pub selector: Algorithm,

    /// Hard deadline for one discovery call, in seconds
    #[serde(default = "default_timeout")]
    pub sniff_timeout: u64,

    /// Deadline for opening and probing a connection, in seconds
    #[serde(default = "default_timeout")]
    pub connect_timeout: u64,

    /// Seconds between pool status logs (debug only)
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval: u64,

    /// Verbose per-request diagnostics
    #[serde(default)]
    pub debug: bool,
}

fn default_discover() -> bool {
    true
}

fn default_discover_interval() -> u64 {
    120
}

fn default_discover_after() -> u64 {
    100_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_resurrect_after() -> u64 {
    30
}

fn default_backoff_base() -> u64 {
    60
}

fn default_timeout() -> u64 {
    5
}

fn default_housekeeping_interval() -> u64 {
    60
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            discover: default_discover(),
            discover_interval: default_discover_interval(),
            discover_after: default_discover_after(),
            retry_on_failure: false,
            max_retries: default_max_retries(),
            resurrect_after: default_resurrect_after(),
            backoff_base: default_backoff_base(),
            selector: Algorithm::default(),
            sniff_timeout: default_timeout(),
            connect_timeout: default_timeout(),
            housekeeping_interval: default_housekeeping_interval(),
            debug: false,
        }
    }
}

impl TransportConfig {
    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.discover && self.discover_interval == 0 {
            anyhow::bail!("discover_interval must be at least 1 second when discovery is enabled");
        }
        if self.sniff_timeout == 0 {
            anyhow::bail!("sniff_timeout must be at least 1 second");
        }
        if self.connect_timeout == 0 {
            anyhow::bail!("connect_timeout must be at least 1 second");
        }
        if self.housekeeping_interval == 0 {
            anyhow::bail!("housekeeping_interval must be at least 1 second");
        }
        Ok(())
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.cluster.seeds.is_empty() {
            anyhow::bail!("cluster.seeds contains no endpoints");
        }
        self.transport.validate()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    config.validate()?;
    Ok(config)
}

/// Load configuration from environment variables
///
/// - CLUSTER_SEEDS (comma-separated list of endpoints)
/// - CLUSTER_KIND (memcache or search, defaults to memcache)
/// - CLUSTER_INSECURE_TLS
/// - TRANSPORT_DISCOVER, TRANSPORT_DISCOVER_INTERVAL, TRANSPORT_DISCOVER_AFTER
/// - TRANSPORT_RETRY_ON_FAILURE, TRANSPORT_MAX_RETRIES
/// - TRANSPORT_RESURRECT_AFTER, TRANSPORT_SELECTOR, TRANSPORT_DEBUG
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::default();

    let seeds = std::env::var("CLUSTER_SEEDS")
        .context("CLUSTER_SEEDS environment variable not set")?;

    config.cluster.seeds = seeds
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if config.cluster.seeds.is_empty() {
        anyhow::bail!("CLUSTER_SEEDS contains no valid endpoints");
    }

    if let Ok(kind) = std::env::var("CLUSTER_KIND") {
        config.cluster.kind = ClusterKind::from_name(&kind);
    }
    if let Some(insecure) = env_flag("CLUSTER_INSECURE_TLS") {
        config.cluster.insecure_tls = insecure;
    }

    let transport = &mut config.transport;
    if let Some(discover) = env_flag("TRANSPORT_DISCOVER") {
        transport.discover = discover;
    }
    if let Some(interval) = env_parse("TRANSPORT_DISCOVER_INTERVAL") {
        transport.discover_interval = interval;
    }
    if let Some(after) = env_parse("TRANSPORT_DISCOVER_AFTER") {
        transport.discover_after = after;
    }
    if let Some(retry) = env_flag("TRANSPORT_RETRY_ON_FAILURE") {
        transport.retry_on_failure = retry;
    }
    if let Some(retries) = env_parse("TRANSPORT_MAX_RETRIES") {
        transport.max_retries = retries;
    }
    if let Some(after) = env_parse("TRANSPORT_RESURRECT_AFTER") {
        transport.resurrect_after = after;
    }
    if let Ok(selector) = std::env::var("TRANSPORT_SELECTOR") {
        transport.selector = Algorithm::from_name(&selector);
    }
    if let Some(debug) = env_flag("TRANSPORT_DEBUG") {
        transport.debug = debug;
    }

    config.validate()?;
    Ok(config)
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, otherwise the environment.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        load_from_yaml(path)
    } else {
        load_from_env()
    }
}
