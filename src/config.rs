//! TOML configuration for hostdiff.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working local setup. The configuration is loaded once by the
//! binary and handed to whatever needs it; nothing reads it globally.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collect::retry::RetryPolicy;
use crate::collect::InvocationPoller;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "HOSTDIFF_CONFIG";
/// Config file picked up from the working directory.
pub const LOCAL_CONFIG_FILE: &str = "hostdiff.toml";

const LISTENING_PORTS_QUERY: &str = "osqueryi --json \"SELECT address, port, name, pid, cmdline \
     FROM listening_ports, processes USING (pid) WHERE protocol = 6 and family = 2 \
     AND address NOT LIKE '127.0.0.%'\"";
const CRONTAB_QUERY: &str = "osqueryi --json \"SELECT * FROM crontab\"";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostDiffConfig {
    /// Accounts hostdiff operates in.
    pub accounts: Vec<String>,
    /// Regions remote collection may target.
    pub regions: Vec<String>,
    pub default_region: String,
    pub plugins: PluginDefaults,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    pub osquery: OsqueryConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Default for HostDiffConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            regions: vec![
                "us-east-1".to_string(),
                "us-west-2".to_string(),
                "eu-west-1".to_string(),
            ],
            default_region: "us-west-2".to_string(),
            plugins: PluginDefaults::default(),
            local: LocalConfig::default(),
            remote: RemoteConfig::default(),
            osquery: OsqueryConfig::default(),
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl HostDiffConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Try `$HOSTDIFF_CONFIG`, then `./hostdiff.toml`, then defaults.
    ///
    /// Runs before logging is set up, so nothing is logged here; hand the
    /// returned [`ConfigOrigin`] to [`ConfigOrigin::log`] once it is.
    pub fn load_or_default() -> (Self, ConfigOrigin) {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::load_first(env_path.as_deref(), Path::new(LOCAL_CONFIG_FILE))
    }

    /// Load `env_path` if given, else `local_path` if it exists, else defaults.
    /// A candidate that fails to load is recorded and the next one is tried.
    pub fn load_first(env_path: Option<&Path>, local_path: &Path) -> (Self, ConfigOrigin) {
        let mut origin = ConfigOrigin::default();

        let candidates = env_path
            .into_iter()
            .chain(local_path.exists().then_some(local_path));
        for path in candidates {
            match Self::load(path) {
                Ok(config) => {
                    origin.path = Some(path.to_path_buf());
                    return (config, origin);
                }
                Err(e) => origin.skipped.push((path.to_path_buf(), format!("{e:#}"))),
            }
        }

        (Self::default(), origin)
    }
}

/// Where [`HostDiffConfig::load_or_default`] found its configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOrigin {
    /// File the configuration came from; `None` means compiled-in defaults.
    pub path: Option<PathBuf>,
    /// Files that were tried and could not be loaded, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

impl ConfigOrigin {
    pub fn from_path(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            skipped: Vec::new(),
        }
    }

    pub fn log(&self) {
        for (path, error) in &self.skipped {
            warn!(path = %path.display(), %error, "config file could not be loaded, trying fallback");
        }
        match &self.path {
            Some(path) => info!(path = %path.display(), "loaded hostdiff configuration"),
            None => debug!("no config file found, using compiled-in defaults"),
        }
    }
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

/// Plugin slugs used when a command doesn't name one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginDefaults {
    pub target: String,
    pub payload: String,
    pub collection: String,
    pub persistence: String,
    pub analysis: String,
}

impl Default for PluginDefaults {
    fn default() -> Self {
        Self {
            target: "local-target".to_string(),
            payload: "local-command".to_string(),
            collection: "local-shell-collection".to_string(),
            persistence: "local-file".to_string(),
            analysis: "local-simple".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory the file store writes into.
    pub file_directory: PathBuf,
    /// Commands the local payload sends unchanged.
    pub commands: Vec<String>,
    /// Per-command timeout for local collection.
    pub command_timeout_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            file_directory: PathBuf::from("data"),
            commands: vec![LISTENING_PORTS_QUERY.to_string(), CRONTAB_QUERY.to_string()],
            command_timeout_secs: 60,
        }
    }
}

impl LocalConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Role assumed in each target account.
    pub assume_role: String,
    /// Command document run on the instances.
    pub document: String,
    /// Instances per submission.
    pub chunk_size: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            assume_role: "Diffy".to_string(),
            document: "AWS-RunShellScript".to_string(),
            chunk_size: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Osquery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OsqueryConfig {
    /// Object key of the osquery bundle fetched when `osqueryi` is missing.
    pub key: String,
    /// Region of the bucket holding the bundle.
    pub region: String,
    pub commands: Vec<String>,
}

impl Default for OsqueryConfig {
    fn default() -> Self {
        Self {
            key: "osquery-download".to_string(),
            region: "us-west-2".to_string(),
            commands: vec![CRONTAB_QUERY.to_string(), LISTENING_PORTS_QUERY.to_string()],
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub throttle_attempts: u32,
    pub throttle_base_ms: u64,
    pub pending_base_ms: u64,
    /// Optional ceiling on the wait between poll cycles.
    pub pending_max_delay_secs: Option<u64>,
    /// Give up on pending invocations after this long.
    pub poll_deadline_secs: Option<u64>,
    /// Give up on pending invocations after this many poll cycles.
    pub poll_max_cycles: Option<u32>,
    pub storage_attempts: u32,
    pub storage_max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            throttle_attempts: 7,
            throttle_base_ms: 1000,
            pending_base_ms: 1000,
            pending_max_delay_secs: None,
            poll_deadline_secs: None,
            poll_max_cycles: None,
            storage_attempts: 3,
            storage_max_delay_secs: 10,
        }
    }
}

impl RetryConfig {
    pub fn throttle(&self) -> RetryPolicy {
        RetryPolicy::throttling()
            .with_max_attempts(Some(self.throttle_attempts))
            .with_base(Duration::from_millis(self.throttle_base_ms))
    }

    pub fn pending(&self) -> RetryPolicy {
        RetryPolicy::pending()
            .with_base(Duration::from_millis(self.pending_base_ms))
            .with_max_delay(self.pending_max_delay_secs.map(Duration::from_secs))
    }

    pub fn storage(&self) -> RetryPolicy {
        RetryPolicy::storage()
            .with_max_attempts(Some(self.storage_attempts))
            .with_max_delay(Some(Duration::from_secs(self.storage_max_delay_secs)))
    }

    pub fn poller(&self) -> InvocationPoller {
        InvocationPoller::new(self.pending())
            .with_deadline(self.poll_deadline_secs.map(Duration::from_secs))
            .with_max_cycles(self.poll_max_cycles)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database used by the sqlite persistence plugin.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hostdiff.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
