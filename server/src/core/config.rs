use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::utils::file::expand_path;

pub use crate::domain::budget::{BudgetAction, BudgetConfig, BudgetPeriod};

use super::cli::CliConfig;
use super::constants::{
    APP_DOT_FOLDER, CONFIG_FILE_NAME, DEFAULT_FLUSH_INTERVAL_SECS, DEFAULT_HOST, DEFAULT_PORT,
    DEFAULT_RETENTION_DAYS, DEFAULT_SERIES_CAPACITY, DEFAULT_STREAM_MAX_SECS,
    DEFAULT_WARN_THRESHOLD,
};

// =============================================================================
// File Config Structs (JSON deserialization)
// =============================================================================

/// Server configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Authentication configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AuthFileConfig {
    pub enabled: Option<bool>,
    pub token: Option<String>,
}

/// Store configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StoreFileConfig {
    pub capacity: Option<usize>,
    pub retention_days: Option<i64>,
}

/// Persistence configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PersistFileConfig {
    pub flush_secs: Option<u64>,
    /// Snapshot file path, relative paths resolve against the data dir
    pub file: Option<PathBuf>,
}

/// Budget configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct BudgetFileConfig {
    pub limit_usd: Option<f64>,
    pub period: Option<BudgetPeriod>,
    pub warn_threshold: Option<f64>,
    pub action: Option<BudgetAction>,
}

/// Live stream configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StreamFileConfig {
    pub max_secs: Option<u64>,
}

/// Fleet configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FleetFileConfig {
    pub key: Option<String>,
    pub allowlist: Option<Vec<String>>,
}

/// File-based configuration (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub server: Option<ServerFileConfig>,
    pub auth: Option<AuthFileConfig>,
    pub store: Option<StoreFileConfig>,
    pub persist: Option<PersistFileConfig>,
    pub budget: Option<BudgetFileConfig>,
    pub stream: Option<StreamFileConfig>,
    pub fleet: Option<FleetFileConfig>,
    pub log_file: Option<PathBuf>,
    pub debug: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl FileConfig {
    /// Load configuration from a JSON file
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::trace!(config = ?config, "Parsed config file");
        Ok(config)
    }

    /// Warn about unknown fields in the config
    fn warn_unknown_fields(&self) {
        if let serde_json::Value::Object(map) = &self.extra
            && !map.is_empty()
        {
            let keys_str: String = map
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                fields = %keys_str,
                "Unknown fields in config file (possible typos)"
            );
        }
    }

    /// Merge another FileConfig into this one (other takes precedence)
    fn merge(&mut self, other: FileConfig) {
        // Server
        if let Some(server) = other.server {
            let current = self.server.get_or_insert_with(ServerFileConfig::default);
            if server.host.is_some() {
                tracing::trace!(host = ?server.host, "Merging server.host");
                current.host = server.host;
            }
            if server.port.is_some() {
                tracing::trace!(port = ?server.port, "Merging server.port");
                current.port = server.port;
            }
        }

        // Auth
        if let Some(auth) = other.auth {
            let current = self.auth.get_or_insert_with(AuthFileConfig::default);
            if auth.enabled.is_some() {
                tracing::trace!(enabled = ?auth.enabled, "Merging auth.enabled");
                current.enabled = auth.enabled;
            }
            if auth.token.is_some() {
                tracing::trace!(token = "***", "Merging auth.token");
                current.token = auth.token;
            }
        }

        // Store
        if let Some(store) = other.store {
            let current = self.store.get_or_insert_with(StoreFileConfig::default);
            if store.capacity.is_some() {
                tracing::trace!(capacity = ?store.capacity, "Merging store.capacity");
                current.capacity = store.capacity;
            }
            if store.retention_days.is_some() {
                tracing::trace!(retention_days = ?store.retention_days, "Merging store.retention_days");
                current.retention_days = store.retention_days;
            }
        }

        // Persist
        if let Some(persist) = other.persist {
            let current = self.persist.get_or_insert_with(PersistFileConfig::default);
            if persist.flush_secs.is_some() {
                tracing::trace!(flush_secs = ?persist.flush_secs, "Merging persist.flush_secs");
                current.flush_secs = persist.flush_secs;
            }
            if persist.file.is_some() {
                tracing::trace!(file = ?persist.file, "Merging persist.file");
                current.file = persist.file;
            }
        }

        // Budget
        if let Some(budget) = other.budget {
            let current = self.budget.get_or_insert_with(BudgetFileConfig::default);
            if budget.limit_usd.is_some() {
                tracing::trace!(limit_usd = ?budget.limit_usd, "Merging budget.limit_usd");
                current.limit_usd = budget.limit_usd;
            }
            if budget.period.is_some() {
                tracing::trace!(period = ?budget.period, "Merging budget.period");
                current.period = budget.period;
            }
            if budget.warn_threshold.is_some() {
                tracing::trace!(warn_threshold = ?budget.warn_threshold, "Merging budget.warn_threshold");
                current.warn_threshold = budget.warn_threshold;
            }
            if budget.action.is_some() {
                tracing::trace!(action = ?budget.action, "Merging budget.action");
                current.action = budget.action;
            }
        }

        // Stream
        if let Some(stream) = other.stream {
            let current = self.stream.get_or_insert_with(StreamFileConfig::default);
            if stream.max_secs.is_some() {
                tracing::trace!(max_secs = ?stream.max_secs, "Merging stream.max_secs");
                current.max_secs = stream.max_secs;
            }
        }

        // Fleet
        if let Some(fleet) = other.fleet {
            let current = self.fleet.get_or_insert_with(FleetFileConfig::default);
            if fleet.key.is_some() {
                tracing::trace!(key = "***", "Merging fleet.key");
                current.key = fleet.key;
            }
            if fleet.allowlist.is_some() {
                tracing::trace!(allowlist = ?fleet.allowlist, "Merging fleet.allowlist");
                current.allowlist = fleet.allowlist;
            }
        }

        // Log file
        if other.log_file.is_some() {
            tracing::trace!(log_file = ?other.log_file, "Merging log_file");
            self.log_file = other.log_file;
        }

        // Debug
        if other.debug.is_some() {
            tracing::trace!(debug = ?other.debug, "Merging debug");
            self.debug = other.debug;
        }
    }
}

// =============================================================================
// Runtime Config Structs (final merged configuration)
// =============================================================================

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    /// Explicitly-set token. Generated at startup when None and auth is on.
    pub token: Option<String>,
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub capacity: usize,
    pub retention_days: i64,
}

/// Persistence configuration
#[derive(Debug, Clone)]
pub struct PersistConfig {
    pub flush_secs: u64,
    /// Snapshot file override, defaults to the data dir snapshot
    pub file: Option<PathBuf>,
}

/// Live stream configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub max_secs: u64,
}

/// Fleet configuration
#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    pub key: Option<String>,
    pub allowlist: Option<Vec<String>>,
}

/// Final merged application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub store: StoreConfig,
    pub persist: PersistConfig,
    /// None disables budget monitoring until set through the admin API
    pub budget: Option<BudgetConfig>,
    pub stream: StreamConfig,
    pub fleet: FleetConfig,
    pub log_file: Option<PathBuf>,
    pub debug: bool,
}

impl AppConfig {
    /// Load configuration from all sources
    ///
    /// Priority (lowest to highest):
    /// 1. Defaults
    /// 2. Profile directory config (~/.agentscope/agentscope.json)
    /// 3. Local directory config OR CLI-specified config path
    /// 4. CLI arguments (which include env var fallbacks via clap)
    pub fn load(cli: &CliConfig) -> Result<Self> {
        tracing::debug!("Loading application configuration");
        tracing::trace!(cli = ?cli, "CLI config");

        let mut file_config = FileConfig::default();
        let mut found_configs: Vec<String> = Vec::new();

        // 1. Load from profile dir (~/.agentscope/agentscope.json) - skip if not exists
        if let Some(profile_path) = get_profile_config_path()
            && profile_path.exists()
        {
            let profile_config = FileConfig::load_from_file(&profile_path)?;
            profile_config.warn_unknown_fields();
            file_config.merge(profile_config);
            found_configs.push(profile_path.display().to_string());
        }

        // 2. Load from CLI-specified path OR local directory
        let overlay_path = if let Some(ref path) = cli.config {
            let expanded = expand_path(&path.to_string_lossy());
            if !expanded.exists() {
                anyhow::bail!("Config file not found: {}", expanded.display());
            }
            Some(expanded)
        } else {
            let local = PathBuf::from(CONFIG_FILE_NAME);
            if local.exists() { Some(local) } else { None }
        };

        if let Some(path) = overlay_path {
            let overlay_config = FileConfig::load_from_file(&path)?;
            overlay_config.warn_unknown_fields();
            file_config.merge(overlay_config);
            found_configs.push(path.display().to_string());
        }

        tracing::debug!(configs = ?found_configs, "Config files loaded");

        // 3. Extract file config values with defaults
        let file_server = file_config.server.unwrap_or_default();
        let file_auth = file_config.auth.unwrap_or_default();
        let file_store = file_config.store.unwrap_or_default();
        let file_persist = file_config.persist.unwrap_or_default();
        let file_budget = file_config.budget.unwrap_or_default();
        let file_stream = file_config.stream.unwrap_or_default();
        let file_fleet = file_config.fleet.unwrap_or_default();

        // 4. Layer configs: defaults -> file config -> CLI/env overrides
        let host = cli
            .host
            .clone()
            .or(file_server.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let port = cli.port.or(file_server.port).unwrap_or(DEFAULT_PORT);

        // auth.enabled: file config sets default, --no-auth CLI flag disables
        let auth_enabled = if cli.no_auth {
            false
        } else {
            file_auth.enabled.unwrap_or(true)
        };
        let auth_token = cli.token.clone().or(file_auth.token);

        let store = StoreConfig {
            capacity: cli
                .store_capacity
                .or(file_store.capacity)
                .unwrap_or(DEFAULT_SERIES_CAPACITY),
            retention_days: cli
                .retention_days
                .or(file_store.retention_days)
                .unwrap_or(DEFAULT_RETENTION_DAYS),
        };

        let persist = PersistConfig {
            flush_secs: cli
                .flush_secs
                .or(file_persist.flush_secs)
                .unwrap_or(DEFAULT_FLUSH_INTERVAL_SECS),
            file: cli.snapshot_file.clone().or(file_persist.file),
        };

        // Budget monitoring only runs when a limit is set somewhere
        let budget = cli
            .budget_limit
            .or(file_budget.limit_usd)
            .map(|limit_usd| BudgetConfig {
                limit_usd,
                period: cli.budget_period.or(file_budget.period).unwrap_or_default(),
                warn_threshold: cli
                    .budget_warn_threshold
                    .or(file_budget.warn_threshold)
                    .unwrap_or(DEFAULT_WARN_THRESHOLD),
                action: cli.budget_action.or(file_budget.action).unwrap_or_default(),
            });

        let stream = StreamConfig {
            max_secs: cli
                .stream_max_secs
                .or(file_stream.max_secs)
                .unwrap_or(DEFAULT_STREAM_MAX_SECS),
        };

        let fleet = FleetConfig {
            key: cli.fleet_key.clone().or(file_fleet.key),
            allowlist: cli.fleet_allowlist.clone().or(file_fleet.allowlist),
        };

        let log_file = cli.log_file.clone().or(file_config.log_file);

        // debug: CLI/env flag takes precedence, then file config, default false
        let debug = cli.debug || file_config.debug.unwrap_or(false);

        let config = Self {
            server: ServerConfig { host, port },
            auth: AuthConfig {
                enabled: auth_enabled,
                token: auth_token,
            },
            store,
            persist,
            budget,
            stream,
            fleet,
            log_file,
            debug,
        };

        config.validate()?;

        tracing::debug!(
            host = %config.server.host,
            port = config.server.port,
            auth_enabled = config.auth.enabled,
            store_capacity = config.store.capacity,
            retention_days = config.store.retention_days,
            flush_secs = config.persist.flush_secs,
            budget_enabled = config.budget.is_some(),
            stream_max_secs = config.stream.max_secs,
            fleet_enabled = config.fleet.key.is_some(),
            log_file = ?config.log_file,
            debug = config.debug,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration for consistency and correctness
    fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("Configuration error: server.host must not be empty");
        }

        // Port 0 would cause bind failure
        if self.server.port == 0 {
            anyhow::bail!("Configuration error: server.port must be greater than 0");
        }

        if self.store.capacity == 0 {
            anyhow::bail!("Configuration error: store.capacity must be greater than 0");
        }
        if self.store.retention_days <= 0 {
            anyhow::bail!("Configuration error: store.retention_days must be greater than 0");
        }

        if self.persist.flush_secs == 0 {
            anyhow::bail!("Configuration error: persist.flush_secs must be greater than 0");
        }

        if self.stream.max_secs == 0 {
            anyhow::bail!("Configuration error: stream.max_secs must be greater than 0");
        }

        if let Some(budget) = &self.budget {
            budget
                .validate()
                .map_err(|e| anyhow::anyhow!("Configuration error: {e}"))?;
        }

        if let Some(allow) = &self.fleet.allowlist
            && self.fleet.key.is_none()
            && !allow.is_empty()
        {
            anyhow::bail!("Configuration error: fleet.allowlist requires fleet.key to be set");
        }

        Ok(())
    }

}

/// Whether a bind host means all interfaces rather than loopback
pub fn is_all_interfaces(host: &str) -> bool {
    matches!(host, "0.0.0.0" | "::" | "[::]")
}

/// Path to the profile-level config file (~/.agentscope/agentscope.json)
fn get_profile_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(APP_DOT_FOLDER).join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = AppConfig::load(&CliConfig::default()).unwrap();
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert!(config.auth.enabled);
        assert_eq!(config.store.capacity, DEFAULT_SERIES_CAPACITY);
        assert_eq!(config.store.retention_days, DEFAULT_RETENTION_DAYS);
        assert_eq!(config.persist.flush_secs, DEFAULT_FLUSH_INTERVAL_SECS);
        assert!(config.budget.is_none());
        assert!(config.fleet.key.is_none());
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = CliConfig {
            host: Some("0.0.0.0".to_string()),
            port: Some(9100),
            no_auth: true,
            budget_limit: Some(25.0),
            ..Default::default()
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9100);
        assert!(!config.auth.enabled);
        assert!(is_all_interfaces(&config.server.host));

        let budget = config.budget.unwrap();
        assert_eq!(budget.limit_usd, 25.0);
        assert_eq!(budget.period, BudgetPeriod::default());
        assert_eq!(budget.warn_threshold, DEFAULT_WARN_THRESHOLD);
    }

    #[test]
    fn test_config_file_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentscope.json");
        std::fs::write(
            &path,
            r#"{
                "server": {"port": 9200},
                "store": {"capacity": 500},
                "budget": {"limit_usd": 10.0, "period": "weekly"}
            }"#,
        )
        .unwrap();

        let cli = CliConfig {
            config: Some(path),
            ..Default::default()
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.store.capacity, 500);
        let budget = config.budget.unwrap();
        assert_eq!(budget.period, BudgetPeriod::Weekly);
    }

    #[test]
    fn test_cli_beats_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentscope.json");
        std::fs::write(&path, r#"{"server": {"port": 9200}}"#).unwrap();

        let cli = CliConfig {
            config: Some(path),
            port: Some(9300),
            ..Default::default()
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.port, 9300);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cli = CliConfig {
            store_capacity: Some(0),
            ..Default::default()
        };
        assert!(AppConfig::load(&cli).is_err());

        let cli = CliConfig {
            budget_limit: Some(-5.0),
            ..Default::default()
        };
        assert!(AppConfig::load(&cli).is_err());

        let cli = CliConfig {
            fleet_allowlist: Some(vec!["node-a".to_string()]),
            ..Default::default()
        };
        assert!(AppConfig::load(&cli).is_err());
    }

    #[test]
    fn test_missing_cli_config_file_errors() {
        let cli = CliConfig {
            config: Some(PathBuf::from("/nonexistent/agentscope.json")),
            ..Default::default()
        };
        assert!(AppConfig::load(&cli).is_err());
    }
}
