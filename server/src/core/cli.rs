use clap::{Parser, Subcommand};

use std::path::PathBuf;

use super::config::{BudgetAction, BudgetPeriod};
use super::constants::{
    ENV_BUDGET_ACTION, ENV_BUDGET_LIMIT, ENV_BUDGET_PERIOD, ENV_BUDGET_WARN_THRESHOLD, ENV_CONFIG,
    ENV_DEBUG, ENV_FLEET_ALLOWLIST, ENV_FLEET_KEY, ENV_FLUSH_SECS, ENV_HOST, ENV_LOG_FILE,
    ENV_PORT, ENV_RETENTION_DAYS, ENV_SNAPSHOT_FILE, ENV_STORE_CAPACITY, ENV_STREAM_MAX_SECS,
    ENV_TOKEN,
};

#[derive(Parser)]
#[command(name = "agentscope")]
#[command(version, about = "AI Agent Telemetry Collector", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server host address
    #[arg(long, short = 'H', global = true, env = ENV_HOST)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', global = true, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Disable authentication (for development)
    #[arg(long, global = true)]
    pub no_auth: bool,

    /// Query API bearer token (generated when not set)
    #[arg(long, global = true, env = ENV_TOKEN)]
    pub token: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true, env = ENV_DEBUG)]
    pub debug: bool,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Maximum records kept per metric category
    #[arg(long, global = true, env = ENV_STORE_CAPACITY)]
    pub store_capacity: Option<usize>,

    /// Retention window in days
    #[arg(long, global = true, env = ENV_RETENTION_DAYS)]
    pub retention_days: Option<i64>,

    /// Snapshot file path (relative paths resolve against the data dir)
    #[arg(long, global = true, env = ENV_SNAPSHOT_FILE)]
    pub snapshot_file: Option<PathBuf>,

    /// Snapshot flush interval in seconds
    #[arg(long, global = true, env = ENV_FLUSH_SECS)]
    pub flush_secs: Option<u64>,

    /// Budget spend limit in USD per period
    #[arg(long, global = true, env = ENV_BUDGET_LIMIT)]
    pub budget_limit: Option<f64>,

    /// Budget period (daily, weekly or monthly)
    #[arg(long, global = true, env = ENV_BUDGET_PERIOD, value_parser = parse_budget_period)]
    pub budget_period: Option<BudgetPeriod>,

    /// Fraction of the limit that triggers a warning (0 to 1)
    #[arg(long, global = true, env = ENV_BUDGET_WARN_THRESHOLD)]
    pub budget_warn_threshold: Option<f64>,

    /// What to do when the budget is exceeded (alert-only or pause-upstream)
    #[arg(long, global = true, env = ENV_BUDGET_ACTION, value_parser = parse_budget_action)]
    pub budget_action: Option<BudgetAction>,

    /// Maximum lifetime of one live stream connection in seconds
    #[arg(long, global = true, env = ENV_STREAM_MAX_SECS)]
    pub stream_max_secs: Option<u64>,

    /// Shared key for fleet report submissions (enables fleet mode)
    #[arg(long, global = true, env = ENV_FLEET_KEY)]
    pub fleet_key: Option<String>,

    /// Comma-separated node ids allowed to report without registering
    #[arg(long, global = true, env = ENV_FLEET_ALLOWLIST, value_delimiter = ',')]
    pub fleet_allowlist: Option<Vec<String>>,

    /// Agent JSONL log file to tail as an ingest source
    #[arg(long, global = true, env = ENV_LOG_FILE)]
    pub log_file: Option<PathBuf>,
}

/// Parse budget period from CLI/env string
fn parse_budget_period(s: &str) -> Result<BudgetPeriod, String> {
    match s.to_lowercase().as_str() {
        "daily" | "day" => Ok(BudgetPeriod::Daily),
        "weekly" | "week" => Ok(BudgetPeriod::Weekly),
        "monthly" | "month" => Ok(BudgetPeriod::Monthly),
        _ => Err(format!(
            "Invalid budget period '{}'. Valid options: daily, weekly, monthly",
            s
        )),
    }
}

/// Parse budget action from CLI/env string
fn parse_budget_action(s: &str) -> Result<BudgetAction, String> {
    match s.to_lowercase().as_str() {
        "alert-only" | "alert" => Ok(BudgetAction::AlertOnly),
        "pause-upstream" | "pause" => Ok(BudgetAction::PauseUpstream),
        _ => Err(format!(
            "Invalid budget action '{}'. Valid options: alert-only, pause-upstream",
            s
        )),
    }
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Start the collector (default command)
    Start,
    /// System maintenance commands
    System {
        #[command(subcommand)]
        command: SystemCommands,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum SystemCommands {
    /// Delete local data directory (snapshots, generated config). Requires confirmation.
    Prune {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub no_auth: bool,
    pub token: Option<String>,
    pub debug: bool,
    pub config: Option<PathBuf>,
    pub store_capacity: Option<usize>,
    pub retention_days: Option<i64>,
    pub snapshot_file: Option<PathBuf>,
    pub flush_secs: Option<u64>,
    pub budget_limit: Option<f64>,
    pub budget_period: Option<BudgetPeriod>,
    pub budget_warn_threshold: Option<f64>,
    pub budget_action: Option<BudgetAction>,
    pub stream_max_secs: Option<u64>,
    pub fleet_key: Option<String>,
    pub fleet_allowlist: Option<Vec<String>>,
    pub log_file: Option<PathBuf>,
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    let config = CliConfig {
        host: cli.host,
        port: cli.port,
        no_auth: cli.no_auth,
        token: cli.token,
        debug: cli.debug,
        config: cli.config,
        store_capacity: cli.store_capacity,
        retention_days: cli.retention_days,
        snapshot_file: cli.snapshot_file,
        flush_secs: cli.flush_secs,
        budget_limit: cli.budget_limit,
        budget_period: cli.budget_period,
        budget_warn_threshold: cli.budget_warn_threshold,
        budget_action: cli.budget_action,
        stream_max_secs: cli.stream_max_secs,
        fleet_key: cli.fleet_key,
        fleet_allowlist: cli.fleet_allowlist,
        log_file: cli.log_file,
    };
    (config, cli.command)
}
