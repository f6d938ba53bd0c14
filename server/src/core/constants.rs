// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display and platform directories)
pub const APP_NAME: &str = "AgentScope";

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "agentscope";

/// Unix-style dotfile folder name
pub const APP_DOT_FOLDER: &str = ".agentscope";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "agentscope.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "AGENTSCOPE_CONFIG";

// =============================================================================
// Environment Variables - Server
// =============================================================================

/// Environment variable for server host
pub const ENV_HOST: &str = "AGENTSCOPE_HOST";

/// Environment variable for server port
pub const ENV_PORT: &str = "AGENTSCOPE_PORT";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "AGENTSCOPE_LOG";

/// Environment variable for the API shared secret
pub const ENV_TOKEN: &str = "AGENTSCOPE_TOKEN";

/// Environment variable for debug mode
pub const ENV_DEBUG: &str = "AGENTSCOPE_DEBUG";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port
pub const DEFAULT_PORT: u16 = 8900;

// =============================================================================
// Environment Variables - Storage & Persistence
// =============================================================================

/// Environment variable to override data directory
pub const ENV_DATA_DIR: &str = "AGENTSCOPE_DATA_DIR";

/// Environment variable to override the snapshot file path
pub const ENV_SNAPSHOT_FILE: &str = "AGENTSCOPE_SNAPSHOT_FILE";

/// Environment variable for the flush interval in seconds
pub const ENV_FLUSH_SECS: &str = "AGENTSCOPE_FLUSH_SECS";

/// Environment variable for per-series record capacity
pub const ENV_STORE_CAPACITY: &str = "AGENTSCOPE_STORE_CAPACITY";

/// Environment variable for record retention in days
pub const ENV_RETENTION_DAYS: &str = "AGENTSCOPE_RETENTION_DAYS";

// =============================================================================
// Environment Variables - Budget
// =============================================================================

pub const ENV_BUDGET_LIMIT: &str = "AGENTSCOPE_BUDGET_LIMIT";
pub const ENV_BUDGET_PERIOD: &str = "AGENTSCOPE_BUDGET_PERIOD";
pub const ENV_BUDGET_WARN_THRESHOLD: &str = "AGENTSCOPE_BUDGET_WARN_THRESHOLD";
pub const ENV_BUDGET_ACTION: &str = "AGENTSCOPE_BUDGET_ACTION";

// =============================================================================
// Environment Variables - Live Stream
// =============================================================================

/// Environment variable for maximum SSE stream duration in seconds
pub const ENV_STREAM_MAX_SECS: &str = "AGENTSCOPE_STREAM_MAX_SECS";

// =============================================================================
// Environment Variables - Fleet
// =============================================================================

/// Environment variable for the fleet shared key
pub const ENV_FLEET_KEY: &str = "AGENTSCOPE_FLEET_KEY";

/// Environment variable for the fleet node allow-list (comma separated)
pub const ENV_FLEET_ALLOWLIST: &str = "AGENTSCOPE_FLEET_ALLOWLIST";

// =============================================================================
// Environment Variables - Log Tailer
// =============================================================================

/// Environment variable for the agent log file to tail (fallback ingestion)
pub const ENV_LOG_FILE: &str = "AGENTSCOPE_LOG_FILE";

// =============================================================================
// Store Defaults
// =============================================================================

/// Maximum records retained per series
pub const DEFAULT_SERIES_CAPACITY: usize = 10_000;

/// Maximum record age in days
pub const DEFAULT_RETENTION_DAYS: i64 = 14;

// =============================================================================
// Persistence Defaults
// =============================================================================

/// Snapshot file name inside the data directory
pub const SNAPSHOT_FILE_NAME: &str = "metrics.json";

/// Snapshot file format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Interval between periodic snapshot flushes
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 60;

// =============================================================================
// Budget Defaults
// =============================================================================

/// Interval between budget evaluation cycles
pub const BUDGET_EVAL_INTERVAL_SECS: u64 = 60;

/// Default warn threshold as a fraction of the limit
pub const DEFAULT_WARN_THRESHOLD: f64 = 0.8;

// =============================================================================
// Live Stream Defaults
// =============================================================================

/// Maximum SSE stream duration before forced termination
pub const DEFAULT_STREAM_MAX_SECS: u64 = 300;

/// Broadcast channel capacity for the live hub
pub const STREAM_CHANNEL_CAPACITY: usize = 1_024;

/// Total records a subscriber may miss (lag) before forced disconnect
pub const STREAM_LAG_BUDGET: u64 = 4_096;

/// SSE keep-alive interval
pub const STREAM_KEEP_ALIVE_SECS: u64 = 30;

/// Maximum backfill records a subscriber may request on connect
pub const STREAM_MAX_BACKFILL: usize = 1_000;

// =============================================================================
// Fleet Defaults
// =============================================================================

/// Maximum tolerated clock skew for fleet reports (reports further in the
/// future than this are rejected)
pub const FLEET_MAX_CLOCK_SKEW_SECS: i64 = 300;

// =============================================================================
// Log Tailer Defaults
// =============================================================================

/// Poll interval for the log tailer fallback
pub const LOGTAIL_POLL_SECS: u64 = 2;

// =============================================================================
// HTTP Limits
// =============================================================================

/// Default request body limit (1 MB)
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// OTLP ingestion body limit (8 MB)
pub const OTLP_BODY_LIMIT: usize = 8 * 1024 * 1024;

/// Query result limit for series endpoints
pub const DEFAULT_SERIES_QUERY_LIMIT: usize = 1_000;

/// Retry-After hint sent when ingestion is paused
pub const INGEST_RETRY_AFTER_SECS: u64 = 60;

// =============================================================================
// Shutdown
// =============================================================================

/// Grace period for background tasks during shutdown
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Telemetry Names
// =============================================================================

/// Node id used for records produced by the local agent
pub const LOCAL_NODE_ID: &str = "local";

/// OTLP metric names recognized by the normalizer
pub mod metric_names {
    pub const TOKENS: &str = "agent.tokens";
    pub const CONTEXT_TOKENS: &str = "agent.context.tokens";
    pub const COST_USD: &str = "agent.cost.usd";
    pub const RUN_DURATION_MS: &str = "agent.run.duration_ms";
    pub const MESSAGE_PREFIX: &str = "agent.message.";
    pub const CRON_PREFIX: &str = "agent.cron.";
    pub const HEALTH_PREFIX: &str = "agent.health.";
}
