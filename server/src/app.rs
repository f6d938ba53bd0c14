//! Core application

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::api::{ApiServer, AuthService};
use crate::api::routes::ingest::IngestGate;
use crate::core::banner;
use crate::core::cli::{self, CliConfig, Commands, SystemCommands};
use crate::core::config::AppConfig;
use crate::core::constants::{
    APP_NAME_LOWER, ENV_LOG, SNAPSHOT_FILE_NAME, STREAM_CHANNEL_CAPACITY, STREAM_LAG_BUDGET,
};
use crate::core::shutdown::ShutdownService;
use crate::core::storage::AppStorage;
use crate::domain::budget::{BudgetMonitor, LogAlertSink};
use crate::domain::fleet::FleetAggregator;
use crate::domain::logtail::LogTailer;
use crate::live::LiveHub;
use crate::persist::PersistenceManager;
use crate::store::MetricStore;

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub storage: AppStorage,
    pub auth: Arc<AuthService>,
    pub store: Arc<MetricStore>,
    pub hub: Arc<LiveHub>,
    pub persistence: Arc<PersistenceManager>,
    pub budget: Arc<BudgetMonitor>,
    pub fleet: Arc<FleetAggregator>,
    pub gate: Arc<IngestGate>,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "Parsed command");

        match command {
            Some(Commands::System {
                command: system_cmd,
            }) => {
                return Self::handle_system_command(system_cmd);
            }
            Some(Commands::Start) | None => {}
        }

        let app = Self::init(&cli_config).await?;
        Self::start_server(app).await
    }

    async fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;
        let storage = AppStorage::init().await?;

        let hub = Arc::new(LiveHub::with_limits(
            STREAM_CHANNEL_CAPACITY,
            Duration::from_secs(config.stream.max_secs),
            STREAM_LAG_BUDGET,
        ));
        let store = Arc::new(MetricStore::new(
            config.store.capacity,
            config.store.retention_days,
            hub.clone(),
        ));

        let snapshot_path = Self::resolve_snapshot_path(&config, &storage);
        let persistence = Arc::new(PersistenceManager::new(
            snapshot_path,
            store.clone(),
            Duration::from_secs(config.persist.flush_secs),
        ));
        let restored = persistence
            .load()
            .with_context(|| format!("Failed to load snapshot: {}", persistence.path().display()))?;
        if restored > 0 {
            tracing::info!(records = restored, "Restored records from snapshot");
        }

        let gate = Arc::new(IngestGate::default());
        let budget = Arc::new(BudgetMonitor::new(
            store.clone(),
            config.budget.clone(),
            Arc::new(LogAlertSink),
            gate.clone(),
        ));
        let fleet = Arc::new(FleetAggregator::new(
            store.clone(),
            config.fleet.key.clone(),
            config.fleet.allowlist.clone(),
        ));
        let auth = Arc::new(AuthService::new(
            config.auth.enabled,
            config.auth.token.clone(),
        ));
        let shutdown = ShutdownService::new();

        Ok(Self {
            shutdown,
            config,
            storage,
            auth,
            store,
            hub,
            persistence,
            budget,
            fleet,
            gate,
        })
    }

    /// Relative snapshot overrides resolve against the data directory.
    fn resolve_snapshot_path(config: &AppConfig, storage: &AppStorage) -> PathBuf {
        match &config.persist.file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => storage.data_dir().join(path),
            None => storage.data_path(SNAPSHOT_FILE_NAME),
        }
    }

    fn handle_system_command(cmd: SystemCommands) -> Result<()> {
        match cmd {
            SystemCommands::Prune { yes } => Self::prune_data(yes),
        }
    }

    fn prune_data(skip_confirm: bool) -> Result<()> {
        let data_dir = AppStorage::resolve_data_dir();

        if !data_dir.exists() {
            println!(
                "Nothing to prune. Data directory does not exist: {}",
                data_dir.display()
            );
            return Ok(());
        }

        let data_dir = data_dir.canonicalize().unwrap_or(data_dir);

        println!("This will permanently delete the local data directory:");
        println!("  {}", data_dir.display());
        println!();
        println!(
            "Make sure the server is not running. \
             Deleting data while the server is running will cause data corruption."
        );

        if !skip_confirm {
            print!("\nContinue? [y/N] ");
            std::io::Write::flush(&mut std::io::stdout())?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            if !matches!(input.trim().to_lowercase().as_str(), "y" | "yes") {
                println!("Aborted.");
                return Ok(());
            }
        }

        std::fs::remove_dir_all(&data_dir)
            .with_context(|| format!("Failed to delete data directory: {}", data_dir.display()))?;
        println!("Pruned: {}", data_dir.display());
        Ok(())
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_server(app: Self) -> Result<()> {
        // Install signal handlers FIRST (before any blocking calls)
        app.shutdown.install_signal_handlers();

        app.start_background_tasks().await;

        banner::print_banner(
            &app.config.server.host,
            app.config.server.port,
            app.auth.enabled(),
            app.auth.token(),
            app.fleet.enabled(),
            &app.storage.data_dir().display().to_string(),
        );

        let server = ApiServer::new(app);
        let app = server.start().await?;
        app.shutdown.shutdown().await;

        Ok(())
    }

    pub async fn start_background_tasks(&self) {
        let flush = self.persistence.clone().flush_loop(self.shutdown.subscribe());
        self.shutdown.register(tokio::spawn(flush)).await;

        let budget = self.budget.clone().run(self.shutdown.subscribe());
        self.shutdown.register(tokio::spawn(budget)).await;

        if let Some(log_file) = &self.config.log_file {
            let tailer = LogTailer::new(log_file.clone(), self.store.clone());
            let task = tailer.run(self.shutdown.subscribe());
            self.shutdown.register(tokio::spawn(task)).await;
        }

        tracing::debug!("Background tasks started");
    }
}
