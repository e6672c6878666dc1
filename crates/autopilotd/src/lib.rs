//! autopilotd - autonomous task control plane daemon.
//!
//! Library components for the daemon process: the task store, lease-based
//! priority dispatch, the quality gate and the critic performance monitor.

pub mod clock;
pub mod critic_monitor;
pub mod dispatcher;
pub mod executor;
pub mod lease;
pub mod metrics;
pub mod notify;
pub mod quality_gate;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

use autopilot_core::config::ConfigError;
use autopilot_core::Config;
use clock::{Clock, SystemClock};
use critic_monitor::{CriticMonitor, MonitorSettings};
use dispatcher::Dispatcher;
use executor::CommandExecutor;
use lease::LeaseManager;
use metrics::AuditMetrics;
use notify::EventBus;
use quality_gate::{GateSettings, QualityGate};
use scheduler::{Scheduler, SchedulerSettings};
use server::AppState;
use storage::{Storage, StorageError};
use store::TaskStore;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const DEFAULT_PORT: u16 = 7800;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Daemon configuration assembled by the binary.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP server port.
    pub port: u16,
    /// Bearer token for the HTTP API (optional).
    pub auth_token: Option<String>,
    /// Explicit tuning file; otherwise `.autopilot/config` under `workspace_root`.
    pub config_path: Option<PathBuf>,
    pub workspace_root: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: DEFAULT_PORT,
            auth_token: std::env::var("AUTOPILOT_AUTH_TOKEN").ok(),
            config_path: None,
            workspace_root: PathBuf::from("."),
        }
    }
}

/// Get the default database path (~/.local/share/autopilot/autopilot.db).
pub fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("autopilot").join("autopilot.db")
}

/// Daemon state.
pub struct Daemon {
    config: DaemonConfig,
    settings: Config,
    store: Arc<TaskStore>,
    scheduler: Arc<Scheduler>,
    leases: Arc<LeaseManager>,
    gate: Arc<QualityGate>,
    monitor: Arc<CriticMonitor>,
    dispatcher: Option<Arc<Dispatcher>>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Open storage and build every component from the loaded config.
    pub async fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let settings = Config::discover(config.config_path.as_deref(), &config.workspace_root)?;
        settings.validate()?;

        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;

        let store = Arc::new(TaskStore::new(
            Arc::new(storage),
            Arc::new(EventBus::new()),
            Arc::new(AuditMetrics::new()),
        ));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            SchedulerSettings::from_config(&settings),
        ));
        let leases = Arc::new(LeaseManager::new(Arc::clone(&clock), settings.lease_ttl()));
        let gate = Arc::new(QualityGate::new(
            Arc::clone(&store),
            GateSettings::from_config(&settings),
        ));
        let monitor = Arc::new(CriticMonitor::new(
            Arc::clone(&store),
            clock,
            MonitorSettings::from_config(&settings),
        ));

        let dispatcher = settings.agent_cmd.as_ref().map(|cmd| {
            let dispatcher = Dispatcher::new(
                Arc::clone(&store),
                Arc::clone(&scheduler),
                Arc::clone(&leases),
                Arc::clone(&gate),
                Arc::new(CommandExecutor::new(cmd.clone(), settings.lease_ttl())),
            )
            .with_reserved_roles([settings.director_role.clone()]);
            Arc::new(dispatcher)
        });

        Ok(Self {
            config,
            settings,
            store,
            scheduler,
            leases,
            gate,
            monitor,
            dispatcher,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Run the daemon until `shutdown` is called.
    pub async fn run(&self) -> Result<(), DaemonError> {
        info!("autopilotd starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        info!(
            global_cap = self.settings.global_cap,
            lease_ttl_sec = self.settings.lease_ttl_sec,
            "scheduler configured"
        );
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        let monitor_handle = tokio::spawn(Arc::clone(&self.monitor).run(
            self.store.bus().subscribe(),
            self.shutdown.child_token(),
        ));

        let dispatcher_handle = match &self.dispatcher {
            Some(dispatcher) => {
                info!("agent executor enabled");
                Some(tokio::spawn(Arc::clone(dispatcher).run(
                    self.store.bus().subscribe(),
                    self.settings.tick_interval(),
                    self.settings.reaper_interval(),
                    self.shutdown.child_token(),
                )))
            }
            None => {
                info!("no agent_cmd configured; waiting for external agents");
                None
            }
        };

        let state = Arc::new(AppState {
            store: Arc::clone(&self.store),
            scheduler: Arc::clone(&self.scheduler),
            leases: Arc::clone(&self.leases),
            gate: Arc::clone(&self.gate),
            monitor: Arc::clone(&self.monitor),
            dispatcher: self.dispatcher.clone(),
            auth_token: self.config.auth_token.clone(),
        });
        let server_cancel = self.shutdown.child_token();
        if let Err(e) = server::start_server(state, self.config.port, server_cancel).await {
            error!("HTTP server error: {}", e);
        }

        self.shutdown.cancel();
        if let Err(e) = monitor_handle.await {
            error!("critic monitor task failed: {}", e);
        }
        if let Some(handle) = dispatcher_handle {
            if let Err(e) = handle.await {
                error!("dispatcher task failed: {}", e);
            }
        }
        info!("autopilotd stopped");
        Ok(())
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}
