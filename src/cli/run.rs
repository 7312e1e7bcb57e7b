use crate::config::parse::load_config;
use crate::config::types::Config;
use crate::dispatch::HttpProvider;
use crate::lifecycle::{CycleOutcome, Dispatcher};
use crate::schedule::CronTrigger;
use crate::storage::{DuckDbStore, FsArtifactStore, StorageError, TemplateStore};
use crate::web::{run_server, ServiceClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("provider error: {0}")]
    Provider(#[from] crate::dispatch::DispatchError),

    #[error("trigger error: {0}")]
    Trigger(#[from] crate::schedule::TriggerError),

    #[error("dispatch cycle error: {0}")]
    Cycle(#[from] crate::lifecycle::CycleError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("failed to encode report: {0}")]
    Report(#[from] serde_json::Error),

    #[error("web server error: {0}")]
    WebServer(String),

    #[error("running service unreachable: {0}")]
    Client(#[from] crate::web::ClientError),
}

/// Exit with a hint when no config file could be found
pub(crate) fn require_config_path(config_path: Option<PathBuf>) -> PathBuf {
    match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/smsbatch/config.yml");
            eprintln!("  /etc/smsbatch/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'smsbatch config init' to generate one.");
            std::process::exit(1);
        }
    }
}

/// Open the state database and make sure its tables exist
pub async fn open_state(config: &Config) -> Result<Arc<DuckDbStore>, RunError> {
    info!(path = %config.storage.state.display(), "Opening state database");
    let state = Arc::new(DuckDbStore::new(&config.storage.state)?);
    state.init_schema().await?;
    Ok(state)
}

/// The template store, or the running service's template API while that
/// service holds the state database
pub async fn open_templates(config: &Config) -> Result<Arc<dyn TemplateStore>, RunError> {
    match open_state(config).await {
        Ok(state) => Ok(state as Arc<dyn TemplateStore>),
        Err(RunError::Storage(StorageError::Locked { pid })) => {
            let client = ServiceClient::for_listen(&config.web.listen)?;
            info!(pid, url = %client.base_url(), "State database in use, forwarding to the running service");
            Ok(Arc::new(client) as Arc<dyn TemplateStore>)
        }
        Err(e) => Err(e),
    }
}

/// Wire the configured stores and provider into a dispatcher
pub async fn build_dispatcher(config: &Config) -> Result<Arc<Dispatcher>, RunError> {
    let state = open_state(config).await?;

    info!(root = %config.storage.artifacts.display(), "Using artifact directory");
    let artifacts = Arc::new(FsArtifactStore::new(&config.storage.artifacts));
    let provider = Arc::new(HttpProvider::new(&config.provider)?);

    Ok(Arc::new(Dispatcher::new(
        config,
        artifacts,
        state.clone(),
        state,
        provider,
    )))
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = require_config_path(config_path);
    run_service(&config_path).await.map_err(|e| e.into())
}

/// Run exactly one dispatch cycle and print its report as JSON
pub async fn cycle(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = require_config_path(config_path);
    run_single_cycle(&config_path).await.map_err(|e| e.into())
}

async fn run_single_cycle(config_path: &Path) -> Result<(), RunError> {
    let config = load_config(config_path)?;
    let dispatcher = match build_dispatcher(&config).await {
        Ok(dispatcher) => dispatcher,
        Err(RunError::Storage(StorageError::Locked { pid })) => {
            let client = ServiceClient::for_listen(&config.web.listen)?;
            info!(pid, url = %client.base_url(), "State database in use, asking the running service for a cycle");
            let report = client.check_and_send().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let outcome = dispatcher.run_cycle().await?;
    if let CycleOutcome::Busy = outcome {
        info!("Another dispatch cycle holds the processing lock");
    }
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn run_service(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    let dispatcher = build_dispatcher(&config).await?;
    let trigger = CronTrigger::new(&config.trigger.schedule)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!(schedule = %config.trigger.schedule, "Starting dispatch trigger");
    let trigger_handle = tokio::spawn(trigger.run(dispatcher.clone(), shutdown_rx.clone()));

    info!("Starting web server on {}", config.web.listen);
    let web_config = config.web.clone();
    let web_dispatcher = dispatcher.clone();
    let web_shutdown = shutdown_rx.clone();
    let mut web_handle = tokio::spawn(async move {
        run_server(web_dispatcher, web_config, web_shutdown)
            .await
            .map_err(|e| RunError::WebServer(e.to_string()))
    });

    info!("Dispatcher started, press Ctrl+C to shutdown");

    let web_result = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            None
        }
        result = &mut web_handle => Some(result),
    };
    let _ = shutdown_tx.send(true);

    // A cycle in flight finishes before the trigger loop observes shutdown
    if let Err(e) = trigger_handle.await {
        error!(error = %e, "Trigger task join error");
    }

    let web_result = match web_result {
        Some(result) => result,
        None => web_handle.await,
    };
    match web_result {
        Ok(Ok(())) => info!("Web server stopped"),
        Ok(Err(e)) => {
            error!(error = %e, "Web server error");
            return Err(e);
        }
        Err(e) => return Err(e.into()),
    }

    info!("Dispatcher shutdown complete");
    Ok(())
}
