//! # Telemetry Ingest Server
//!
//! Keeps one telemetry session running for every member of the configured
//! provider. Members are read from the membership table at startup and the
//! table's change feed is followed afterwards. Sessions run in this process,
//! or each in its own `session_worker` process when isolation is enabled.
//!
//! `GET /health` reports `{"status":"ok","activeSessions":..,"bufferedRecords":..}`.
//! On Ctrl-C or SIGTERM all sessions are stopped and the write buffer is
//! flushed before exiting.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use lib_common::configs::EngineSettings;
use lib_common::connections::PgStore;
use lib_common::core::{
    Coalescer, CoalescerSettings, IsolationSettings, LifecycleManager, LifecycleSettings, MembershipWatcher,
};
use lib_common::ingestors::StreamApiProvider;
use lib_common::loggers::{parse_level, setup_logging};
use tokio_util::sync::CancellationToken;

mod ingest_logic;
use ingest_logic::backend::{self, Backend};
use ingest_logic::config::{self, Config};
use ingest_logic::{health, shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config()?;
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let log_file = setup_logging(
        "server_ingest",
        &log_dir,
        parse_level(config.log_level.as_deref().unwrap_or("info")),
    )?;
    log::info!("Logging to {}", log_file.display());

    let settings = config.engine_settings();
    settings.validate()?;

    let store = Arc::new(
        PgStore::new(
            config.database_url()?,
            config.db_max_connections.unwrap_or(5),
            &settings.membership_table,
        )
        .await?
        .with_conflict_keys(settings.conflict_keys.clone()),
    );
    let backend = build_backend(&config, &settings, store.clone())?;
    let watcher = MembershipWatcher::new(
        store.clone(),
        backend.control(),
        settings.provider,
        &settings.membership_table,
    );

    // Listen before loading, so no change slips between the two.
    let changes = watcher.watch_changes().await?;
    match watcher.start_initial().await {
        Ok(count) => log::info!("Started sessions for {} members", count),
        Err(e) if config.exit_on_load_failure.unwrap_or(true) => {
            log::error!("{}", e);
            backend.shutdown().await;
            store.close().await;
            return Err(e.into());
        }
        Err(e) => log::error!("{}. Continuing with membership changes only.", e),
    }

    let token = CancellationToken::new();
    let mut watcher_task = tokio::spawn({
        let token = token.clone();
        async move { watcher.follow(changes, token).await }
    });
    let server_task = tokio::spawn(health::run(
        config.port.unwrap_or(8080),
        backend.clone(),
        token.clone(),
    ));

    let ended = tokio::select! {
        _ = shutdown::shutdown_signal() => None,
        joined = &mut watcher_task => Some(joined),
    };
    token.cancel();
    let joined = match ended {
        Some(joined) => joined,
        None => watcher_task.await,
    };
    let outcome = match joined {
        Ok(result) => result.map_err(anyhow::Error::from),
        Err(e) => Err(anyhow!("membership watcher task failed: {}", e)),
    };

    backend.shutdown().await;
    store.close().await;
    match server_task.await {
        Ok(Err(e)) => log::error!("Health endpoint failed: {}", e),
        Err(e) => log::error!("Health endpoint task failed: {}", e),
        Ok(Ok(())) => {}
    }

    match &outcome {
        Ok(()) => log::info!("Shutdown complete."),
        Err(e) => log::error!("Exiting: {}", e),
    }
    outcome
}

fn build_backend(config: &Config, settings: &EngineSettings, store: Arc<PgStore>) -> Result<Backend> {
    if config.isolation.unwrap_or(false) {
        let program = match &config.worker_path {
            Some(path) => path.clone(),
            None => std::env::current_exe()?.with_file_name("session_worker"),
        };
        log::info!("Running sessions in worker processes ({})", program.display());
        return Ok(Backend::isolated(IsolationSettings {
            program,
            args: Vec::new(),
            envs: backend::worker_env(config),
        }));
    }

    let provider = Arc::new(StreamApiProvider::new(config.stream_api()?)?);
    let coalescer = Coalescer::new(store.clone(), CoalescerSettings::from(settings));
    let manager = LifecycleManager::new(provider, store, coalescer, LifecycleSettings::from(settings));
    log::info!("Running sessions in process");
    Ok(Backend::InProcess(manager))
}
