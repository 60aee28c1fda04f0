//! # Session Worker
//!
//! Runs the telemetry session of a single entity. Launched by
//! `server_ingest` when isolation is enabled: the first line on stdin is the
//! JSON spawn message naming the entity. Settings come from the same
//! environment and config file as the supervisor.
//!
//! Exits 0 when the session ends (idle, feeds closed, or a signal) and
//! non-zero when it could not start.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use lib_common::connections::PgStore;
use lib_common::core::{Coalescer, CoalescerSettings, LifecycleManager, LifecycleSettings, SpawnMessage};
use lib_common::ingestors::StreamApiProvider;
use lib_common::loggers::{parse_level, setup_logging};
use lib_common::telemetry::Entity;
use tokio::io::{AsyncBufReadExt, BufReader};

// Config and signal handling are shared with the server.
mod ingest_logic {
    pub mod config;
    pub mod shutdown;
}
use ingest_logic::{config, shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config()?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read spawn message")?;
    let message = SpawnMessage::from_line(&line)?;

    // One log file set per entity, so workers do not rotate each other's logs.
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    setup_logging(
        &format!("session_worker_{}", message.internal_id),
        &log_dir,
        parse_level(config.log_level.as_deref().unwrap_or("info")),
    )?;

    let settings = config.engine_settings();
    settings.validate()?;
    let entity = Entity::new(&message.external_id, &message.internal_id, settings.provider);

    let store = Arc::new(
        PgStore::new(
            config.database_url()?,
            config.db_max_connections.unwrap_or(2),
            &settings.membership_table,
        )
        .await?
        .with_conflict_keys(settings.conflict_keys.clone()),
    );
    let provider = Arc::new(StreamApiProvider::new(config.stream_api()?)?);
    let coalescer = Coalescer::new(store.clone(), CoalescerSettings::from(&settings));
    let manager = LifecycleManager::new(provider, store.clone(), coalescer.clone(), LifecycleSettings::from(&settings));

    let outcome = match manager.start(&entity).await {
        Ok(info) => {
            log::info!("Worker session {} for {} active", info.session_id, entity.internal_id);
            if let Some(mut state) = manager.subscribe_state(&entity.internal_id) {
                tokio::select! {
                    _ = state.wait_for(|s| s.is_finished()) => {
                        log::info!("Session for {} ended", entity.internal_id);
                    }
                    _ = shutdown::shutdown_signal() => {
                        manager.stop(&entity.internal_id);
                    }
                }
            }
            Ok(())
        }
        Err(e) => Err(anyhow::Error::from(e)),
    };

    manager.shutdown_all().await;
    let report = coalescer.shutdown().await;
    for (category, count, error) in &report.failed {
        log::error!("Final flush lost {} records for {}: {}", count, category, error);
    }
    store.close().await;

    if let Err(e) = &outcome {
        log::error!("Worker for {} failed: {}", entity.internal_id, e);
    }
    outcome
}
