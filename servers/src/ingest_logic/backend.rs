//! Where sessions run: inside this process, or one worker process per entity.

use std::sync::Arc;

use lib_common::core::{IsolationSettings, IsolationSupervisor, LifecycleManager, SessionControl, UnitExit};
use tokio::sync::mpsc;

use super::config::Config;

#[derive(Clone)]
pub enum Backend {
    InProcess(LifecycleManager),
    Isolated(IsolationSupervisor),
}

impl Backend {
    /// Isolated backend; exit reports are logged as they arrive.
    pub fn isolated(settings: IsolationSettings) -> Self {
        let (supervisor, exits) = IsolationSupervisor::new(settings);
        tokio::spawn(log_exits(exits));
        Backend::Isolated(supervisor)
    }

    /// The session control the membership watcher drives.
    pub fn control(&self) -> Arc<dyn SessionControl> {
        match self {
            Backend::InProcess(manager) => Arc::new(manager.clone()),
            Backend::Isolated(supervisor) => Arc::new(supervisor.clone()),
        }
    }

    /// Active sessions, or running workers when isolated.
    pub fn active_sessions(&self) -> usize {
        match self {
            Backend::InProcess(manager) => manager.active_count(),
            Backend::Isolated(supervisor) => supervisor.unit_count(),
        }
    }

    /// Records waiting in this process's coalescer. Workers buffer their own.
    pub fn buffered_records(&self) -> usize {
        match self {
            Backend::InProcess(manager) => manager.coalescer().buffered_len(),
            Backend::Isolated(_) => 0,
        }
    }

    /// Stops every session, then writes out whatever is still buffered.
    pub async fn shutdown(&self) {
        match self {
            Backend::InProcess(manager) => {
                manager.shutdown_all().await;
                let report = manager.coalescer().shutdown().await;
                let written: usize = report.written.iter().map(|(_, n)| n).sum();
                log::info!("Final flush wrote {} records", written);
                for (category, count, error) in &report.failed {
                    log::error!("Final flush lost {} records for {}: {}", count, category, error);
                }
            }
            Backend::Isolated(supervisor) => supervisor.shutdown().await,
        }
    }
}

/// Environment handed to worker processes so they resolve the same
/// settings as the supervisor, whatever source those came from.
pub fn worker_env(config: &Config) -> Vec<(String, String)> {
    let mut env = Vec::new();
    let mut put = |key: &str, value: Option<String>| {
        if let Some(value) = value {
            env.push((key.to_string(), value));
        }
    };
    put("INGEST_CONFIG_PATH", config.config_path.as_ref().map(|p| p.display().to_string()));
    put("INGEST_LOG_DIR", config.log_dir.as_ref().map(|p| p.display().to_string()));
    put("INGEST_LOG_LEVEL", config.log_level.clone());
    put("DATABASE_URL", config.database_url.clone());
    put("NEUROSITY_OAUTH_URL", config.oauth_url.clone());
    put("NEUROSITY_OAUTH_CLIENT_ID", config.client_id.clone());
    put("NEUROSITY_OAUTH_CLIENT_SECRET", config.client_secret.clone());
    put("NEUROSITY_STREAM_URL", config.stream_url.clone());
    put("INGEST_BUFFER_SIZE", config.buffer_size.map(|v| v.to_string()));
    put("INGEST_FLUSH_INTERVAL_MS", config.flush_interval_ms.map(|v| v.to_string()));
    put("INGEST_IDLE_CHECK_INTERVAL_MS", config.idle_check_interval_ms.map(|v| v.to_string()));
    put("INGEST_INVALIDATE_ON_FAILURE", config.invalidate_on_failure.map(|v| v.to_string()));
    put("INGEST_MEMBERSHIP_TABLE", config.membership_table.clone());
    // A worker needs few connections of its own.
    put("INGEST_DB_MAX_CONNECTIONS", Some("2".to_string()));
    env
}

async fn log_exits(mut exits: mpsc::UnboundedReceiver<UnitExit>) {
    while let Some(exit) = exits.recv().await {
        if exit.success || exit.killed {
            log::info!("Worker {} for {} exited", exit.unit_id, exit.internal_id);
        } else {
            log::warn!(
                "Worker {} for {} exited abnormally (code {:?})",
                exit.unit_id,
                exit.internal_id,
                exit.code
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_env_carries_secrets_and_engine_overrides() {
        let config = Config {
            client_secret: Some("s3cret".into()),
            buffer_size: Some(7),
            ..Default::default()
        };
        let env = worker_env(&config);
        assert!(env.contains(&("NEUROSITY_OAUTH_CLIENT_SECRET".to_string(), "s3cret".to_string())));
        assert!(env.contains(&("INGEST_BUFFER_SIZE".to_string(), "7".to_string())));
        assert!(env.contains(&("INGEST_DB_MAX_CONNECTIONS".to_string(), "2".to_string())));
        assert!(!env.iter().any(|(k, _)| k == "DATABASE_URL"));
    }
}
