use std::net::SocketAddr;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::ingest_logic::backend::Backend;

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub active_sessions: usize,
    pub buffered_records: usize,
}

pub fn router(backend: Backend) -> Router {
    Router::new().route("/health", get(health_handler)).with_state(backend)
}

/// Serves `/health` until `shutdown` is cancelled.
pub async fn run(port: u16, backend: Backend, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Health endpoint listening on {}", addr);

    axum::serve(listener, router(backend))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("Health endpoint shutting down.");
        })
        .await?;
    Ok(())
}

async fn health_handler(State(backend): State<Backend>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        active_sessions: backend.active_sessions(),
        buffered_records: backend.buffered_records(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_common::core::{Coalescer, CoalescerSettings, LifecycleManager, LifecycleSettings};
    use lib_common::telemetry::{Category, Entity, ProviderKind, Record};
    use lib_common::testkit::{MemoryStore, ScriptedProvider};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_health_reports_sessions_and_buffer() {
        let store = Arc::new(MemoryStore::default());
        let provider = Arc::new(ScriptedProvider::default());
        let coalescer = Coalescer::new(store.clone(), CoalescerSettings::default());
        let manager = LifecycleManager::new(provider, store, coalescer.clone(), LifecycleSettings::default());
        let backend = Backend::InProcess(manager.clone());

        // 1. Idle engine
        let Json(report) = health_handler(State(backend.clone())).await;
        assert_eq!(
            report,
            HealthReport { status: "ok", active_sessions: 0, buffered_records: 0 }
        );

        // 2. One live session and one buffered record
        let entity = Entity::new("ext-E1", "E1", ProviderKind::Neurosity).with_credential("t1");
        manager.start(&entity).await.unwrap();
        coalescer
            .enqueue(Record::probability("E1", 0.4, "calm", "neurosity"), Category::states())
            .unwrap();

        let Json(report) = health_handler(State(backend.clone())).await;
        assert_eq!(report.active_sessions, 1);
        assert_eq!(report.buffered_records, 1);
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({ "status": "ok", "activeSessions": 1, "bufferedRecords": 1 })
        );

        // 3. Shutdown flushes the buffer
        backend.shutdown().await;
        let Json(report) = health_handler(State(backend)).await;
        assert_eq!(report.active_sessions, 0);
        assert_eq!(report.buffered_records, 0);
    }
}
