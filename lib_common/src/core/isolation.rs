//! # Process Isolation Boundary
//!
//! Instead of running every session inside the supervisor, each entity can get
//! its own worker process. The supervisor launches the worker binary, writes
//! one JSON line `{"externalId": .., "internalId": ..}` to its stdin and closes
//! it. The worker runs its own lifecycle manager and coalescer against the
//! shared store, so a crash takes down one entity only.
//!
//! Exits are reported on a channel returned by `IsolationSupervisor::new`.
//! Abnormal exits are logged and the worker is not restarted; the next
//! membership change for the entity starts a fresh one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::core::SessionControl;
use crate::telemetry::Entity;

/// Errors raised by the supervisor.
#[derive(Debug, Error)]
pub enum IsolationError {
    /// The worker process could not be launched.
    #[error("Failed to spawn worker for {internal_id}: {source}")]
    Spawn {
        /// Entity concerned.
        internal_id: String,
        /// OS error.
        #[source]
        source: std::io::Error,
    },
    /// The supervisor no longer launches workers.
    #[error("Isolation supervisor is shut down")]
    ShutDown,
    /// The spawn message could not be read by the worker.
    #[error("Malformed spawn message: {0}")]
    Message(#[from] serde_json::Error),
}

/// The message a worker receives at launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnMessage {
    /// External id, used for credential exchange.
    pub external_id: String,
    /// Internal id, stamped on records.
    pub internal_id: String,
}

impl SpawnMessage {
    /// The message for `entity`.
    pub fn for_entity(entity: &Entity) -> Self {
        Self {
            external_id: entity.external_id.clone(),
            internal_id: entity.internal_id.clone(),
        }
    }

    /// Encodes the message as one newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String, IsolationError> {
        Ok(format!("{}\n", serde_json::to_string(self)?))
    }

    /// Decodes a line written by `to_line`.
    pub fn from_line(line: &str) -> Result<Self, IsolationError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// How workers are launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationSettings {
    /// Worker executable.
    pub program: PathBuf,
    /// Arguments passed to every worker.
    pub args: Vec<String>,
    /// Environment set on every worker, on top of the inherited one.
    pub envs: Vec<(String, String)>,
}

/// Termination report of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitExit {
    /// Entity the worker served.
    pub internal_id: String,
    /// Supervisor-assigned worker id.
    pub unit_id: u64,
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// True for exit code 0.
    pub success: bool,
    /// True when the supervisor killed the worker.
    pub killed: bool,
}

struct UnitSlot {
    unit_id: u64,
    kill: CancellationToken,
}

struct SupervisorInner {
    settings: IsolationSettings,
    units: Mutex<HashMap<String, UnitSlot>>,
    next_id: AtomicU64,
    exits: mpsc::UnboundedSender<UnitExit>,
    tasks: TaskTracker,
    shut_down: AtomicBool,
}

/// # Isolation Supervisor
///
/// At most one worker per internal id. Cheap to clone.
#[derive(Clone)]
pub struct IsolationSupervisor {
    inner: Arc<SupervisorInner>,
}

impl IsolationSupervisor {
    /// Creates the supervisor and the receiver of its exit reports.
    pub fn new(settings: IsolationSettings) -> (Self, mpsc::UnboundedReceiver<UnitExit>) {
        let (exits, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            inner: Arc::new(SupervisorInner {
                settings,
                units: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                exits,
                tasks: TaskTracker::new(),
                shut_down: AtomicBool::new(false),
            }),
        };
        (supervisor, rx)
    }

    /// Launches a worker for `entity`, killing the one it already had.
    pub fn spawn_isolated(&self, entity: &Entity) -> Result<u64, IsolationError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(IsolationError::ShutDown);
        }
        self.stop_unit(&entity.internal_id);

        let line = SpawnMessage::for_entity(entity).to_line()?;
        let mut child = Command::new(&self.inner.settings.program)
            .args(&self.inner.settings.args)
            .envs(self.inner.settings.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| IsolationError::Spawn {
                internal_id: entity.internal_id.clone(),
                source,
            })?;
        let stdin = child.stdin.take();

        let unit_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let kill = CancellationToken::new();
        {
            let mut units = self.inner.units.lock().expect("Supervisor lock poisoned");
            units.insert(
                entity.internal_id.clone(),
                UnitSlot {
                    unit_id,
                    kill: kill.clone(),
                },
            );
        }

        log::info!(
            "Spawned worker {} (pid {:?}) for {}",
            unit_id,
            child.id(),
            entity.internal_id
        );

        let inner = Arc::clone(&self.inner);
        let internal_id = entity.internal_id.clone();
        self.inner
            .tasks
            .spawn(monitor(inner, internal_id, unit_id, child, stdin, line, kill));
        Ok(unit_id)
    }

    /// Kills the entity's worker. Returns false when it had none.
    pub fn stop_unit(&self, internal_id: &str) -> bool {
        let slot = self.inner.units.lock().expect("Supervisor lock poisoned").remove(internal_id);
        match slot {
            Some(slot) => {
                log::info!("Stopping worker {} for {}", slot.unit_id, internal_id);
                slot.kill.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of running workers.
    pub fn unit_count(&self) -> usize {
        self.inner.units.lock().expect("Supervisor lock poisoned").len()
    }

    /// Kills every worker and waits until all of them are reaped.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let slots: Vec<UnitSlot> = {
            let mut units = self.inner.units.lock().expect("Supervisor lock poisoned");
            units.drain().map(|(_, slot)| slot).collect()
        };
        log::info!("Stopping {} workers", slots.len());
        for slot in slots {
            slot.kill.cancel();
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

async fn monitor(
    inner: Arc<SupervisorInner>,
    internal_id: String,
    unit_id: u64,
    mut child: Child,
    stdin: Option<ChildStdin>,
    line: String,
    kill: CancellationToken,
) {
    // 1. Hand over the spawn message; dropping stdin sends EOF.
    if let Some(mut stdin) = stdin {
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            log::error!("Failed to hand spawn message to worker {} for {}: {}", unit_id, internal_id, e);
        }
    }

    // 2. Wait for exit or kill
    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                log::warn!("Failed to kill worker {} for {}: {}", unit_id, internal_id, e);
            }
            (child.wait().await, true)
        }
    };

    // 3. Free the slot unless a newer worker took it
    {
        let mut units = inner.units.lock().expect("Supervisor lock poisoned");
        if units.get(&internal_id).is_some_and(|slot| slot.unit_id == unit_id) {
            units.remove(&internal_id);
        }
    }

    let code = status.as_ref().ok().and_then(|s| s.code());
    let success = status.as_ref().is_ok_and(|s| s.success());
    match &status {
        Ok(_) if success => log::info!("Worker {} for {} exited normally", unit_id, internal_id),
        Ok(s) if killed => log::info!("Worker {} for {} stopped ({})", unit_id, internal_id, s),
        Ok(s) => log::error!(
            "Worker {} for {} exited abnormally ({}); not restarting",
            unit_id,
            internal_id,
            s
        ),
        Err(e) => log::error!("Failed to wait for worker {} for {}: {}", unit_id, internal_id, e),
    }

    // The receiver may be gone during shutdown.
    let _ = inner.exits.send(UnitExit {
        internal_id,
        unit_id,
        code,
        success,
        killed,
    });
}

#[async_trait]
impl SessionControl for IsolationSupervisor {
    async fn start(&self, entity: &Entity) {
        if let Err(e) = self.spawn_isolated(entity) {
            log::error!("{}", e);
        }
    }

    async fn stop(&self, internal_id: &str) {
        if !self.stop_unit(internal_id) {
            log::debug!("No worker to stop for {}", internal_id);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::telemetry::ProviderKind;
    use std::time::Duration;
    use tokio::time::timeout;

    fn shell(script: &str) -> IsolationSettings {
        IsolationSettings {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            envs: Vec::new(),
        }
    }

    fn entity(internal_id: &str) -> Entity {
        Entity::new(&format!("ext-{}", internal_id), internal_id, ProviderKind::Neurosity)
    }

    async fn next_exit(rx: &mut mpsc::UnboundedReceiver<UnitExit>) -> UnitExit {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("worker did not exit in time")
            .expect("exit channel closed")
    }

    #[tokio::test]
    async fn test_worker_receives_spawn_message() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("message.json");
        let script = format!("read line; printf '%s' \"$line\" > '{}'", out.display());
        let (supervisor, mut exits) = IsolationSupervisor::new(shell(&script));

        supervisor.spawn_isolated(&entity("E1")).unwrap();
        let exit = next_exit(&mut exits).await;
        assert!(exit.success);
        assert_eq!(exit.internal_id, "E1");

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            SpawnMessage::from_line(&written).unwrap(),
            SpawnMessage { external_id: "ext-E1".into(), internal_id: "E1".into() }
        );
        assert_eq!(supervisor.unit_count(), 0);
    }

    #[tokio::test]
    async fn test_abnormal_exit_is_reported_not_restarted() {
        let (supervisor, mut exits) = IsolationSupervisor::new(shell("read line; exit 3"));

        supervisor.spawn_isolated(&entity("E1")).unwrap();
        let exit = next_exit(&mut exits).await;
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success);
        assert!(!exit.killed);

        // Nothing comes back on its own.
        assert!(timeout(Duration::from_millis(300), exits.recv()).await.is_err());
        assert_eq!(supervisor.unit_count(), 0);
    }

    #[tokio::test]
    async fn test_restart_kills_previous_worker() {
        let (supervisor, mut exits) = IsolationSupervisor::new(shell("read line; sleep 30"));

        let first = supervisor.spawn_isolated(&entity("E1")).unwrap();
        let second = supervisor.spawn_isolated(&entity("E1")).unwrap();
        assert_ne!(first, second);

        let exit = next_exit(&mut exits).await;
        assert_eq!(exit.unit_id, first);
        assert!(exit.killed);
        assert_eq!(supervisor.unit_count(), 1);

        supervisor.shutdown().await;
        let exit = next_exit(&mut exits).await;
        assert_eq!(exit.unit_id, second);
        assert_eq!(supervisor.unit_count(), 0);
    }

    #[tokio::test]
    async fn test_session_control_routes_to_workers() {
        let (supervisor, mut exits) = IsolationSupervisor::new(shell("read line; sleep 30"));

        SessionControl::start(&supervisor, &entity("E1")).await;
        assert_eq!(supervisor.unit_count(), 1);

        SessionControl::stop(&supervisor, "E1").await;
        let exit = next_exit(&mut exits).await;
        assert!(exit.killed);

        supervisor.shutdown().await;
        assert!(matches!(supervisor.spawn_isolated(&entity("E2")), Err(IsolationError::ShutDown)));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (supervisor, _exits) = IsolationSupervisor::new(IsolationSettings {
            program: PathBuf::from("/nonexistent/session_worker"),
            args: Vec::new(),
            envs: Vec::new(),
        });
        let err = supervisor.spawn_isolated(&entity("E1")).unwrap_err();
        assert!(matches!(err, IsolationError::Spawn { .. }));
        assert_eq!(supervisor.unit_count(), 0);
    }
}
