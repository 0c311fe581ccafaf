//! Cluster supervisor
//!
//! Spawns workers one after another, each with its own handshake deadline,
//! and tears them all down concurrently with a bounded grace period.

use std::ffi::OsString;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use drover_config::{ClusterConfig, Validatable};
use drover_ipc::RendezvousListener;
use futures::future::join_all;
use futures::Stream;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ClusterError, ClusterResult};
use crate::process::{ProcessSpawner, WORKER_ID_ENV};
use crate::registry::SocketRegistry;
use crate::session::{SessionShared, ShutdownOutcome, WorkerEvent, WorkerInfo, WorkerSession, WorkerState};

/// Tally of how workers left during `stop()`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Exited within the grace period
    pub clean: usize,
    /// Force-killed after the grace period
    pub killed: usize,
}

/// Ordered stream of `data` messages from all workers
///
/// Ends once every worker session has been torn down.
#[derive(Debug)]
pub struct MessageStream {
    inner: UnboundedReceiverStream<WorkerEvent>,
}

impl MessageStream {
    pub async fn next(&mut self) -> Option<WorkerEvent> {
        self.inner.next().await
    }
}

impl Stream for MessageStream {
    type Item = WorkerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

struct ClusterState {
    sessions: Vec<WorkerSession>,
    /// Taken by the first `iterate()`
    events: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    /// Removes its socket file when dropped
    rendezvous: Option<RendezvousListener>,
}

pub struct Supervisor {
    config: ClusterConfig,
    spawner: Arc<dyn ProcessSpawner>,
    registry: Arc<SocketRegistry>,
    state: Option<ClusterState>,
}

impl Supervisor {
    /// Create a supervisor; refuses to run inside a worker process
    pub fn new(config: ClusterConfig, spawner: Arc<dyn ProcessSpawner>) -> ClusterResult<Self> {
        reject_inside_worker(std::env::var_os(WORKER_ID_ENV))?;
        config.validate()?;

        Ok(Self {
            config,
            spawner,
            registry: Arc::new(SocketRegistry::new()),
            state: None,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Sockets bound on behalf of workers
    pub fn registry(&self) -> &Arc<SocketRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    /// Spawn `worker_count` workers and complete every handshake
    ///
    /// Either all workers come up or none are left running.
    pub async fn start(&mut self, worker_count: usize) -> ClusterResult<()> {
        if self.state.is_some() {
            return Err(ClusterError::usage("cluster is already running"));
        }
        if worker_count == 0 {
            return Err(ClusterError::usage("worker count must be positive"));
        }

        let rendezvous = if self.config.share_sockets {
            Some(RendezvousListener::bind(self.rendezvous_path())?)
        } else {
            None
        };

        info!("Starting cluster with {} workers", worker_count);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = SessionShared {
            events: events_tx,
            registry: self.registry.clone(),
            connect_timeout: self.config.connect_timeout,
        };

        let mut sessions = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_id = format!("worker-{}", index + 1);

            match WorkerSession::establish(worker_id, self.spawner.as_ref(), rendezvous.as_ref(), &shared)
                .await
            {
                Ok(session) => {
                    info!("Worker {} is ready", session.id());
                    sessions.push(session);
                }
                Err(e) => {
                    error!(
                        "Worker startup failed, rolling back {} started workers: {}",
                        sessions.len(),
                        e
                    );
                    shutdown_all(sessions, self.config.shutdown_timeout).await;
                    return Err(e);
                }
            }
        }

        self.state = Some(ClusterState {
            sessions,
            events: Some(events_rx),
            rendezvous,
        });
        info!("Cluster started");
        Ok(())
    }

    /// Terminate every worker, killing those that outlive the grace period
    ///
    /// A no-op when the cluster is not running.
    pub async fn stop(&mut self) -> ClusterResult<ShutdownReport> {
        let Some(state) = self.state.take() else {
            return Ok(ShutdownReport::default());
        };

        info!("Stopping {} workers", state.sessions.len());
        let report = shutdown_all(state.sessions, self.config.shutdown_timeout).await;
        drop(state.rendezvous);

        info!(
            "Cluster stopped: {} exited cleanly, {} killed",
            report.clean, report.killed
        );
        Ok(report)
    }

    /// Enqueue `payload` for every live worker
    pub fn broadcast(&self, payload: JsonValue) -> ClusterResult<()> {
        let state = self.running_state()?;

        for session in &state.sessions {
            if session.state() == WorkerState::Exited {
                continue;
            }
            if let Err(e) = session.send(payload.clone()) {
                warn!("Failed to deliver broadcast to {}: {}", session.id(), e);
            }
        }
        Ok(())
    }

    /// Enqueue `payload` for one worker
    pub fn send_to(&self, worker_id: &str, payload: JsonValue) -> ClusterResult<()> {
        let state = self.running_state()?;
        let session = state
            .sessions
            .iter()
            .find(|session| session.id() == worker_id)
            .ok_or_else(|| ClusterError::usage(format!("unknown worker id: {}", worker_id)))?;
        session.send(payload)
    }

    /// Take the aggregation stream; available once per `start()`
    pub fn iterate(&mut self) -> ClusterResult<MessageStream> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| ClusterError::usage("iterate() called before start()"))?;
        let events = state
            .events
            .take()
            .ok_or_else(|| ClusterError::usage("iterate() already called for this cluster"))?;

        Ok(MessageStream {
            inner: UnboundedReceiverStream::new(events),
        })
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.state
            .as_ref()
            .map(|state| state.sessions.iter().map(WorkerSession::info).collect())
            .unwrap_or_default()
    }

    fn running_state(&self) -> ClusterResult<&ClusterState> {
        self.state
            .as_ref()
            .ok_or_else(|| ClusterError::usage("cluster is not running"))
    }

    fn rendezvous_path(&self) -> PathBuf {
        let unique = Uuid::new_v4().simple().to_string();
        self.config.rendezvous_dir().join(format!(
            "drover-{}-{}.sock",
            std::process::id(),
            &unique[..8]
        ))
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };

        warn!(
            "Supervisor dropped while running; stopping {} workers",
            state.sessions.len()
        );
        for session in &state.sessions {
            session.terminate();
        }

        // Without a runtime the children are reaped by kill_on_drop
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let grace = self.config.shutdown_timeout;
            handle.spawn(async move {
                shutdown_all(state.sessions, grace).await;
                drop(state.rendezvous);
            });
        }
    }
}

fn reject_inside_worker(worker_id: Option<OsString>) -> ClusterResult<()> {
    match worker_id {
        Some(id) => Err(ClusterError::usage(format!(
            "cannot create a supervisor inside worker {}",
            id.to_string_lossy()
        ))),
        None => Ok(()),
    }
}

async fn shutdown_all(sessions: Vec<WorkerSession>, grace: Duration) -> ShutdownReport {
    let outcomes = join_all(sessions.into_iter().map(|session| session.shutdown(grace))).await;

    let mut report = ShutdownReport::default();
    for outcome in outcomes {
        match outcome {
            ShutdownOutcome::Clean => report.clean += 1,
            ShutdownOutcome::Killed => report.killed += 1,
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InProcessSpawner, WorkerMode};
    use futures::FutureExt;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Instant;

    fn test_config() -> ClusterConfig {
        ClusterConfig {
            workers: 2,
            connect_timeout: Duration::from_millis(2000),
            shutdown_timeout: Duration::from_millis(1000),
            worker_timeout: Duration::from_millis(2000),
            share_sockets: true,
            rendezvous_dir: None,
        }
    }

    fn supervisor(config: ClusterConfig, spawner: &Arc<InProcessSpawner>) -> Supervisor {
        Supervisor::new(config, spawner.clone()).unwrap()
    }

    async fn next_event(stream: &mut MessageStream) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("event in time")
            .expect("stream open")
    }

    #[test]
    fn test_supervisor_rejected_inside_worker() {
        assert!(reject_inside_worker(None).is_ok());
        let err = reject_inside_worker(Some(OsString::from("worker-3"))).unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("worker-3"));
    }

    #[tokio::test]
    async fn test_start_zero_workers_rejected() {
        let spawner = Arc::new(InProcessSpawner::idle());
        let mut supervisor = supervisor(test_config(), &spawner);

        assert!(supervisor.start(0).await.unwrap_err().is_usage());
        assert_eq!(spawner.spawned(), 0);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let spawner = Arc::new(InProcessSpawner::idle());
        let mut supervisor = supervisor(test_config(), &spawner);

        let started = Instant::now();
        assert_eq!(supervisor.stop().await.unwrap(), ShutdownReport::default());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_usage_errors() {
        let spawner = Arc::new(InProcessSpawner::idle());
        let mut supervisor = supervisor(test_config(), &spawner);

        assert!(supervisor.iterate().unwrap_err().is_usage());
        assert!(supervisor.broadcast(json!("early")).unwrap_err().is_usage());

        supervisor.start(1).await.unwrap();
        assert!(supervisor.start(1).await.unwrap_err().is_usage());
        assert_eq!(spawner.spawned(), 1);

        assert!(supervisor.iterate().is_ok());
        assert!(supervisor.iterate().unwrap_err().is_usage());
        assert!(supervisor
            .send_to("worker-9", json!("hello"))
            .unwrap_err()
            .is_usage());

        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_ready_go_end_to_end() {
        let spawner = Arc::new(InProcessSpawner::cooperative(|ctx| async move {
            let reply = ctx.clone();
            ctx.on_message(move |payload: JsonValue| {
                let reply = reply.clone();
                async move {
                    if payload == json!("go") {
                        reply.send(json!("got go")).unwrap();
                    }
                }
            });
            ctx.send(json!("ready")).unwrap();
        }));
        let mut supervisor = supervisor(test_config(), &spawner);

        supervisor.start(3).await.unwrap();
        assert_eq!(supervisor.workers().len(), 3);
        assert!(supervisor
            .workers()
            .iter()
            .all(|worker| worker.state == WorkerState::Running));

        let mut stream = supervisor.iterate().unwrap();
        let mut ready = Vec::new();
        for _ in 0..3 {
            let event = next_event(&mut stream).await;
            assert_eq!(event.payload, json!("ready"));
            ready.push(event.worker_id);
        }
        ready.sort();
        assert_eq!(ready, vec!["worker-1", "worker-2", "worker-3"]);

        supervisor.broadcast(json!("go")).unwrap();
        let mut acknowledged = Vec::new();
        for _ in 0..3 {
            let event = next_event(&mut stream).await;
            assert_eq!(event.payload, json!("got go"));
            acknowledged.push(event.worker_id);
        }
        acknowledged.sort();
        assert_eq!(acknowledged, ready);

        let report = supervisor.stop().await.unwrap();
        assert_eq!(report, ShutdownReport { clean: 3, killed: 0 });
        assert_eq!(spawner.running(), 0);

        // Stream completes once the sessions are gone
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_rapid_broadcasts_arrive_once_in_order() {
        let spawner = Arc::new(InProcessSpawner::cooperative(|ctx| async move {
            let echo = ctx.clone();
            ctx.on_message(move |payload: JsonValue| {
                let echo = echo.clone();
                async move {
                    echo.send(payload).unwrap();
                }
            });
        }));
        let mut supervisor = supervisor(test_config(), &spawner);
        supervisor.start(2).await.unwrap();
        let mut stream = supervisor.iterate().unwrap();

        for i in 0..100 {
            supervisor.broadcast(json!(i)).unwrap();
        }

        let mut per_worker: HashMap<String, Vec<JsonValue>> = HashMap::new();
        for _ in 0..200 {
            let event = next_event(&mut stream).await;
            per_worker.entry(event.worker_id).or_default().push(event.payload);
        }

        let expected: Vec<JsonValue> = (0..100).map(|i| json!(i)).collect();
        assert_eq!(per_worker.len(), 2);
        for received in per_worker.values() {
            assert_eq!(received, &expected);
        }

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_reaches_one_worker() {
        let spawner = Arc::new(InProcessSpawner::cooperative(|ctx| async move {
            let echo = ctx.clone();
            ctx.on_message(move |payload: JsonValue| {
                let echo = echo.clone();
                async move {
                    echo.send(payload).unwrap();
                }
            });
        }));
        let mut supervisor = supervisor(test_config(), &spawner);
        supervisor.start(2).await.unwrap();
        let mut stream = supervisor.iterate().unwrap();

        supervisor.send_to("worker-2", json!("only you")).unwrap();
        let event = next_event(&mut stream).await;
        assert_eq!(event.worker_id, "worker-2");
        assert_eq!(event.payload, json!("only you"));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stubborn_worker_is_killed() {
        let spawner = Arc::new(InProcessSpawner::cooperative(|ctx| async move {
            ctx.on_terminate(|| std::future::pending::<()>());
        }));
        let mut config = test_config();
        config.shutdown_timeout = Duration::from_millis(200);
        let mut supervisor = supervisor(config, &spawner);
        supervisor.start(1).await.unwrap();

        let started = Instant::now();
        let report = supervisor.stop().await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(report, ShutdownReport { clean: 0, killed: 1 });
        assert_eq!(spawner.running(), 0);
    }

    #[tokio::test]
    async fn test_wrong_key_fails_start() {
        let spawner = Arc::new(InProcessSpawner::new(|_| WorkerMode::Impostor));
        let mut config = test_config();
        config.connect_timeout = Duration::from_millis(300);
        let mut supervisor = supervisor(config, &spawner);

        let err = supervisor.start(1).await.unwrap_err();
        assert!(matches!(err, ClusterError::HandshakeTimeout { .. }), "{}", err);
        assert!(!supervisor.is_running());
        assert_eq!(spawner.running(), 0);
    }

    #[tokio::test]
    async fn test_worker_exit_during_handshake_fails_fast() {
        let spawner = Arc::new(InProcessSpawner::new(|_| WorkerMode::Crash));
        let mut config = test_config();
        config.connect_timeout = Duration::from_secs(10);
        let mut supervisor = supervisor(config, &spawner);

        let started = Instant::now();
        let err = supervisor.start(2).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        match err {
            ClusterError::Handshake { worker_id, message } => {
                assert_eq!(worker_id, "worker-1");
                assert!(message.contains("exited"), "{}", message);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(spawner.spawned(), 1);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_abandoned_import_does_not_shift_later_imports() {
        let spawner = Arc::new(InProcessSpawner::cooperative(|ctx| async move {
            // Polled once: the request goes out, then the caller gives up
            let abandoned = ctx.import_socket("tcp://127.0.0.1:0").now_or_never();
            assert!(abandoned.is_none());

            let mut outcomes = Vec::new();
            for _ in 0..2 {
                let outcome = match ctx.import_socket("tcp://127.0.0.1:0").await {
                    Ok(socket) => match socket.listen(8) {
                        Ok(listener) => listener
                            .local_addr()
                            .map(|addr| addr.to_string())
                            .unwrap_or_else(|e| format!("err {}", e)),
                        Err(e) => format!("err {}", e),
                    },
                    Err(e) => format!("err {}", e),
                };
                outcomes.push(outcome);
            }
            ctx.send(json!(outcomes)).unwrap();
        }));
        let mut supervisor = supervisor(test_config(), &spawner);
        supervisor.start(1).await.unwrap();
        let mut stream = supervisor.iterate().unwrap();

        let outcomes: Vec<String> =
            serde_json::from_value(next_event(&mut stream).await.payload).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.starts_with("tcp://127.0.0.1:")), "{:?}", outcomes);
        assert_eq!(outcomes[0], outcomes[1]);
        assert_eq!(supervisor.registry().len(), 1);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        // The third worker never answers its handshake
        let spawner = Arc::new(InProcessSpawner::new(|index| {
            if index < 2 {
                WorkerMode::Idle
            } else {
                WorkerMode::Silent
            }
        }));
        let mut config = test_config();
        config.connect_timeout = Duration::from_millis(300);
        let mut supervisor = supervisor(config, &spawner);

        assert!(supervisor.start(3).await.is_err());
        assert_eq!(spawner.spawned(), 3);
        assert_eq!(spawner.running(), 0);
        assert!(supervisor.workers().is_empty());
    }

    #[tokio::test]
    async fn test_workers_share_one_listening_socket() {
        let spawner = Arc::new(InProcessSpawner::cooperative(|ctx| async move {
            let socket = ctx.import_socket("tcp://127.0.0.1:0").await.unwrap();
            let listener = socket.listen(16).unwrap();
            ctx.send(json!(listener.local_addr().unwrap().to_string()))
                .unwrap();

            let serving = ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = serving.terminated() => {}
                    _ = async {
                        while let Ok(conn) = listener.accept().await {
                            drop(conn);
                        }
                    } => {}
                }
            });
        }));
        let mut supervisor = supervisor(test_config(), &spawner);
        supervisor.start(2).await.unwrap();
        let mut stream = supervisor.iterate().unwrap();

        let first = next_event(&mut stream).await.payload;
        let second = next_event(&mut stream).await.payload;
        assert_eq!(first, second);
        assert_eq!(supervisor.registry().len(), 1);

        let addr = first.as_str().unwrap().trim_start_matches("tcp://").to_string();
        for _ in 0..4 {
            tokio::net::TcpStream::connect(&addr).await.unwrap();
        }

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_import_fails_without_socket_sharing() {
        let spawner = Arc::new(InProcessSpawner::cooperative(|ctx| async move {
            let outcome = match ctx.import_socket("tcp://127.0.0.1:0").await {
                Ok(_) => "imported".to_string(),
                Err(e) => e.to_string(),
            };
            ctx.send(json!(outcome)).unwrap();
        }));
        let mut config = test_config();
        config.share_sockets = false;
        let mut supervisor = supervisor(config, &spawner);
        supervisor.start(1).await.unwrap();
        let mut stream = supervisor.iterate().unwrap();

        let event = next_event(&mut stream).await;
        assert_eq!(
            event.payload,
            json!(ClusterError::SocketSharingDisabled.to_string())
        );
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_while_running_stops_workers() {
        let spawner = Arc::new(InProcessSpawner::idle());
        let mut supervisor = supervisor(test_config(), &spawner);
        supervisor.start(2).await.unwrap();
        assert_eq!(spawner.running(), 2);

        drop(supervisor);

        tokio::time::timeout(Duration::from_secs(3), async {
            while spawner.running() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("workers stopped after drop");
    }
}
