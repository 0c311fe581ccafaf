//! In-process stand-in for worker processes
//!
//! Each "process" is a tokio task talking over an in-memory duplex pipe.
//! The rendezvous socket and descriptor transfer are still real.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use drover_ipc::{connect_authenticated, ControlChannel, HandshakeKey, WorkerMessage, NO_RENDEZVOUS};
use futures::future::BoxFuture;
use futures::FutureExt;
use nix::sys::signal::Signal;
use tokio::task::JoinHandle;

use crate::client::{WorkerBootstrap, WorkerContext};
use crate::error::ClusterResult;
use crate::process::{Process, ProcessSpawner, SpawnRequest, SpawnedWorker};

type Entry = Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum WorkerMode {
    /// Completes the handshake and waits to be terminated
    Idle,
    /// Completes the handshake, runs the entry, then waits to be terminated
    Cooperative(Entry),
    /// Answers the handshake with the wrong key
    Impostor,
    /// Never reads its control channel
    Silent,
    /// Exits before reading anything
    Crash,
}

pub(crate) struct InProcessSpawner {
    mode: Box<dyn Fn(usize) -> WorkerMode + Send + Sync>,
    spawned: AtomicUsize,
    running: Arc<AtomicUsize>,
}

impl InProcessSpawner {
    pub fn new(mode: impl Fn(usize) -> WorkerMode + Send + Sync + 'static) -> Self {
        Self {
            mode: Box::new(mode),
            spawned: AtomicUsize::new(0),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn idle() -> Self {
        Self::new(|_| WorkerMode::Idle)
    }

    pub fn cooperative<F, Fut>(entry: F) -> Self
    where
        F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let entry: Entry = Arc::new(move |ctx| entry(ctx).boxed());
        Self::new(move |_| WorkerMode::Cooperative(entry.clone()))
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Workers whose task has not finished or been killed
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

impl ProcessSpawner for InProcessSpawner {
    fn spawn(&self, request: &SpawnRequest) -> ClusterResult<SpawnedWorker> {
        let index = self.spawned.fetch_add(1, Ordering::SeqCst);
        let mode = (self.mode)(index);

        let (controller_end, worker_end) = tokio::io::duplex(64 * 1024);
        let (c_read, c_write) = tokio::io::split(controller_end);
        let (w_read, w_write) = tokio::io::split(worker_end);
        let channel = ControlChannel::new(w_read, w_write);

        let rendezvous_uri =
            (request.rendezvous_uri != NO_RENDEZVOUS).then(|| request.rendezvous_uri.clone());
        let bootstrap = WorkerBootstrap::new(request.worker_id.clone(), rendezvous_uri, "test", Vec::new());

        let guard = RunningGuard::new(self.running.clone());
        let task = tokio::spawn(async move {
            let _guard = guard;
            run_worker(mode, bootstrap, channel).await;
        });

        Ok(SpawnedWorker {
            process: Box::new(FakeProcess { task: Some(task) }),
            control: ControlChannel::new(c_read, c_write),
        })
    }
}

async fn run_worker(mode: WorkerMode, bootstrap: WorkerBootstrap, channel: ControlChannel) {
    let timeout = Duration::from_secs(2);
    match mode {
        WorkerMode::Idle => {
            if let Ok(ctx) = WorkerContext::connect(&bootstrap, channel, timeout).await {
                ctx.terminated().await;
            }
        }
        WorkerMode::Cooperative(entry) => {
            if let Ok(ctx) = WorkerContext::connect(&bootstrap, channel, timeout).await {
                entry(ctx.clone()).await;
                ctx.terminated().await;
            }
        }
        WorkerMode::Impostor => {
            let (mut reader, _writer) = channel.into_parts();
            if let Ok(envelope) = reader.receive::<WorkerMessage>().await {
                if let WorkerMessage::Handshake { rendezvous_uri, .. } = envelope.message {
                    let forged = HandshakeKey::generate();
                    let _conn = connect_authenticated(&rendezvous_uri, &forged, timeout).await;
                    std::future::pending::<()>().await;
                }
            }
        }
        WorkerMode::Silent => {
            let _channel = channel;
            std::future::pending::<()>().await;
        }
        WorkerMode::Crash => drop(channel),
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn new(running: Arc<AtomicUsize>) -> Self {
        running.fetch_add(1, Ordering::SeqCst);
        Self(running)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeProcess {
    /// `None` once reaped
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn is_running(&mut self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    async fn kill(&mut self) -> io::Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let Some(task) = self.task.as_mut() else {
            return Ok(Some(0));
        };
        let code = match task.await {
            Ok(()) => 0,
            Err(_) => 101,
        };
        self.task = None;
        Ok(Some(code))
    }

    fn signal(&self, _signal: Signal) -> io::Result<()> {
        Ok(())
    }
}
