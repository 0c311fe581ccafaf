//! Worker process abstraction and the default `tokio::process` spawner

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use drover_ipc::ControlChannel;
use nix::sys::signal::Signal;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};

/// Environment variable carrying the worker id; its presence marks a worker process
pub const WORKER_ID_ENV: &str = "DROVER_WORKER_ID";

/// Subcommand selecting the worker bootstrap in the spawned program
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Handle to a spawned worker process
#[async_trait]
pub trait Process: Send {
    /// OS process id, if the process has one and is still known
    fn id(&self) -> Option<u32>;

    fn is_running(&mut self) -> bool;

    /// Forcibly terminate and reap the process
    async fn kill(&mut self) -> io::Result<()>;

    /// Wait for the process to exit, returning its exit code when it has one
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Deliver an OS signal
    fn signal(&self, signal: Signal) -> io::Result<()>;
}

/// What the supervisor asks a spawner for
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub worker_id: String,
    /// Rendezvous URI, or `-` when socket sharing is disabled
    pub rendezvous_uri: String,
}

/// A freshly spawned worker and its control channel
pub struct SpawnedWorker {
    pub process: Box<dyn Process>,
    pub control: ControlChannel,
}

/// Creates worker processes
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> ClusterResult<SpawnedWorker>;
}

/// Spawns `<program> worker <rendezvous-uri> <entry> [args...]`
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    entry: String,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>, entry: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            entry: entry.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Spawn workers from the currently running executable
    pub fn current_exe(entry: impl Into<String>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, entry))
    }

    /// Append a user argument passed after the entry name
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for every worker
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, request: &SpawnRequest) -> ClusterResult<SpawnedWorker> {
        debug!(
            "Spawning worker {}: {} {} {} {}",
            request.worker_id,
            self.program.display(),
            WORKER_SUBCOMMAND,
            request.rendezvous_uri,
            self.entry
        );

        let spawn_error = |message: String| ClusterError::Spawn {
            worker_id: request.worker_id.clone(),
            message,
        };

        let mut child = Command::new(&self.program)
            .arg(WORKER_SUBCOMMAND)
            .arg(&request.rendezvous_uri)
            .arg(&self.entry)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_ID_ENV, &request.worker_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(format!("Failed to spawn {}: {}", self.program.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("Failed to get stdout".to_string()))?;

        Ok(SpawnedWorker {
            process: Box::new(ChildProcess { child }),
            control: ControlChannel::from_child(stdin, stdout),
        })
    }
}

/// [`Process`] backed by a `tokio::process::Child`
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

#[async_trait]
impl Process for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        use nix::unistd::Pid;

        // Already reaped
        let Some(id) = self.child.id() else {
            return Ok(());
        };
        nix::sys::signal::kill(Pid::from_raw(id as i32), signal)?;
        Ok(())
    }
}
