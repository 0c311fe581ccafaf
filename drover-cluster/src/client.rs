//! Worker side of the control channel
//!
//! A worker process builds exactly one [`WorkerContext`] at bootstrap and
//! passes it to user code. The context requests sockets from the controller,
//! relays application data in both directions, and runs termination hooks
//! when the controller asks the worker to stop.

use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use drover_ipc::{
    connect_authenticated, ControlChannel, ControllerMessage, IpcError, LineReader, BoxedRead,
    SocketTransferChannel, WorkerMessage, NO_RENDEZVOUS,
};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::bus::{run_inbound, Inbound, LoopExit, Outbound};
use crate::error::{BootstrapError, ClusterError, ClusterResult};
use crate::process::WORKER_ID_ENV;
use crate::registry::{BoundSocket, ListenUri, SocketRegistry};

/// Log sink handed to `drover_logging::init_forwarding_tracing`
pub type LogForwarder = Outbound<ControllerMessage>;

static BOOTSTRAPPED: AtomicBool = AtomicBool::new(false);

/// Arguments a worker process was started with
///
/// Mirrors the spawn contract `worker <rendezvous-uri> <entry> [args...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerBootstrap {
    pub worker_id: String,
    /// `None` when the controller disabled socket sharing
    pub rendezvous_uri: Option<String>,
    pub entry: String,
    pub args: Vec<String>,
}

impl WorkerBootstrap {
    pub fn new(
        worker_id: impl Into<String>,
        rendezvous_uri: Option<String>,
        entry: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            rendezvous_uri,
            entry: entry.into(),
            args,
        }
    }

    /// Parse `<rendezvous-uri> <entry> [args...]`, taking the id from the environment
    pub fn from_args<I>(args: I) -> Result<Self, BootstrapError>
    where
        I: IntoIterator<Item = String>,
    {
        let worker_id = std::env::var(WORKER_ID_ENV)
            .map_err(|_| BootstrapError::Usage(format!("{} is not set", WORKER_ID_ENV)))?;
        Self::parse(worker_id, args)
    }

    fn parse<I>(worker_id: String, args: I) -> Result<Self, BootstrapError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let rendezvous = args
            .next()
            .ok_or_else(|| BootstrapError::Usage("missing rendezvous URI".to_string()))?;
        let entry = args
            .next()
            .filter(|entry| !entry.is_empty())
            .ok_or_else(|| BootstrapError::Usage("missing worker entry".to_string()))?;

        let rendezvous_uri = match rendezvous.as_str() {
            NO_RENDEZVOUS | "" => None,
            _ => Some(rendezvous),
        };

        Ok(Self::new(worker_id, rendezvous_uri, entry, args.collect()))
    }
}

/// Receives application data sent by the controller
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, payload: JsonValue);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_message(&self, payload: JsonValue) {
        (self)(payload).await
    }
}

/// Cleanup hook run when the worker is asked to stop
#[async_trait]
pub trait TerminateHandler: Send + Sync + 'static {
    async fn on_terminate(&self);
}

#[async_trait]
impl<F, Fut> TerminateHandler for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_terminate(&self) {
        (self)().await
    }
}

/// Where `import_socket` gets its sockets from
enum SocketImporter {
    /// Over the authenticated transfer connection; `None` once closed
    Remote(tokio::sync::Mutex<Option<SocketTransferChannel>>),
    /// Single-process mode: bind in-process
    Local(SocketRegistry),
    /// Controller started us with socket sharing disabled
    Disabled,
}

struct Inner {
    worker_id: Option<String>,
    outbound: Option<Outbound<ControllerMessage>>,
    importer: SocketImporter,
    next_request: AtomicU64,
    /// Imports awaiting a reply; `None` once termination has started
    pending: Mutex<Option<HashMap<u64, oneshot::Sender<Result<(), String>>>>>,
    handlers: Mutex<Vec<mpsc::UnboundedSender<JsonValue>>>,
    /// `None` once termination has started
    terminate_handlers: Mutex<Option<Vec<Arc<dyn TerminateHandler>>>>,
    done: watch::Sender<bool>,
}

/// Handle to this process's controller relationship
///
/// Cheap to clone; every clone refers to the same context.
#[derive(Clone)]
pub struct WorkerContext {
    inner: Arc<Inner>,
}

impl WorkerContext {
    /// Bootstrap the process-wide context over stdin/stdout
    ///
    /// Fails with [`BootstrapError::AlreadyBootstrapped`] on a second call.
    pub async fn from_stdio(
        bootstrap: &WorkerBootstrap,
        worker_timeout: Duration,
    ) -> Result<Self, BootstrapError> {
        if BOOTSTRAPPED.swap(true, Ordering::SeqCst) {
            return Err(BootstrapError::AlreadyBootstrapped);
        }
        Self::connect(bootstrap, ControlChannel::stdio(), worker_timeout).await
    }

    /// Complete the worker half of the handshake over `channel`
    pub async fn connect(
        bootstrap: &WorkerBootstrap,
        channel: ControlChannel,
        worker_timeout: Duration,
    ) -> Result<Self, BootstrapError> {
        let (mut reader, writer) = channel.into_parts();
        let (outbound, _writer_task) = Outbound::spawn("controller", writer);

        let importer = match &bootstrap.rendezvous_uri {
            Some(_) => {
                let transfer = tokio::time::timeout(
                    worker_timeout,
                    open_transfer(&mut reader, worker_timeout),
                )
                .await
                .map_err(|_| IpcError::Timeout)??;
                SocketImporter::Remote(tokio::sync::Mutex::new(Some(transfer)))
            }
            None => SocketImporter::Disabled,
        };
        debug!("Worker {} connected to its controller", bootstrap.worker_id);

        let context = Self::build(Some(bootstrap.worker_id.clone()), Some(outbound), importer);

        let inner = context.inner.clone();
        tokio::spawn(async move {
            let mut inbound = ClientInbound {
                inner: inner.clone(),
            };
            match run_inbound::<WorkerMessage, _>(&mut reader, &mut inbound).await {
                LoopExit::Completed => debug!("Terminate requested by controller"),
                LoopExit::Closed => debug!("Control channel closed by controller"),
                LoopExit::Failed(e) => warn!("Control channel failed: {}", e),
            }
            inner.terminate().await;
        });

        Ok(context)
    }

    /// A context for running outside a cluster
    ///
    /// `import_socket` binds in-process and `is_worker` is false.
    pub fn standalone() -> Self {
        Self::build(None, None, SocketImporter::Local(SocketRegistry::new()))
    }

    fn build(
        worker_id: Option<String>,
        outbound: Option<Outbound<ControllerMessage>>,
        importer: SocketImporter,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                worker_id,
                outbound,
                importer,
                next_request: AtomicU64::new(1),
                pending: Mutex::new(Some(HashMap::new())),
                handlers: Mutex::new(Vec::new()),
                terminate_handlers: Mutex::new(Some(Vec::new())),
                done,
            }),
        }
    }

    pub fn is_worker(&self) -> bool {
        self.inner.worker_id.is_some()
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.inner.worker_id.as_deref()
    }

    /// Obtain a bound socket for `uri`; call `listen()` on it yourself
    pub async fn import_socket(&self, uri: &str) -> ClusterResult<BoundSocket> {
        let uri: ListenUri = uri.parse()?;

        match &self.inner.importer {
            SocketImporter::Local(registry) => Ok(registry.bind(&uri)?),
            SocketImporter::Disabled => Err(ClusterError::SocketSharingDisabled),
            SocketImporter::Remote(transfer) => {
                // Held for the whole exchange so descriptors arrive in request order
                let transfer = transfer.lock().await;
                let channel = transfer
                    .as_ref()
                    .ok_or_else(|| ClusterError::SocketImport("worker is terminating".to_string()))?;
                let outbound = self
                    .inner
                    .outbound
                    .as_ref()
                    .ok_or_else(|| ClusterError::usage("not connected to a controller"))?;

                let request_id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
                let (reply_tx, reply_rx) = oneshot::channel();
                match self.inner.pending.lock().as_mut() {
                    Some(pending) => pending.insert(request_id, reply_tx),
                    None => {
                        return Err(ClusterError::SocketImport(
                            "worker is terminating".to_string(),
                        ))
                    }
                };

                if let Err(e) = outbound.send(ControllerMessage::ImportSocket {
                    request_id,
                    uri: uri.to_string(),
                }) {
                    self.inner.take_pending(request_id);
                    return Err(e.into());
                }

                match reply_rx.await {
                    Ok(Ok(())) => {}
                    Ok(Err(message)) => return Err(ClusterError::SocketImport(message)),
                    Err(_) => {
                        return Err(ClusterError::SocketImport(
                            "worker is terminating".to_string(),
                        ))
                    }
                }

                // Imports whose caller gave up still had their descriptor
                // sent; those arrive first and are closed here.
                loop {
                    let (fd, tag) = channel.receive().await?;
                    if tag < request_id {
                        debug!("Discarding descriptor for abandoned request {}", tag);
                        drop(fd);
                        continue;
                    }
                    if tag != request_id {
                        return Err(ClusterError::SocketImport(format!(
                            "expected descriptor for request {}, got {}",
                            request_id, tag
                        )));
                    }
                    debug!("Imported {}", uri);
                    return Ok(BoundSocket::from_fd(uri, fd));
                }
            }
        }
    }

    /// Send application data to the controller's aggregation stream
    pub fn send(&self, payload: JsonValue) -> ClusterResult<()> {
        let outbound = self
            .inner
            .outbound
            .as_ref()
            .ok_or_else(|| ClusterError::usage("send() requires a worker context"))?;
        outbound.send(ControllerMessage::Data { payload })?;
        Ok(())
    }

    /// Register a handler for data sent by the controller
    ///
    /// Each handler gets its own queue and task: a slow or panicking handler
    /// delays nobody else, and every handler sees messages in send order.
    pub fn on_message(&self, handler: impl MessageHandler) {
        let (tx, mut rx) = mpsc::unbounded_channel::<JsonValue>();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let fut = handler.on_message(payload);
                if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                    warn!("Message handler panicked: {}", panic_message(panic.as_ref()));
                }
            }
        });

        self.inner.handlers.lock().push(tx);
    }

    /// Register a cleanup hook; ignored once termination has started
    pub fn on_terminate(&self, handler: impl TerminateHandler) {
        match self.inner.terminate_handlers.lock().as_mut() {
            Some(handlers) => handlers.push(Arc::new(handler)),
            None => debug!("Ignoring terminate handler registered during termination"),
        }
    }

    /// Tracing sink that ships records to the controller
    pub fn log_forwarder(&self) -> Option<LogForwarder> {
        self.inner.outbound.clone()
    }

    /// Resolves once the termination sequence has finished
    pub async fn terminated(&self) {
        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Run the termination sequence without waiting for the controller
    pub async fn shutdown(&self) {
        self.inner.terminate().await;
        self.terminated().await;
    }
}

impl Inner {
    fn take_pending(&self, request_id: u64) -> Option<oneshot::Sender<Result<(), String>>> {
        self.pending.lock().as_mut()?.remove(&request_id)
    }

    fn dispatch(&self, payload: JsonValue) {
        for handler in self.handlers.lock().iter() {
            let _ = handler.send(payload.clone());
        }
    }

    async fn terminate(&self) {
        let Some(handlers) = self.terminate_handlers.lock().take() else {
            return;
        };
        debug!("Running {} terminate handlers", handlers.len());

        let results = join_all(
            handlers
                .iter()
                .map(|handler| AssertUnwindSafe(handler.on_terminate()).catch_unwind()),
        )
        .await;
        for panic in results.into_iter().filter_map(Result::err) {
            warn!("Terminate handler panicked: {}", panic_message(panic.as_ref()));
        }

        // Wakes any import still waiting for a reply
        self.pending.lock().take();
        self.handlers.lock().clear();

        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(ControllerMessage::Terminated);
        }
        if let SocketImporter::Remote(transfer) = &self.importer {
            transfer.lock().await.take();
        }
        if let Some(outbound) = &self.outbound {
            outbound.close().await;
        }

        let _ = self.done.send(true);
    }
}

async fn open_transfer(
    reader: &mut LineReader<BoxedRead>,
    worker_timeout: Duration,
) -> Result<SocketTransferChannel, IpcError> {
    let envelope = reader.receive::<WorkerMessage>().await?;
    match envelope.message {
        WorkerMessage::Handshake {
            rendezvous_uri,
            key,
        } => connect_authenticated(&rendezvous_uri, &key, worker_timeout).await,
        other => Err(IpcError::InvalidMessage(format!(
            "expected handshake, got {}",
            other.kind()
        ))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct ClientInbound {
    inner: Arc<Inner>,
}

#[async_trait]
impl Inbound<WorkerMessage> for ClientInbound {
    async fn on_message(&mut self, message: WorkerMessage) -> ControlFlow<()> {
        match message {
            WorkerMessage::Data { payload } => self.inner.dispatch(payload),
            WorkerMessage::SocketReady { request_id } => {
                if let Some(reply) = self.inner.take_pending(request_id) {
                    let _ = reply.send(Ok(()));
                }
            }
            WorkerMessage::SocketError { request_id, error } => {
                if let Some(reply) = self.inner.take_pending(request_id) {
                    let _ = reply.send(Err(error));
                }
            }
            WorkerMessage::Handshake { .. } => warn!("Ignoring repeated handshake"),
            WorkerMessage::Terminate => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_ipc::{LineWriter, BoxedWrite, MessageEnvelope};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Test double for the controller end of a control channel
    struct FakeController {
        reader: LineReader<BoxedRead>,
        writer: LineWriter<BoxedWrite>,
    }

    impl FakeController {
        async fn send(&mut self, message: WorkerMessage) {
            self.writer.send(&MessageEnvelope::new(message)).await.unwrap();
        }

        async fn receive(&mut self) -> ControllerMessage {
            self.reader.receive::<ControllerMessage>().await.unwrap().message
        }

        /// Next non-log message
        async fn receive_data(&mut self) -> ControllerMessage {
            loop {
                match self.receive().await {
                    ControllerMessage::Log { .. } => continue,
                    other => return other,
                }
            }
        }
    }

    async fn connected_worker() -> (WorkerContext, FakeController) {
        let (controller_end, worker_end) = tokio::io::duplex(64 * 1024);
        let (c_read, c_write) = tokio::io::split(controller_end);
        let (w_read, w_write) = tokio::io::split(worker_end);

        let bootstrap = WorkerBootstrap::new("worker-1", None, "test", Vec::new());
        let context = WorkerContext::connect(
            &bootstrap,
            ControlChannel::new(w_read, w_write),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let (reader, writer) = ControlChannel::new(c_read, c_write).into_parts();
        (context, FakeController { reader, writer })
    }

    #[test]
    fn test_bootstrap_parses_spawn_arguments() {
        let args = ["unix:///tmp/rv.sock", "echo", "--port", "8080"].map(String::from);
        let bootstrap = WorkerBootstrap::parse("worker-2".to_string(), args).unwrap();

        assert_eq!(bootstrap.worker_id, "worker-2");
        assert_eq!(bootstrap.rendezvous_uri.as_deref(), Some("unix:///tmp/rv.sock"));
        assert_eq!(bootstrap.entry, "echo");
        assert_eq!(bootstrap.args, vec!["--port", "8080"]);
    }

    #[test]
    fn test_bootstrap_sentinel_disables_handshake() {
        let args = ["-", "echo"].map(String::from);
        let bootstrap = WorkerBootstrap::parse("worker-1".to_string(), args).unwrap();
        assert_eq!(bootstrap.rendezvous_uri, None);
    }

    #[test]
    fn test_bootstrap_rejects_missing_arguments() {
        let err = WorkerBootstrap::parse("worker-1".to_string(), Vec::<String>::new()).unwrap_err();
        assert_eq!(err.exit_code(), 64);

        let err = WorkerBootstrap::parse("worker-1".to_string(), vec!["-".to_string()]).unwrap_err();
        assert!(matches!(err, BootstrapError::Usage(_)));
    }

    #[tokio::test]
    async fn test_standalone_context_binds_locally() {
        let context = WorkerContext::standalone();
        assert!(!context.is_worker());
        assert!(context.log_forwarder().is_none());
        assert!(context.send(json!("nobody listens")).unwrap_err().is_usage());

        let first = context.import_socket("tcp://127.0.0.1:0").await.unwrap();
        let second = context.import_socket("tcp://127.0.0.1:0").await.unwrap();
        let first = first.listen(8).unwrap();
        let second = second.listen(8).unwrap();
        assert_eq!(first.local_addr().unwrap(), second.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_import_without_rendezvous_is_rejected() {
        let (context, _controller) = connected_worker().await;
        assert!(context.is_worker());
        assert!(matches!(
            context.import_socket("tcp://127.0.0.1:0").await,
            Err(ClusterError::SocketSharingDisabled)
        ));
    }

    #[tokio::test]
    async fn test_handlers_are_isolated() {
        let (context, mut controller) = connected_worker().await;

        context.on_message(|_payload: JsonValue| async move {
            panic!("handler failure");
        });
        let echo = context.clone();
        context.on_message(move |payload: JsonValue| {
            let echo = echo.clone();
            async move {
                echo.send(payload).unwrap();
            }
        });

        for i in 0..3 {
            controller.send(WorkerMessage::Data { payload: json!(i) }).await;
        }
        for i in 0..3 {
            match controller.receive_data().await {
                ControllerMessage::Data { payload } => assert_eq!(payload, json!(i)),
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_terminate_runs_handlers_concurrently() {
        let (context, mut controller) = connected_worker().await;
        let ran = Arc::new(AtomicUsize::new(0));

        // Each handler only finishes once both have started
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        for _ in 0..2 {
            let ran = ran.clone();
            let barrier = barrier.clone();
            context.on_terminate(move || {
                let ran = ran.clone();
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        controller.send(WorkerMessage::Terminate).await;
        tokio::time::timeout(Duration::from_secs(2), context.terminated())
            .await
            .expect("termination finished");
        assert_eq!(ran.load(Ordering::SeqCst), 2);

        assert!(matches!(
            controller.receive_data().await,
            ControllerMessage::Terminated
        ));
        assert!(controller.reader.receive::<ControllerMessage>().await.is_err());

        // Registrations after termination are ignored
        let late = ran.clone();
        context.on_terminate(move || {
            let late = late.clone();
            async move {
                late.fetch_add(100, Ordering::SeqCst);
            }
        });
        context.shutdown().await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_channel_close_triggers_termination() {
        let (context, controller) = connected_worker().await;
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        context.on_terminate(move || {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
            }
        });

        drop(controller);
        tokio::time::timeout(Duration::from_secs(2), context.terminated())
            .await
            .expect("termination finished");
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_handshake_requires_handshake_message() {
        let (controller_end, worker_end) = tokio::io::duplex(4096);
        let (c_read, c_write) = tokio::io::split(controller_end);
        let (w_read, w_write) = tokio::io::split(worker_end);
        let (_, mut writer) = ControlChannel::new(c_read, c_write).into_parts();

        writer
            .send(&MessageEnvelope::new(WorkerMessage::Data { payload: json!(1) }))
            .await
            .unwrap();

        let bootstrap = WorkerBootstrap::new(
            "worker-1",
            Some("unix:///nonexistent/rv.sock".to_string()),
            "test",
            Vec::new(),
        );
        let err = WorkerContext::connect(
            &bootstrap,
            ControlChannel::new(w_read, w_write),
            Duration::from_millis(500),
        )
        .await
        .err()
        .expect("handshake must fail");
        assert_eq!(err.exit_code(), 70);
    }
}
