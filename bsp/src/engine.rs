//! Protocol engine — the single owner of connection state.
//!
//! One Tokio task holds [`Engine`] exclusively and processes [`Command`]s
//! from a queue, one at a time. Callers hold a [`BspClient`]; transport
//! listeners hold an [`InboundSink`]. Both only ever enqueue, so no lock
//! guards engine state. Awaited requests park on a oneshot channel, never
//! on the queue, so the engine keeps draining while callers wait.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::ClientConfig;
use crate::discovery::{self, ConnectionDescriptor};
use crate::error::BspError;
use crate::message::{
    self, InboundMessage, Notification, Response, ResponseOutcome, ServerRequest,
};
use crate::pending::{CallerHandle, PendingTable};
use crate::protocol::{self, OutboundMessage, Reply, Request, RequestId, RequestIdGen};
use crate::transport::StdioTransport;

type Ack = oneshot::Sender<Result<(), BspError>>;

pub(crate) enum Command {
    Call {
        method: &'static str,
        params: serde_json::Value,
        reply: CallerHandle,
    },
    Notify {
        method: &'static str,
        params: serde_json::Value,
        ack: Option<Ack>,
    },
    Exit {
        ack: Ack,
    },
    Respond {
        id: serde_json::Value,
        outcome: ResponseOutcome,
        ack: Ack,
    },
    Inbound(Vec<serde_json::Value>),
    TransportClosed {
        reason: String,
    },
    Expire {
        id: RequestId,
        after: Duration,
    },
    TakeNotifications(oneshot::Sender<Vec<Notification>>),
    TakeServerRequests(oneshot::Sender<Vec<ServerRequest>>),
    Stats(oneshot::Sender<EngineStats>),
    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// Point-in-time counters of an engine, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Id the next request will carry.
    pub next_id: RequestId,
    /// Requests still waiting for a response.
    pub pending: usize,
    pub buffered_notifications: usize,
    pub buffered_server_requests: usize,
    /// Responses whose id matched no pending request.
    pub unmatched_responses: u64,
    /// Inbound frames that were neither response, notification nor request.
    pub malformed_messages: u64,
    /// Whether the connection has been closed.
    pub closed: bool,
}

struct Engine {
    config: Arc<ClientConfig>,
    ids: RequestIdGen,
    pending: PendingTable,
    notifications: Vec<Notification>,
    server_requests: Vec<ServerRequest>,
    unmatched_responses: u64,
    malformed_messages: u64,
    /// Dropped once the connection closes, which also ends the writer task.
    /// Unbounded: the engine never waits on the writer, which itself waits
    /// on a server that may be waiting on us.
    outbound: Option<mpsc::UnboundedSender<serde_json::Value>>,
    closed: Option<String>,
    transport: Option<StdioTransport>,
    /// For deadline timers; weak so the engine still ends when every
    /// client handle is gone.
    commands: mpsc::WeakSender<Command>,
}

impl Engine {
    fn new(
        config: Arc<ClientConfig>,
        outbound: mpsc::UnboundedSender<serde_json::Value>,
        transport: Option<StdioTransport>,
        commands: mpsc::WeakSender<Command>,
    ) -> Self {
        Self {
            config,
            ids: RequestIdGen::new(),
            pending: PendingTable::new(),
            notifications: Vec::new(),
            server_requests: Vec::new(),
            unmatched_responses: 0,
            malformed_messages: 0,
            outbound: Some(outbound),
            closed: None,
            transport,
            commands,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            if let ControlFlow::Break(ack) = self.handle(command) {
                self.stop("client stopped").await;
                let _ = ack.send(());
                return;
            }
        }
        self.stop("all client handles dropped").await;
    }

    /// Apply one command without awaiting anything. `Stop` breaks out with
    /// its ack, since teardown has to finish before it is acknowledged.
    fn handle(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::Call {
                method,
                params,
                reply,
            } => self.call(method, params, reply),
            Command::Notify {
                method,
                params,
                ack,
            } => {
                let result = self.write(OutboundMessage::Notification(
                    protocol::Notification::new(method, params),
                ));
                match ack {
                    Some(ack) => {
                        let _ = ack.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::debug!(method, "Dropped best-effort notification: {e}");
                        }
                    }
                }
            }
            Command::Exit { ack } => {
                let _ = ack.send(self.exit());
            }
            Command::Respond { id, outcome, ack } => {
                let result = self.write(OutboundMessage::Reply(Reply::new(id, outcome)));
                let _ = ack.send(result);
            }
            Command::Inbound(batch) => self.deliver_inbound(batch),
            Command::TransportClosed { reason } => self.close(&reason),
            Command::Expire { id, after } => {
                if self.pending.fail(id, BspError::Timeout { id, after }) {
                    tracing::warn!(%id, timeout = ?after, "BSP request timed out");
                }
            }
            Command::TakeNotifications(reply) => {
                let _ = reply.send(std::mem::take(&mut self.notifications));
            }
            Command::TakeServerRequests(reply) => {
                let _ = reply.send(std::mem::take(&mut self.server_requests));
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Stop { ack } => return ControlFlow::Break(ack),
        }
        ControlFlow::Continue(())
    }

    fn call(&mut self, method: &'static str, params: serde_json::Value, reply: CallerHandle) {
        // Checked before issuing, so a dead connection consumes no id.
        if let Err(e) = self.ensure_open() {
            let _ = reply.send(Err(e));
            return;
        }

        let id = self.ids.issue();
        let message = OutboundMessage::Request(Request::new(id, method, params));
        let frame = match encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        if let Err(reply) = self.pending.reserve(id, reply) {
            tracing::error!(%id, method, "Request id already pending");
            let _ = reply.send(Err(BspError::DuplicateRequestId(id)));
            return;
        }

        tracing::debug!(%id, method, "Sending BSP request");
        // A failed write closes the connection, which fails this entry too.
        if self.send_frame(frame).is_err() {
            return;
        }

        if let Some(after) = self.config.request_timeout() {
            let commands = self.commands.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(Command::Expire { id, after }).await;
                }
            });
        }
    }

    /// `exit` consumes an id and is acknowledged without waiting, unless
    /// configured to go out as a plain notification.
    fn exit(&mut self) -> Result<(), BspError> {
        let message = if self.config.exit_as_notification {
            OutboundMessage::Notification(protocol::Notification::new(
                protocol::EXIT,
                protocol::empty_params(),
            ))
        } else {
            self.ensure_open()?;
            let id = self.ids.issue();
            tracing::debug!(%id, "Sending BSP exit; no response will be awaited");
            OutboundMessage::Request(Request::new(id, protocol::EXIT, protocol::empty_params()))
        };
        self.write(message)
    }

    fn write(&mut self, message: OutboundMessage) -> Result<(), BspError> {
        self.ensure_open()?;
        let frame = encode(&message)?;
        tracing::trace!(method = message.method(), "Sending BSP message");
        self.send_frame(frame)
    }

    /// Fail with the close reason, closing first if the writer has already
    /// gone away.
    fn ensure_open(&mut self) -> Result<(), BspError> {
        let writer_gone = self
            .outbound
            .as_ref()
            .is_none_or(mpsc::UnboundedSender::is_closed);
        if self.closed.is_none() && writer_gone {
            self.close("outbound channel closed");
        }
        match &self.closed {
            Some(reason) => Err(BspError::closed(reason.clone())),
            None => Ok(()),
        }
    }

    fn send_frame(&mut self, frame: serde_json::Value) -> Result<(), BspError> {
        let sent = self
            .outbound
            .as_ref()
            .is_some_and(|outbound| outbound.send(frame).is_ok());
        if sent {
            return Ok(());
        }
        let reason = String::from("outbound channel closed");
        self.close(&reason);
        Err(BspError::closed(self.closed.clone().unwrap_or(reason)))
    }

    fn deliver_inbound(&mut self, batch: Vec<serde_json::Value>) {
        for frame in batch {
            match message::classify(frame) {
                Ok(InboundMessage::Response(response)) => self.on_response(response),
                Ok(InboundMessage::Notification(notification)) => {
                    tracing::trace!(method = %notification.method, "Buffered BSP notification");
                    self.notifications.push(notification);
                }
                Ok(InboundMessage::ServerRequest(request)) => {
                    tracing::debug!(
                        id = %request.id,
                        method = %request.method,
                        "Buffered BSP server request"
                    );
                    self.server_requests.push(request);
                }
                Err(e) => {
                    self.malformed_messages += 1;
                    tracing::warn!("Dropping malformed BSP message: {e}");
                }
            }
        }
    }

    fn on_response(&mut self, response: Response) {
        let id = response.id;
        let matched = match id {
            Some(id) => self.pending.resolve(id, response),
            None => false,
        };
        if matched {
            return;
        }
        self.unmatched_responses += 1;
        match id {
            Some(id) => tracing::warn!(%id, "Dropping BSP response with no pending request"),
            None => tracing::warn!("Dropping BSP response without a usable id"),
        }
    }

    fn close(&mut self, reason: &str) {
        if self.closed.is_some() {
            return;
        }
        self.closed = Some(reason.to_string());
        self.outbound = None;
        let failed = self.pending.fail_all(&BspError::closed(reason));
        tracing::info!(reason, failed, "BSP connection closed");
    }

    async fn stop(&mut self, reason: &str) {
        self.close(reason);
        if let Some(transport) = self.transport.take() {
            transport.shutdown().await;
        }
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            next_id: self.ids.peek(),
            pending: self.pending.count(),
            buffered_notifications: self.notifications.len(),
            buffered_server_requests: self.server_requests.len(),
            unmatched_responses: self.unmatched_responses,
            malformed_messages: self.malformed_messages,
            closed: self.closed.is_some(),
        }
    }
}

fn encode(message: &OutboundMessage) -> Result<serde_json::Value, BspError> {
    message.to_frame().map_err(|e| BspError::Serialize {
        method: message.method(),
        message: e.to_string(),
    })
}

fn engine_gone() -> BspError {
    BspError::closed("engine stopped")
}

/// Hand-off point from a transport listener into the engine queue.
///
/// Holds only a weak reference: a sink never keeps an engine alive.
#[derive(Clone)]
pub struct InboundSink {
    commands: mpsc::WeakSender<Command>,
}

impl InboundSink {
    async fn enqueue(&self, command: Command) -> bool {
        match self.commands.upgrade() {
            Some(commands) => commands.send(command).await.is_ok(),
            None => false,
        }
    }

    /// Deliver decoded frames, in arrival order. Returns `false` once the
    /// engine is gone.
    pub async fn deliver_inbound(&self, batch: Vec<serde_json::Value>) -> bool {
        self.enqueue(Command::Inbound(batch)).await
    }

    /// Report that the transport failed or reached EOF. Every pending
    /// request fails with [`BspError::ConnectionClosed`].
    pub async fn close(&self, reason: impl Into<String>) -> bool {
        self.enqueue(Command::TransportClosed {
            reason: reason.into(),
        })
        .await
    }
}

/// The two ends of an engine that has no subprocess attached.
pub struct Detached {
    /// Every frame the engine sends, already JSON-encoded.
    pub outbound: mpsc::UnboundedReceiver<serde_json::Value>,
    /// Feeds decoded inbound frames (or closure) back to the engine.
    pub inbound: InboundSink,
}

/// Handle to a running BSP engine. Cheap to clone; the engine stops when
/// the last handle is dropped or [`stop`](Self::stop) is called.
#[derive(Clone)]
pub struct BspClient {
    commands: mpsc::Sender<Command>,
    config: Arc<ClientConfig>,
}

impl BspClient {
    /// Discover the project's build server and start it.
    ///
    /// Returns `Ok(None)` when the project advertises no build server.
    /// Must be called from within a Tokio runtime.
    pub fn connect(project_root: &Path, config: ClientConfig) -> anyhow::Result<Option<Self>> {
        let Some(descriptor) = discovery::discover(project_root)? else {
            return Ok(None);
        };
        Self::spawn(&descriptor, project_root, config).map(Some)
    }

    /// Start the build server described by `descriptor`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        descriptor: &ConnectionDescriptor,
        project_root: &Path,
        config: ClientConfig,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let sink = InboundSink {
            commands: commands_tx.downgrade(),
        };

        let transport = StdioTransport::spawn(descriptor, project_root, outbound_rx, sink)?;
        tracing::info!(server = %descriptor.name, "BSP server started");

        let engine = Engine::new(
            config.clone(),
            outbound_tx,
            Some(transport),
            commands_tx.downgrade(),
        );
        tokio::spawn(engine.run(commands_rx));
        Ok(Self {
            commands: commands_tx,
            config,
        })
    }

    /// Start an engine without a subprocess, for hosts that bring their own
    /// transport. Must be called from within a Tokio runtime.
    #[must_use]
    pub fn detached(config: ClientConfig) -> (Self, Detached) {
        let config = Arc::new(config);
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let inbound = InboundSink {
            commands: commands_tx.downgrade(),
        };

        let engine = Engine::new(config.clone(), outbound_tx, None, commands_tx.downgrade());
        tokio::spawn(engine.run(commands_rx));
        (
            Self {
                commands: commands_tx,
                config,
            },
            Detached {
                outbound: outbound_rx,
                inbound,
            },
        )
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn request<T>(&self, command: Command, rx: oneshot::Receiver<T>) -> Result<T, BspError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())
    }

    async fn call(
        &self,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<Response, BspError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Call {
                method,
                params,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Send `build/initialize` and wait for the server's response.
    ///
    /// A server-side error comes back as `Ok` with an error outcome.
    pub async fn initialize(&self, root_uri: &str) -> Result<Response, BspError> {
        let params = protocol::initialize_params(&self.config, root_uri);
        self.call(protocol::BUILD_INITIALIZE, params).await
    }

    /// [`initialize`](Self::initialize) with `rootUri` derived from an
    /// absolute project path. A path with no `file:` form fails before
    /// anything is sent.
    pub async fn initialize_root(&self, project_root: &Path) -> Result<Response, BspError> {
        let root_uri = protocol::path_to_file_uri(project_root)?;
        self.initialize(root_uri.as_str()).await
    }

    /// Send the `build/initialized` notification.
    pub async fn initialized(&self, document_uri: &str) -> Result<(), BspError> {
        let (ack, rx) = oneshot::channel();
        self.request(
            Command::Notify {
                method: protocol::BUILD_INITIALIZED,
                params: protocol::initialized_params(document_uri),
                ack: Some(ack),
            },
            rx,
        )
        .await?
    }

    /// Send `shutdown` and wait for the server's response.
    pub async fn shutdown(&self) -> Result<Response, BspError> {
        self.call(protocol::SHUTDOWN, protocol::empty_params()).await
    }

    /// Send `exit`. Returns once the message is queued; no response is
    /// awaited.
    pub async fn exit(&self) -> Result<(), BspError> {
        let (ack, rx) = oneshot::channel();
        self.request(Command::Exit { ack }, rx).await?
    }

    pub async fn show_message<P: Serialize>(&self, params: &P) {
        self.notify_best_effort(protocol::BUILD_SHOW_MESSAGE, params)
            .await;
    }

    pub async fn log_message<P: Serialize>(&self, params: &P) {
        self.notify_best_effort(protocol::BUILD_LOG_MESSAGE, params)
            .await;
    }

    pub async fn publish_diagnostics<P: Serialize>(&self, params: &P) {
        self.notify_best_effort(protocol::BUILD_PUBLISH_DIAGNOSTICS, params)
            .await;
    }

    async fn notify_best_effort<P: Serialize>(&self, method: &'static str, params: &P) {
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!(method, "Failed to serialize notification params: {e}");
                return;
            }
        };
        let command = Command::Notify {
            method,
            params,
            ack: None,
        };
        if self.commands.send(command).await.is_err() {
            tracing::debug!(method, "Engine stopped; notification dropped");
        }
    }

    /// Reply to a request the server initiated, echoing its id.
    pub async fn respond(
        &self,
        request: &ServerRequest,
        outcome: ResponseOutcome,
    ) -> Result<(), BspError> {
        let (ack, rx) = oneshot::channel();
        self.request(
            Command::Respond {
                id: request.id.clone(),
                outcome,
                ack,
            },
            rx,
        )
        .await?
    }

    /// Drain buffered notifications in arrival order.
    pub async fn take_notifications(&self) -> Result<Vec<Notification>, BspError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::TakeNotifications(reply), rx).await
    }

    /// Drain buffered server requests in arrival order.
    pub async fn take_server_requests(&self) -> Result<Vec<ServerRequest>, BspError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::TakeServerRequests(reply), rx).await
    }

    pub async fn stats(&self) -> Result<EngineStats, BspError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Stats(reply), rx).await
    }

    /// Fail all pending requests, tear down the subprocess, and end the
    /// engine. Idempotent.
    pub async fn stop(&self) {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { ack }).await.is_ok() {
            let _ = rx.await;
        }
    }
}
