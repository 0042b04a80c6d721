//! Request/response calls over a single connection.
//!
//! [`Client::spawn`] starts one event-loop task that exclusively owns the
//! [`Connection`], the pending-call slot and the [`ReconnectSupervisor`]. The
//! [`Client`] handle talks to it over a bounded command channel and awaits a
//! oneshot reply, so a call looks like an ordinary blocking request to the
//! caller while the socket stays event-driven underneath.
//!
//! The protocol has no request IDs: the next frame that arrives answers the
//! call in flight. Only one call may be outstanding, enforced by `&mut self` on
//! [`Client::call`] and, inside the loop, by rejecting a second call with
//! [`TransportError::CallInProgress`].

use std::io;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionEvent, ConnectionState, Endpoint, LossReason};
use super::error::TransportError;
use super::framing::{check_len, encode};
use super::supervisor::{ReconnectPolicy, ReconnectSupervisor, SupervisorState, SupervisorStatus};
use crate::models::{Request, Response};

/// Default time to wait for a response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default time allowed for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default time to wait for the server to acknowledge a close.
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Maximum number of queued commands before callers wait.
const COMMAND_BOUND: usize = 64;

/// Events kept for slow subscribers before they start lagging.
const EVENT_BOUND: usize = 64;

/// Resolved settings for a [`Client`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub disconnect_grace: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::tcp("127.0.0.1", 8888),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Notifications for the application (status bars, reconnect banners).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A connection was established, manually or by the supervisor.
    Connected { endpoint: String },
    /// The connection closed, by either side.
    Disconnected { reason: String },
    /// Something went wrong that the user may want to see.
    Error(String),
    /// The supervisor is starting reconnect attempt `attempt`.
    Reconnecting { attempt: u32, max_attempts: u32 },
    /// The supervisor gave up; a manual connect is required.
    ReconnectExhausted { attempts: u32 },
}

enum Command {
    Connect {
        endpoint: Option<Endpoint>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Call {
        frame: Vec<u8>,
        timeout: Duration,
        reply: oneshot::Sender<Result<Value, TransportError>>,
    },
    Status {
        reply: oneshot::Sender<SupervisorStatus>,
    },
}

/// Handle to a connection's event loop.
///
/// Dropping the handle stops the loop, which closes the connection
/// gracefully in the background. Use [`Client::shutdown`] to wait for that.
///
/// # Example
///
/// ```ignore
/// use storelink::transport::{Client, ClientOptions};
/// use serde_json::json;
///
/// let mut client = Client::spawn(ClientOptions::default());
/// client.connect().await?;
/// let reply = client.call(&json!({"action": "getOrders", "userId": 7})).await?;
/// ```
pub struct Client {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    call_timeout: Duration,
    task: Option<JoinHandle<()>>,
}

impl Client {
    /// Start the event loop on the current Tokio runtime.
    ///
    /// Does not connect; call [`connect`](Self::connect) first.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn(options: ClientOptions) -> Self {
        let connection = Connection::new();
        let state = connection.watch_state();
        let (commands, command_rx) = mpsc::channel(COMMAND_BOUND);
        let (events, _) = broadcast::channel(EVENT_BOUND);

        let call_timeout = options.call_timeout;
        let event_loop = EventLoop {
            supervisor: ReconnectSupervisor::new(options.reconnect),
            connection,
            pending: None,
            events: events.clone(),
            options,
        };
        let task = tokio::spawn(event_loop.run(command_rx));

        Self {
            commands,
            state,
            events,
            call_timeout,
            task: Some(task),
        }
    }

    /// Connect to the configured endpoint.
    ///
    /// Resets the reconnect counter whether or not it succeeds. A failure here
    /// is reported but not retried automatically.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.send_connect(None).await
    }

    /// Connect to a different endpoint, closing the current connection first
    /// if it points elsewhere. The new endpoint is used for reconnects.
    pub async fn connect_to(&self, endpoint: Endpoint) -> Result<(), TransportError> {
        self.send_connect(Some(endpoint)).await
    }

    async fn send_connect(&self, endpoint: Option<Endpoint>) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect { endpoint, reply }).await?;
        rx.await.map_err(|_| TransportError::Shutdown)?
    }

    /// Close the connection and cancel any pending reconnect.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Current connection state, as last published by the event loop.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Default timeout applied by [`call`](Self::call) and [`request`](Self::request).
    pub fn set_call_timeout(&mut self, timeout: Duration) {
        self.call_timeout = timeout;
    }

    /// Send a JSON request and wait for the next frame as its response.
    ///
    /// # Errors
    ///
    /// - `NotConnected` immediately if there is no connection
    /// - `TimedOut` if nothing arrived in time (the connection stays open), or
    ///   if the request could not be written in time (the connection is dropped)
    /// - `ConnectionLost` / `WriteFailure` / `FrameTooLarge` if the link failed
    /// - `MalformedResponse` if the response was not JSON
    pub async fn call(&mut self, request: &Value) -> Result<Value, TransportError> {
        self.call_with_timeout(request, self.call_timeout).await
    }

    pub async fn call_with_timeout(
        &mut self,
        request: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let payload = serde_json::to_vec(request).map_err(TransportError::Encode)?;
        check_len(payload.len())?;
        let frame = encode(&payload);

        let (reply, rx) = oneshot::channel();
        self.command(Command::Call {
            frame,
            timeout,
            reply,
        })
        .await?;
        rx.await.map_err(|_| TransportError::Shutdown)?
    }

    /// Send a [`Request`] and always get a [`Response`] back.
    ///
    /// Transport failures become `success: false` responses carrying the
    /// error text, ready to be shown to the user.
    pub async fn request(&mut self, request: &Request) -> Response {
        let value = match serde_json::to_value(request) {
            Ok(value) => value,
            Err(e) => return Response::failure(TransportError::Encode(e).to_string()),
        };

        match self.call(&value).await {
            Ok(reply) => Response::from_value(reply),
            Err(e) => {
                debug!("Request '{}' failed: {}", request.action, e);
                Response::failure(e.to_string())
            }
        }
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Reconnect bookkeeping, for status displays.
    pub async fn status(&self) -> Result<SupervisorStatus, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Status { reply }).await?;
        rx.await.map_err(|_| TransportError::Shutdown)
    }

    /// Stop the event loop and wait for the connection to close.
    pub async fn shutdown(mut self) {
        let task = self.task.take();
        drop(self);
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Transport event loop ended abnormally: {}", e);
            }
        }
    }

    async fn command(&self, command: Command) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::Shutdown)
    }
}

struct PendingCall {
    deadline: Instant,
    timeout: Duration,
    reply: oneshot::Sender<Result<Value, TransportError>>,
}

/// Everything the connection owns, driven from one task.
struct EventLoop {
    options: ClientOptions,
    connection: Connection,
    supervisor: ReconnectSupervisor,
    pending: Option<PendingCall>,
    events: broadcast::Sender<ClientEvent>,
}

impl EventLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let call_deadline = self.pending.as_ref().map(|p| p.deadline);
            let reconnect_at = self.supervisor.deadline();

            // Socket events come first so a response that is ready at the
            // same moment as the deadline still wins.
            tokio::select! {
                biased;
                event = self.connection.next_event() => self.on_event(event),
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                _ = sleep_until(call_deadline.unwrap_or_else(Instant::now)), if call_deadline.is_some() => {
                    self.expire_call().await
                }
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect().await
                }
            }
        }

        debug!("Client handle dropped, closing connection");
        self.connection.disconnect(self.options.disconnect_grace).await;
    }

    fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame(payload) => match self.pending.take() {
                Some(pending) => {
                    let result = serde_json::from_slice::<Value>(&payload).map_err(|e| {
                        warn!("Response is not valid JSON: {}", e);
                        TransportError::MalformedResponse(e.to_string())
                    });
                    if pending.reply.send(result).is_err() {
                        debug!("Caller went away before its response arrived");
                    }
                }
                None => {
                    warn!(
                        "Discarding frame with no request in flight ({} bytes)",
                        payload.len()
                    );
                }
            },
            ConnectionEvent::Lost(reason) => self.on_lost(reason),
        }
    }

    fn on_lost(&mut self, reason: LossReason) {
        warn!("Connection to {} lost: {}", self.options.endpoint, reason);

        // Oversized frames are a protocol error as well as a loss
        if let LossReason::FrameTooLarge(e) = &reason {
            self.emit(ClientEvent::Error(e.to_string()));
        }

        // Fail the call in flight now rather than at its deadline
        if let Some(pending) = self.pending.take() {
            let err = match &reason {
                LossReason::FrameTooLarge(e) => TransportError::FrameTooLarge(*e),
                other => TransportError::ConnectionLost(other.to_string()),
            };
            let _ = pending.reply.send(Err(err));
        }

        self.emit(ClientEvent::Disconnected {
            reason: reason.to_string(),
        });

        if let Some(at) = self.supervisor.on_connection_lost(Instant::now()) {
            info!(
                "Reconnecting to {} in {:?}",
                self.options.endpoint,
                at.saturating_duration_since(Instant::now())
            );
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { endpoint, reply } => {
                let result = self.connect(endpoint).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Call {
                frame,
                timeout,
                reply,
            } => self.start_call(frame, timeout, reply).await,
            Command::Status { reply } => {
                let _ = reply.send(self.supervisor.status());
            }
        }
    }

    async fn connect(&mut self, endpoint: Option<Endpoint>) -> Result<(), TransportError> {
        if let Some(endpoint) = endpoint {
            if endpoint != self.options.endpoint {
                if self.connection.is_connected() {
                    self.disconnect().await;
                }
                self.options.endpoint = endpoint;
            }
        }

        // A manual connect always starts a fresh reconnect budget.
        self.supervisor.reset();

        if self.connection.is_connected() {
            return Ok(());
        }

        match self
            .connection
            .connect(&self.options.endpoint, self.options.connect_timeout)
            .await
        {
            Ok(()) => {
                self.emit(ClientEvent::Connected {
                    endpoint: self.options.endpoint.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                warn!("{}", e);
                self.emit(ClientEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.supervisor.reset();

        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(TransportError::ConnectionLost(
                "disconnected by client".to_string(),
            )));
        }

        if self.connection.is_connected() {
            self.connection
                .disconnect(self.options.disconnect_grace)
                .await;
            info!("Disconnected from {}", self.options.endpoint);
            self.emit(ClientEvent::Disconnected {
                reason: "closed by client".to_string(),
            });
        }
    }

    async fn start_call(
        &mut self,
        frame: Vec<u8>,
        timeout: Duration,
        reply: oneshot::Sender<Result<Value, TransportError>>,
    ) {
        // A caller that dropped its call() future no longer holds the slot
        if self.pending.as_ref().is_some_and(|p| p.reply.is_closed()) {
            debug!("Previous caller abandoned its request, freeing the slot");
            self.pending = None;
        }
        if self.pending.is_some() {
            let _ = reply.send(Err(TransportError::CallInProgress));
            return;
        }
        if !self.connection.is_connected() {
            let _ = reply.send(Err(TransportError::NotConnected));
            return;
        }

        // The timeout covers the write too, so a server that stops reading
        // cannot hold the loop past the deadline.
        let deadline = Instant::now() + timeout;
        match self.connection.send_until(&frame, deadline).await {
            Ok(()) => {
                debug!("Sent request ({} bytes), waiting up to {:?}", frame.len(), timeout);
                self.pending = Some(PendingCall {
                    deadline,
                    timeout,
                    reply,
                });
            }
            Err(TransportError::WriteFailure(e)) => {
                let reason = LossReason::WriteFailed(e.to_string());
                let err = if e.kind() == io::ErrorKind::TimedOut {
                    TransportError::TimedOut(timeout)
                } else {
                    TransportError::WriteFailure(e)
                };
                let _ = reply.send(Err(err));
                self.on_lost(reason);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn expire_call(&mut self) {
        // Last look at the socket before giving up on the response.
        if let Some(event) = self.connection.poll_ready_event().await {
            self.on_event(event);
        }

        if let Some(pending) = self.pending.take() {
            debug!("No response within {:?}", pending.timeout);
            let _ = pending.reply.send(Err(TransportError::TimedOut(pending.timeout)));
        }
    }

    async fn reconnect(&mut self) {
        let attempt = self.supervisor.begin_attempt();
        let max_attempts = self.supervisor.policy().max_attempts;
        info!(
            "Reconnect attempt {}/{} to {}",
            attempt, max_attempts, self.options.endpoint
        );
        self.emit(ClientEvent::Reconnecting {
            attempt,
            max_attempts,
        });

        match self
            .connection
            .connect(&self.options.endpoint, self.options.connect_timeout)
            .await
        {
            Ok(()) => {
                self.supervisor.attempt_succeeded();
                self.emit(ClientEvent::Connected {
                    endpoint: self.options.endpoint.to_string(),
                });
            }
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                if self.supervisor.attempt_failed(Instant::now()) == SupervisorState::Exhausted {
                    self.emit(ClientEvent::ReconnectExhausted {
                        attempts: self.supervisor.attempts(),
                    });
                }
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
