//! Default hub transport: the JSON hub protocol over WebSocket.
//!
//! [`WsConnectionFactory`] builds [`WsHubConnection`]s. Each started
//! connection owns one background task that holds the socket, answers
//! pings, routes completions to waiting callers, dispatches push events to
//! the handler registry, and reconnects when the socket is lost.
//!
//! # Architecture
//!
//! ```text
//!   WsHubConnection                     background task
//!         │                                    │
//!         │  invoke(name, args) ── mpsc ──►    │  id → pending completion
//!         │  ◄── oneshot(result) ──────────    │
//!         │                                    │
//!         │  on/off ──► HandlerRegistry ◄───── │  Invocation records
//!         │                                    │
//!         │  watch_state() ◄── watch ───────── │  Connected / Reconnecting / Disconnected
//!         ▼                                    ▼
//!   negotiate (HTTP) ──► WebSocket ──► handshake ──► message loop
//! ```
//!
//! Handlers live in the registry rather than the socket, so they survive
//! reconnects without re-registration.

// Rust guideline compliant 2026-02

pub(crate) mod negotiate;
pub(crate) mod protocol;
pub(crate) mod socket;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use self::protocol::{HubMessage, RecordBuffer};
use self::socket::{strip_query, Frame, SocketReader, SocketWriter};
use crate::config::ConnectionOptions;
use crate::connection::{
    ConnectionFactory, ConnectionState, HandlerRegistry, HubConnection, RawHandler,
};
use crate::error::HubError;

/// Factory for WebSocket hub connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnectionFactory;

impl ConnectionFactory for WsConnectionFactory {
    fn build(
        &self,
        options: &ConnectionOptions,
        auto_reconnect: bool,
    ) -> Result<Arc<dyn HubConnection>, HubError> {
        if options.endpoint.trim().is_empty() {
            return Err(HubError::Transport("hub endpoint is not configured".into()));
        }
        Ok(Arc::new(WsHubConnection::new(options.clone(), auto_reconnect)))
    }
}

/// Outgoing invocation waiting to be written.
#[derive(Debug)]
struct InvokeRequest {
    target: String,
    arguments: Vec<Value>,
    reply: oneshot::Sender<Result<Value, HubError>>,
}

type PendingCalls = HashMap<String, oneshot::Sender<Result<Value, HubError>>>;

/// Handles to the background task of a started connection.
#[derive(Debug)]
struct Running {
    commands: mpsc::UnboundedSender<InvokeRequest>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Hub connection over WebSocket.
#[derive(Debug)]
pub struct WsHubConnection {
    options: ConnectionOptions,
    auto_reconnect: bool,
    handlers: Arc<HandlerRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
    running: Mutex<Option<Running>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WsHubConnection {
    /// Create an unstarted connection.
    #[must_use]
    pub fn new(options: ConnectionOptions, auto_reconnect: bool) -> Self {
        Self {
            options,
            auto_reconnect,
            handlers: Arc::new(HandlerRegistry::new()),
            state: Arc::new(watch::channel(ConnectionState::Disconnected).0),
            running: Mutex::new(None),
        }
    }

    /// Options this connection was built with.
    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}

#[async_trait]
impl HubConnection for WsHubConnection {
    async fn start(&self) -> Result<(), HubError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(HubError::Transport(format!(
                "cannot start a connection in state {:?}",
                *self.state.borrow()
            )));
        }

        // A previous run may have given up on its own; its task is finished.
        let stale = lock(&self.running).take();
        if let Some(stale) = stale {
            stale.shutdown.cancel();
        }

        log::info!(
            "[HubSocket] Connecting to {}",
            strip_query(&self.options.endpoint)
        );
        let session = match open_session(&self.options).await {
            Ok(session) => session,
            Err(e) => {
                log::warn!("[HubSocket] Connect failed: {:#}", e);
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(HubError::transport(&e));
            }
        };

        let (commands, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let driver = Driver {
            options: self.options.clone(),
            auto_reconnect: self.auto_reconnect,
            handlers: Arc::clone(&self.handlers),
            state: Arc::clone(&self.state),
            shutdown: shutdown.clone(),
        };

        self.state.send_replace(ConnectionState::Connected);
        log::info!("[HubSocket] Connected");
        let task = tokio::spawn(driver.run(session, command_rx));

        *lock(&self.running) = Some(Running {
            commands,
            shutdown,
            task,
        });
        Ok(())
    }

    async fn stop(&self) {
        let running = lock(&self.running).take();
        if let Some(running) = running {
            running.shutdown.cancel();
            drop(running.commands);
            if let Err(e) = running.task.await {
                log::warn!("[HubSocket] Connection task ended abnormally: {}", e);
            }
            log::info!("[HubSocket] Stopped");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError> {
        let commands = lock(&self.running)
            .as_ref()
            .map(|running| running.commands.clone())
            .ok_or_else(|| HubError::Transport("connection is not started".into()))?;

        let (reply, response) = oneshot::channel();
        commands
            .send(InvokeRequest {
                target: method.to_string(),
                arguments: args,
                reply,
            })
            .map_err(|err| HubError::Transport(format!("connection closed: {err}")))?;

        match response.await {
            Ok(outcome) => outcome,
            Err(err) => Err(HubError::Transport(format!(
                "connection closed before '{method}' completed: {err}"
            ))),
        }
    }

    fn on(&self, method: &str, handler: RawHandler) {
        self.handlers.add(method, handler);
    }

    fn off(&self, method: &str, handler: Option<&RawHandler>) {
        self.handlers.remove(method, handler);
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

impl Drop for WsHubConnection {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).take() {
            running.shutdown.cancel();
        }
    }
}

/// An open, handshaken socket.
#[derive(Debug)]
struct Session {
    writer: SocketWriter,
    reader: SocketReader,
    buffer: RecordBuffer,
}

/// Result of the inner message loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// Shutdown was requested.
    Shutdown,
    /// The socket was lost; `reconnect` is false when the server forbade it.
    Lost { reconnect: bool },
}

/// Result of a reconnect cycle.
#[derive(Debug)]
enum Reconnect {
    Restored(Session),
    GaveUp,
    Shutdown,
}

/// State owned by the background task.
#[derive(Debug)]
struct Driver {
    options: ConnectionOptions,
    auto_reconnect: bool,
    handlers: Arc<HandlerRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: CancellationToken,
}

impl Driver {
    /// Connection loop: run sessions until shutdown or reconnection gives up.
    async fn run(self, mut session: Session, mut commands: mpsc::UnboundedReceiver<InvokeRequest>) {
        let mut next_id: u64 = 0;

        loop {
            let exit = self
                .run_message_loop(&mut session, &mut commands, &mut next_id)
                .await;

            if exit == LoopExit::Shutdown {
                // Best effort: the peer may already be gone.
                let _ = session.writer.send_text(&protocol::close()).await;
                let _ = session.writer.close().await;
                return;
            }

            if exit == (LoopExit::Lost { reconnect: false }) || !self.auto_reconnect {
                log::info!("[HubSocket] Connection closed, not reconnecting");
                self.state.send_replace(ConnectionState::Disconnected);
                return;
            }

            match self.reconnect(&mut commands).await {
                Reconnect::Restored(restored) => {
                    session = restored;
                    self.state.send_replace(ConnectionState::Connected);
                    log::info!("[HubSocket] Reconnected");
                }
                Reconnect::GaveUp => {
                    log::warn!("[HubSocket] Reconnection gave up");
                    self.state.send_replace(ConnectionState::Disconnected);
                    return;
                }
                Reconnect::Shutdown => return,
            }
        }
    }

    /// Run one session; every call still pending when it ends fails.
    async fn run_message_loop(
        &self,
        session: &mut Session,
        commands: &mut mpsc::UnboundedReceiver<InvokeRequest>,
        next_id: &mut u64,
    ) -> LoopExit {
        let mut pending = PendingCalls::new();
        let exit = self
            .drive_session(session, commands, next_id, &mut pending)
            .await;

        if !pending.is_empty() {
            log::debug!(
                "[HubSocket] Failing {} pending call(s) after disconnect",
                pending.len()
            );
        }
        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(HubError::Transport(
                "connection lost before the call completed".into(),
            )));
        }
        exit
    }

    async fn drive_session(
        &self,
        session: &mut Session,
        commands: &mut mpsc::UnboundedReceiver<InvokeRequest>,
        next_id: &mut u64,
        pending: &mut PendingCalls,
    ) -> LoopExit {
        // Records that arrived in the same frame as the handshake response.
        while let Some(record) = session.buffer.next_record() {
            if let Some(exit) = self.handle_record(&record, pending) {
                return exit;
            }
        }

        let keep_alive_interval = self.options.keep_alive_interval();
        let mut keep_alive = tokio::time::interval_at(
            tokio::time::Instant::now() + keep_alive_interval,
            keep_alive_interval,
        );
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let server_timeout = self.options.server_timeout();
        let silence = tokio::time::sleep(server_timeout);
        tokio::pin!(silence);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    return LoopExit::Shutdown;
                }

                () = &mut silence => {
                    log::warn!(
                        "[HubSocket] Nothing received for {}ms, dropping connection",
                        server_timeout.as_millis()
                    );
                    return LoopExit::Lost { reconnect: true };
                }

                frame = session.reader.recv() => {
                    silence.as_mut().reset(tokio::time::Instant::now() + server_timeout);
                    match frame {
                        Some(Ok(Frame::Text(text))) => {
                            session.buffer.push(&text);
                            while let Some(record) = session.buffer.next_record() {
                                if let Some(exit) = self.handle_record(&record, pending) {
                                    return exit;
                                }
                            }
                        }
                        Some(Ok(Frame::Ping(data))) => {
                            let _ = session.writer.send_pong(data).await;
                        }
                        Some(Ok(Frame::Close { code, reason })) => {
                            log::info!("[HubSocket] Socket closed by server ({}: {})", code, reason);
                            return LoopExit::Lost { reconnect: true };
                        }
                        Some(Err(e)) => {
                            log::warn!("[HubSocket] {:#}", e);
                            return LoopExit::Lost { reconnect: true };
                        }
                        None => {
                            log::info!("[HubSocket] Socket stream ended");
                            return LoopExit::Lost { reconnect: true };
                        }
                    }
                }

                Some(request) = commands.recv() => {
                    let id = next_id.to_string();
                    *next_id += 1;

                    log::debug!("[HubSocket] Invoking '{}' (id {})", request.target, id);
                    let record = protocol::invocation(&id, &request.target, &request.arguments);
                    if let Err(e) = session.writer.send_text(&record).await {
                        log::warn!("[HubSocket] Failed to send '{}': {:#}", request.target, e);
                        let _ = request.reply.send(Err(HubError::transport(&e)));
                        return LoopExit::Lost { reconnect: true };
                    }
                    pending.insert(id, request.reply);
                }

                _ = keep_alive.tick() => {
                    if let Err(e) = session.writer.send_text(&protocol::ping()).await {
                        log::warn!("[HubSocket] Keep-alive failed: {:#}", e);
                        return LoopExit::Lost { reconnect: true };
                    }
                    log::trace!("[HubSocket] Sent keep-alive");
                }
            }
        }
    }

    /// Handle one record. Returns `Some` when the session must end.
    fn handle_record(&self, record: &str, pending: &mut PendingCalls) -> Option<LoopExit> {
        log::trace!("[HubSocket] <- {}", record);

        let message = match protocol::parse_message(record) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[HubSocket] Dropping malformed record: {:#}", e);
                return None;
            }
        };

        match message {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                if invocation_id.is_some() {
                    log::warn!(
                        "[HubSocket] Server expects a result for '{}'; client results are not supported",
                        target
                    );
                }
                self.handlers.dispatch(&target, &arguments);
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => match pending.remove(&invocation_id) {
                Some(reply) => {
                    let outcome = match error {
                        Some(message) => Err(HubError::RemoteInvocation(message)),
                        None => Ok(result),
                    };
                    let _ = reply.send(outcome);
                }
                None => {
                    log::warn!(
                        "[HubSocket] Completion for unknown invocation {}",
                        invocation_id
                    );
                }
            },
            HubMessage::Ping => {}
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                match error {
                    Some(error) => log::warn!("[HubSocket] Server closed the connection: {}", error),
                    None => log::info!("[HubSocket] Server closed the connection"),
                }
                return Some(LoopExit::Lost {
                    reconnect: allow_reconnect,
                });
            }
            HubMessage::Unsupported(kind) => {
                log::debug!("[HubSocket] Ignoring message type {}", kind);
            }
        }
        None
    }

    /// Retry the connection over the configured delays.
    ///
    /// Calls issued while waiting fail immediately.
    async fn reconnect(&self, commands: &mut mpsc::UnboundedReceiver<InvokeRequest>) -> Reconnect {
        for (index, delay) in self.options.reconnect_delays().into_iter().enumerate() {
            let attempt = u32::try_from(index + 1).unwrap_or(u32::MAX);
            self.state
                .send_replace(ConnectionState::Reconnecting { attempt });
            log::info!(
                "[HubSocket] Reconnect attempt {} in {}ms",
                attempt,
                delay.as_millis()
            );

            let try_connect = async {
                tokio::time::sleep(delay).await;
                open_session(&self.options).await
            };

            tokio::select! {
                () = self.shutdown.cancelled() => return Reconnect::Shutdown,
                () = reject_commands(commands, attempt) => return Reconnect::Shutdown,
                outcome = try_connect => match outcome {
                    Ok(session) => return Reconnect::Restored(session),
                    Err(e) => log::warn!("[HubSocket] Reconnect attempt {} failed: {:#}", attempt, e),
                },
            }
        }
        Reconnect::GaveUp
    }
}

/// Fail every call issued while reconnecting. Completes only when the owning
/// connection is gone.
async fn reject_commands(commands: &mut mpsc::UnboundedReceiver<InvokeRequest>, attempt: u32) {
    while let Some(request) = commands.recv().await {
        let _ = request.reply.send(Err(HubError::Transport(format!(
            "connection is reconnecting (attempt {attempt})"
        ))));
    }
}

/// Negotiate (unless skipped), open the socket and complete the handshake.
async fn open_session(options: &ConnectionOptions) -> Result<Session> {
    let token = options.resolve_access_token();
    let (endpoint, connection_token, token) = if options.skip_negotiation {
        (options.endpoint.clone(), None, token)
    } else {
        let negotiated = negotiate::negotiate(options, token).await?;
        (
            negotiated.endpoint,
            negotiated.connection_token,
            negotiated.access_token,
        )
    };

    let url = connect_url(&endpoint, connection_token.as_deref(), token.as_deref())?;

    let mut headers: Vec<(String, String)> = options
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    if let Some(token) = &token {
        headers.push(("Authorization".to_string(), format!("Bearer {token}")));
    }

    log::debug!("[HubSocket] Opening {}", strip_query(&url));
    let (mut writer, mut reader) = socket::open(&url, &headers).await?;

    let buffer = tokio::time::timeout(
        options.handshake_timeout(),
        handshake(&mut writer, &mut reader),
    )
    .await
    .context("handshake timed out")??;

    Ok(Session {
        writer,
        reader,
        buffer,
    })
}

/// Send the handshake request and wait for the response record.
///
/// Returns the buffer holding any records that followed the response.
async fn handshake(writer: &mut SocketWriter, reader: &mut SocketReader) -> Result<RecordBuffer> {
    writer.send_text(&protocol::handshake_request()).await?;

    let mut buffer = RecordBuffer::default();
    loop {
        match reader.recv().await {
            Some(Ok(Frame::Text(text))) => {
                buffer.push(&text);
                if let Some(record) = buffer.next_record() {
                    protocol::parse_handshake_response(&record)?;
                    log::debug!("[HubSocket] Handshake complete");
                    return Ok(buffer);
                }
            }
            Some(Ok(Frame::Ping(data))) => writer.send_pong(data).await?,
            Some(Ok(Frame::Close { code, reason })) => {
                bail!("socket closed during handshake ({code}: {reason})")
            }
            Some(Err(e)) => return Err(e.context("handshake failed")),
            None => bail!("socket closed during handshake"),
        }
    }
}

/// WebSocket URL for `endpoint` with `id` and `access_token` query parameters.
fn connect_url(
    endpoint: &str,
    connection_token: Option<&str>,
    access_token: Option<&str>,
) -> Result<String> {
    let mut url = Url::parse(&socket::http_to_ws_scheme(endpoint))
        .with_context(|| format!("invalid hub endpoint: {endpoint}"))?;

    if connection_token.is_some() || access_token.is_some() {
        let mut query = url.query_pairs_mut();
        if let Some(id) = connection_token {
            query.append_pair("id", id);
        }
        if let Some(token) = access_token {
            query.append_pair("access_token", token);
        }
    }
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_url_without_params() {
        assert_eq!(
            connect_url("http://localhost:5000/chat", None, None).unwrap(),
            "ws://localhost:5000/chat"
        );
    }

    #[test]
    fn test_connect_url_appends_id_and_token() {
        assert_eq!(
            connect_url("https://example.com/chat?tenant=a", Some("c t"), Some("tok")).unwrap(),
            "wss://example.com/chat?tenant=a&id=c+t&access_token=tok"
        );
    }

    #[test]
    fn test_factory_rejects_empty_endpoint() {
        let err = WsConnectionFactory
            .build(&ConnectionOptions::default(), true)
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_invoke_before_start_fails() {
        let connection = WsHubConnection::new(ConnectionOptions::new("ws://127.0.0.1:1/hub"), false);
        let err = connection.invoke("ping", vec![]).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_start_returns_to_disconnected() {
        let options = ConnectionOptions::new("ws://127.0.0.1:1/hub").with_skip_negotiation(true);
        let connection = WsHubConnection::new(options, true);

        let err = connection.start().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handlers_registered_before_start() {
        let connection = WsHubConnection::new(ConnectionOptions::new("ws://h/hub"), true);
        let handler: RawHandler = Arc::new(|_args: &[Value]| {});
        connection.on("Tick", Arc::clone(&handler));
        assert_eq!(connection.handlers.count("tick"), 1);
        connection.off("TICK", Some(&handler));
        assert_eq!(connection.handlers.count("tick"), 0);
    }
}
