//! Resilient, authenticated WebSocket session.
//!
//! A [`WsSession`] owns one live socket at a time and keeps a logical
//! connection alive across network failures and token expiries: a single
//! reader task reconnects with the [`ReconnectSchedule`] ladder, rebuilds
//! the handshake with a fresh bearer token on every attempt, and watches
//! inbound traffic for the in-band 401 envelope that signals an expired
//! token. Protocol layers plug in via [`SessionHandler`].
//!
//! Control flow between a single connection and the outer reconnect loop is
//! an explicit [`ConnectionExit`] value — errors are never used to steer the
//! loop.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use gw_auth::{TokenProvider, WsEndpoint};
use gw_protocol::ErrorEnvelope;

use crate::backoff::ReconnectSchedule;
use crate::error::SessionError;

type WsSink =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Bound on consecutive transient `send` failures before the session either
/// forces a reconnect (auto-reconnect on) or gives up.
const MAX_SEND_RETRIES: u32 = 3;

/// Lifecycle of the reader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStatus {
    Idle,
    Starting,
    /// Socket is open but no message has been accepted yet; a 401 in this
    /// state means the token was never valid.
    CheckingToken,
    Running,
    Restarting,
    Exiting,
    ExitingError,
}

/// How a single connection ended.
enum ConnectionExit {
    /// Transient end: reconnect after backoff.
    Reconnect,
    /// Intentional local stop.
    Closed,
    /// Unrecoverable: store the error and exit the reader.
    Fatal(SessionError),
}

/// Protocol-layer hooks, driven by the reader task.
///
/// `on_message` sees messages in socket arrival order. An `Err` from
/// `on_open` or `on_message` is fatal to the session: the error is stored
/// and re-raised when the session is stopped or joined.
#[async_trait::async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_open(&self, session: &SessionHandle) -> Result<(), SessionError> {
        let _ = session;
        Ok(())
    }

    async fn on_message(&self, session: &SessionHandle, text: &str) -> Result<(), SessionError>;

    async fn on_close(&self, session: &SessionHandle) {
        let _ = session;
    }

    async fn on_error(&self, session: &SessionHandle, error: &SessionError) {
        let _ = (session, error);
    }
}

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name of the WebSocket API at the gateway (`"action-ws"`,
    /// `"events-ws"`); resolved to an endpoint via the token provider.
    pub api_name: String,
    /// How long `start()` waits for the first open before failing.
    pub startup_timeout: std::time::Duration,
    /// When `send` exhausts its retries: force an internal reconnect and
    /// keep retrying (true, default), or surface the error (false).
    pub auto_reconnect: bool,
}

impl SessionConfig {
    pub fn new(api_name: impl Into<String>) -> Self {
        Self {
            api_name: api_name.into(),
            startup_timeout: std::time::Duration::from_secs(5),
            auto_reconnect: true,
        }
    }

    pub fn startup_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }
}

struct Shared {
    provider: Arc<dyn TokenProvider>,
    endpoint: WsEndpoint,
    config: SessionConfig,
    status_tx: watch::Sender<ReaderStatus>,
    /// Write half of the current socket; replaced wholesale on reconnect.
    sink: tokio::sync::Mutex<Option<WsSink>>,
    /// Serializes `send` callers without blocking the read path.
    send_lock: tokio::sync::Mutex<()>,
    last_error: parking_lot::Mutex<Option<SessionError>>,
    cancel: parking_lot::Mutex<CancellationToken>,
}

impl Shared {
    fn status(&self) -> ReaderStatus {
        *self.status_tx.borrow()
    }

    fn set_status(&self, status: ReaderStatus) {
        self.status_tx.send_replace(status);
    }

    fn store_error(&self, error: SessionError) {
        *self.last_error.lock() = Some(error);
    }
}

/// Cheap cloneable handle for sending over the session. Handed to
/// [`SessionHandler`] hooks and available via [`WsSession::handle`].
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Current reader status.
    pub fn status(&self) -> ReaderStatus {
        self.shared.status()
    }

    /// Send a text message, serialized against concurrent senders.
    ///
    /// Transient failures are retried up to [`MAX_SEND_RETRIES`] times with
    /// backoff; past that the session either forces a reconnect and keeps
    /// retrying (auto-reconnect, default) or returns
    /// [`SessionError::SendRetriesExhausted`].
    ///
    /// # Errors
    ///
    /// Returns an error when the session is not running, or when retries are
    /// exhausted with auto-reconnect disabled.
    pub async fn send(&self, text: &str) -> Result<(), SessionError> {
        let _guard = self.shared.send_lock.lock().await;
        tracing::debug!(len = text.len(), "sending message");

        let mut retries: u32 = 0;
        let mut schedule = ReconnectSchedule::new();

        loop {
            schedule.wait().await;

            match self.shared.status() {
                ReaderStatus::Running | ReaderStatus::CheckingToken => {
                    let mut sink = self.shared.sink.lock().await;
                    if let Some(sink) = sink.as_mut() {
                        match sink.send(Message::Text(text.to_owned())).await {
                            Ok(()) => return Ok(()),
                            Err(e) => {
                                tracing::warn!(error = %e, "send failed, retrying");
                            }
                        }
                    }
                }
                ReaderStatus::Idle | ReaderStatus::Exiting | ReaderStatus::ExitingError => {
                    return Err(SessionError::NotRunning);
                }
                // Starting/Restarting: the reader is between connections.
                _ => {}
            }

            retries += 1;
            if retries > MAX_SEND_RETRIES {
                if self.shared.config.auto_reconnect {
                    tracing::warn!("send retries exhausted, forcing reconnect");
                    self.request_reconnect().await;
                    retries = 0;
                    schedule.reset();
                } else {
                    return Err(SessionError::SendRetriesExhausted);
                }
            }
        }
    }

    /// Single-attempt send for hooks running on the reader task itself.
    /// [`send`](Self::send) waits for a reconnect on failure, and the
    /// reader is the task that drives reconnects, so a retrying send from
    /// a hook would wait on itself. Callers treat a failure as the socket
    /// going away.
    pub(crate) async fn reply(&self, text: &str) -> Result<(), SessionError> {
        let _guard = self.shared.send_lock.lock().await;
        let mut sink = self.shared.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink
                .send(Message::Text(text.to_owned()))
                .await
                .map_err(|e| SessionError::WebSocket(e.to_string())),
            None => Err(SessionError::NotRunning),
        }
    }

    /// Close the current socket so the reader loop opens a fresh one.
    pub(crate) async fn request_reconnect(&self) {
        self.shared.set_status(ReaderStatus::Restarting);
        if let Some(mut sink) = self.shared.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
    }
}

/// Owns the reader task for one logical gateway connection.
pub struct WsSession {
    shared: Arc<Shared>,
    handler: Arc<dyn SessionHandler>,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsSession {
    /// Resolve the endpoint for `config.api_name` and build the session.
    /// No connection is made until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns an error when the provider knows no endpoint for the API.
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        config: SessionConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, SessionError> {
        let endpoint = provider.websocket_endpoint(&config.api_name)?;
        let (status_tx, _) = watch::channel(ReaderStatus::Idle);

        Ok(Self {
            shared: Arc::new(Shared {
                provider,
                endpoint,
                config,
                status_tx,
                sink: tokio::sync::Mutex::new(None),
                send_lock: tokio::sync::Mutex::new(()),
                last_error: parking_lot::Mutex::new(None),
                cancel: parking_lot::Mutex::new(CancellationToken::new()),
            }),
            handler,
            task: tokio::sync::Mutex::new(None),
        })
    }

    /// A cloneable sending handle.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Launch the reader task and wait until the first socket open (or a
    /// startup failure). A no-op when the session is already running.
    ///
    /// # Errors
    ///
    /// Returns an error when the very first connection attempt fails or the
    /// startup timeout elapses.
    pub async fn start(&self) -> Result<(), SessionError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        *self.shared.last_error.lock() = None;
        let cancel = CancellationToken::new();
        *self.shared.cancel.lock() = cancel.clone();
        self.shared.set_status(ReaderStatus::Starting);

        let mut status_rx = self.shared.status_tx.subscribe();
        let shared = Arc::clone(&self.shared);
        let handler = Arc::clone(&self.handler);
        *task = Some(tokio::spawn(run_reader(shared, handler, cancel)));
        drop(task);

        let opened = status_rx.wait_for(|s| {
            matches!(
                s,
                ReaderStatus::CheckingToken | ReaderStatus::Running | ReaderStatus::Idle
            )
        });

        let status = match tokio::time::timeout(self.shared.config.startup_timeout, opened).await
        {
            Ok(Ok(guard)) => *guard,
            Ok(Err(_)) => return Err(SessionError::Startup("reader task vanished".to_owned())),
            Err(_) => {
                return Err(SessionError::Startup(format!(
                    "no connection within {:?}",
                    self.shared.config.startup_timeout
                )))
            }
        };

        if status == ReaderStatus::Idle {
            // Reader already exited; surface its stored error.
            return match self.join().await {
                Ok(()) => Err(SessionError::Startup(
                    "reader exited before the socket opened".to_owned(),
                )),
                Err(e) => Err(e),
            };
        }
        Ok(())
    }

    /// Intentionally close the session and join the reader task.
    ///
    /// # Errors
    ///
    /// Re-raises any error the reader task stored while running.
    pub async fn stop(&self) -> Result<(), SessionError> {
        if self.task.lock().await.is_none() {
            return Ok(());
        }

        self.shared.set_status(ReaderStatus::Exiting);
        self.shared.cancel.lock().cancel();
        if let Some(mut sink) = self.shared.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        self.join().await
    }

    /// Stop, then start a fresh connection.
    ///
    /// # Errors
    ///
    /// Propagates errors from either phase.
    pub async fn restart(&self) -> Result<(), SessionError> {
        self.stop().await?;
        self.start().await
    }

    /// Wait for the reader task to finish and surface its stored error.
    ///
    /// # Errors
    ///
    /// Returns the error stored by the reader task, when there is one.
    pub async fn join(&self) -> Result<(), SessionError> {
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        match self.shared.last_error.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// ── Reader task ──────────────────────────────────────────────────────

async fn run_reader(
    shared: Arc<Shared>,
    handler: Arc<dyn SessionHandler>,
    cancel: CancellationToken,
) {
    let handle = SessionHandle {
        shared: Arc::clone(&shared),
    };
    let mut schedule = ReconnectSchedule::new();
    let mut ever_connected = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = schedule.wait() => {}
            _ = cancel.cancelled() => break,
        }

        shared.set_status(ReaderStatus::Starting);
        let exit = run_connection(
            &shared,
            &handler,
            &handle,
            &cancel,
            &mut schedule,
            &mut ever_connected,
        )
        .await;

        match exit {
            ConnectionExit::Reconnect => {
                tracing::info!(
                    delay_secs = schedule.current().as_secs(),
                    "connection ended, reconnecting"
                );
            }
            ConnectionExit::Closed => break,
            ConnectionExit::Fatal(error) => {
                tracing::error!(error = %error, "session failed");
                shared.set_status(ReaderStatus::ExitingError);
                handler.on_error(&handle, &error).await;
                shared.store_error(error);
                break;
            }
        }
    }

    *shared.sink.lock().await = None;
    shared.set_status(ReaderStatus::Idle);
}

/// One connection lifecycle: handshake with a fresh token, then pump the
/// socket until it ends.
async fn run_connection(
    shared: &Arc<Shared>,
    handler: &Arc<dyn SessionHandler>,
    handle: &SessionHandle,
    cancel: &CancellationToken,
    schedule: &mut ReconnectSchedule,
    ever_connected: &mut bool,
) -> ConnectionExit {
    // Re-fetch the token on every attempt so a refreshed token is picked up.
    let token = match shared.provider.token().await {
        Ok(token) => token,
        Err(e) => return ConnectionExit::Fatal(e.into()),
    };

    let request = match build_request(&shared.endpoint, &token) {
        Ok(request) => request,
        Err(e) => return ConnectionExit::Fatal(e),
    };

    tracing::debug!(url = %shared.endpoint.url, "connecting");
    let connected = tokio::select! {
        r = tokio_tungstenite::connect_async(request) => r,
        _ = cancel.cancelled() => return ConnectionExit::Closed,
    };
    let (ws, _response) = match connected {
        Ok(ok) => ok,
        Err(e) if *ever_connected && shared.config.auto_reconnect => {
            tracing::warn!(error = %e, "connect failed");
            return ConnectionExit::Reconnect;
        }
        Err(e) => return ConnectionExit::Fatal(SessionError::WebSocket(e.to_string())),
    };
    *ever_connected = true;

    let (sink, stream) = ws.split();
    *shared.sink.lock().await = Some(sink);
    shared.set_status(ReaderStatus::CheckingToken);

    let exit = if let Err(e) = handler.on_open(handle).await {
        ConnectionExit::Fatal(e)
    } else {
        pump_messages(shared, handler, handle, cancel, schedule, stream).await
    };

    if let Some(mut sink) = shared.sink.lock().await.take() {
        let _ = sink.close().await;
    }
    handler.on_close(handle).await;
    exit
}

/// Read messages until the connection ends, intercepting in-band auth
/// errors before anything reaches the protocol layer.
async fn pump_messages(
    shared: &Arc<Shared>,
    handler: &Arc<dyn SessionHandler>,
    handle: &SessionHandle,
    cancel: &CancellationToken,
    schedule: &mut ReconnectSchedule,
    mut stream: WsStream,
) -> ConnectionExit {
    loop {
        let message = tokio::select! {
            m = stream.next() => m,
            _ = cancel.cancelled() => return ConnectionExit::Closed,
        };

        match message {
            None => {
                tracing::debug!("socket stream ended");
                return drop_exit(shared, cancel);
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "socket error");
                return drop_exit(shared, cancel);
            }
            Some(Ok(Message::Text(text))) => {
                if let Some(exit) = check_message(shared, handler, handle, schedule, &text).await {
                    return exit;
                }
            }
            Some(Ok(Message::Ping(payload))) => {
                let mut sink = shared.sink.lock().await;
                if let Some(sink) = sink.as_mut() {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                if !cancel.is_cancelled() {
                    tracing::debug!(?frame, "received close from remote");
                    shared.set_status(ReaderStatus::Restarting);
                }
                return drop_exit(shared, cancel);
            }
            Some(Ok(_)) => {} // binary/pong frames carry nothing for us
        }
    }
}

/// Exit value for a dropped or remotely closed connection.
fn drop_exit(shared: &Shared, cancel: &CancellationToken) -> ConnectionExit {
    if cancel.is_cancelled() {
        ConnectionExit::Closed
    } else if shared.config.auto_reconnect {
        ConnectionExit::Reconnect
    } else {
        ConnectionExit::Fatal(SessionError::WebSocket(
            "connection dropped and auto-reconnect is disabled".to_owned(),
        ))
    }
}

/// Inspect one inbound text message. Returns `Some(exit)` when the
/// connection must end, `None` to keep pumping.
async fn check_message(
    shared: &Arc<Shared>,
    handler: &Arc<dyn SessionHandler>,
    handle: &SessionHandle,
    schedule: &mut ReconnectSchedule,
    text: &str,
) -> Option<ConnectionExit> {
    if let Some(error) = ErrorEnvelope::parse(text) {
        if error.code == 401 {
            if shared.status() == ReaderStatus::CheckingToken {
                // The token never worked on this connection; refreshing
                // in a loop would never terminate.
                return Some(ConnectionExit::Fatal(SessionError::TokenNeverValid(
                    error.message,
                )));
            }
            tracing::info!(error = %error, "token rejected, refreshing");
            if let Err(e) = shared.provider.refresh().await {
                return Some(ConnectionExit::Fatal(e.into()));
            }
            schedule.reset();
            shared.set_status(ReaderStatus::Restarting);
            return Some(ConnectionExit::Reconnect);
        }
        tracing::warn!(error = %error, "received error envelope");
    }

    // Accepting any message proves the connection (and the token) healthy.
    shared.set_status(ReaderStatus::Running);
    schedule.reset();

    if let Err(e) = handler.on_message(handle, text).await {
        return Some(ConnectionExit::Fatal(e));
    }
    None
}

fn build_request(
    endpoint: &WsEndpoint,
    token: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, SessionError> {
    let mut request = endpoint
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| SessionError::WebSocket(e.to_string()))?;

    let protocols = format!("{}, token-{}", endpoint.protocol, token);
    let value = HeaderValue::from_str(&protocols)
        .map_err(|e| SessionError::WebSocket(format!("invalid protocol header: {e}")))?;
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_carries_protocol_and_token() {
        let endpoint = WsEndpoint::new("ws://localhost:8080/api/action/1.0", "action-1.0");
        let request = build_request(&endpoint, "tok-abc").unwrap();
        let header = request
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(header, "action-1.0, token-tok-abc");
    }

    #[test]
    fn bad_url_is_rejected() {
        let endpoint = WsEndpoint::new("not a url", "action-1.0");
        assert!(matches!(
            build_request(&endpoint, "t"),
            Err(SessionError::WebSocket(_))
        ));
    }
}
