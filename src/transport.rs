//! # Transport Session
//!
//! Owns the single socket to the remote voice agent.
//!
//! ## Socket States:
//! ```text
//! DISCONNECTED(-1) --connect--> CONNECTING(0) --open--> CONNECTED(1)
//!                                    |                       |
//!                                    +--error--> ERROR(2)    |
//!                                    +--close--> CLOSED(3) <-+
//! ```
//! Every close counts against the retry budget and schedules a reconnect after
//! a fixed delay. A successful open resets the budget. When the budget runs
//! out the session becomes rate limited and stays that way.
//!
//! ## Event Flow:
//! The socket runs in its own task. Everything it observes (open, close,
//! error, frames) comes back to the session loop as a `TransportEvent` tagged
//! with the connection generation, so events from a superseded connection
//! are recognised and dropped. The session loop feeds them to
//! `handle_event`, which applies the state transitions and hands audio and
//! control messages to the caller.

use crate::config::TransportConfig;
use crate::credentials::Authenticator;
use crate::error::{AppError, AppResult};
use crate::protocol::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Connection status of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Closed,
}

impl SocketState {
    /// Numeric code exposed to clients (-1..=3).
    pub fn code(self) -> i8 {
        match self {
            SocketState::Disconnected => -1,
            SocketState::Connecting => 0,
            SocketState::Connected => 1,
            SocketState::Error => 2,
            SocketState::Closed => 3,
        }
    }
}

/// What the socket task reports back to the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Closed,
    Error(String),
    Audio(Vec<u8>),
    Control(ServerMessage),
    ReconnectDue,
}

/// Event plus the generation of the connection that produced it.
pub type TaggedEvent = (u64, TransportEvent);

/// What `handle_event` passes on to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Connected,
    Disconnected,
    Audio(Vec<u8>),
    Control(ServerMessage),
}

/// Point-in-time view of the session for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct TransportSnapshot {
    pub state: SocketState,
    pub state_code: i8,
    pub reconnect_attempts: u32,
    pub rate_limited: bool,
}

pub struct TransportSession {
    config: TransportConfig,
    authenticator: Arc<dyn Authenticator>,
    settings: ClientMessage,
    state: SocketState,
    reconnect_attempts: u32,
    rate_limited: bool,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    connection: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<TaggedEvent>,
}

impl TransportSession {
    /// `settings` is the handshake sent on every open; `events` is where the
    /// socket task reports back.
    pub fn new(
        config: TransportConfig,
        authenticator: Arc<dyn Authenticator>,
        settings: ClientMessage,
        events: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        Self {
            config,
            authenticator,
            settings,
            state: SocketState::Disconnected,
            reconnect_attempts: 0,
            rate_limited: false,
            generation: 0,
            outbound: None,
            connection: None,
            heartbeat: None,
            reconnect_timer: None,
            events,
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SocketState::Connected
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        let state = self.state();
        TransportSnapshot {
            state,
            state_code: state.code(),
            reconnect_attempts: self.reconnect_attempts,
            rate_limited: self.rate_limited,
        }
    }

    /// Replace the handshake used by future connections.
    pub fn set_settings(&mut self, settings: ClientMessage) {
        self.settings = settings;
    }

    /// Open the socket.
    ///
    /// Calls made while a connection is in flight, already open, or while a
    /// reconnect is pending collapse into that attempt.
    pub fn connect(&mut self) -> AppResult<()> {
        if self.rate_limited || self.reconnect_attempts >= self.config.max_reconnect_attempts {
            self.rate_limited = true;
            return Err(AppError::RateLimited {
                attempts: self.reconnect_attempts,
            });
        }
        match self.state {
            SocketState::Connecting | SocketState::Connected => {
                debug!(state = ?self.state, "connect ignored: connection already active");
                return Ok(());
            }
            _ if self.reconnect_timer.is_some() => {
                debug!("connect ignored: reconnect already scheduled");
                return Ok(());
            }
            _ => {}
        }
        self.open_connection();
        Ok(())
    }

    fn open_connection(&mut self) {
        if let Some(previous) = self.connection.take() {
            previous.abort();
        }
        self.generation += 1;
        self.state = SocketState::Connecting;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound_tx);

        info!(
            generation = self.generation,
            attempts = self.reconnect_attempts,
            "connecting to voice agent"
        );

        self.connection = Some(tokio::spawn(run_connection(
            self.generation,
            self.config.agent_url.clone(),
            self.authenticator.clone(),
            outbound_rx,
            self.events.clone(),
        )));
    }

    /// Apply one socket event. Events from superseded connections are dropped.
    pub fn handle_event(&mut self, generation: u64, event: TransportEvent) -> Option<Inbound> {
        if generation != self.generation {
            debug!(generation, current = self.generation, "dropping stale transport event");
            return None;
        }
        match event {
            TransportEvent::Opened => {
                self.on_open();
                Some(Inbound::Connected)
            }
            TransportEvent::Closed => {
                self.on_close();
                Some(Inbound::Disconnected)
            }
            TransportEvent::Error(reason) => {
                self.on_error(&reason);
                None
            }
            TransportEvent::ReconnectDue => {
                self.reconnect_timer = None;
                if let Err(e) = self.connect() {
                    warn!(error = %e, "reconnect skipped");
                }
                None
            }
            TransportEvent::Audio(bytes) => Some(Inbound::Audio(bytes)),
            TransportEvent::Control(message) => Some(Inbound::Control(message)),
        }
    }

    fn on_open(&mut self) {
        self.state = SocketState::Connected;
        self.reconnect_attempts = 0;
        info!(state = self.state.code(), "voice agent connected");

        let settings = self.settings.clone();
        self.send(&settings);

        if let Some(outbound) = &self.outbound {
            if let Some(previous) = self.heartbeat.take() {
                previous.abort();
            }
            self.heartbeat = Some(spawn_heartbeat(
                outbound.clone(),
                self.config.keepalive_interval(),
            ));
        }
    }

    fn on_close(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.outbound = None;
        self.connection = None;
        self.state = SocketState::Closed;
        self.reconnect_attempts += 1;

        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            self.rate_limited = true;
            error!(
                attempts = self.reconnect_attempts,
                "reconnect budget exhausted; session is rate limited"
            );
            return;
        }

        let delay = self.config.reconnect_delay();
        info!(
            attempts = self.reconnect_attempts,
            delay_secs = delay.as_secs(),
            "voice agent connection closed; reconnecting"
        );
        self.reconnect_timer = Some(spawn_reconnect_timer(
            self.generation,
            delay,
            self.events.clone(),
        ));
    }

    fn on_error(&mut self, reason: &str) {
        self.state = SocketState::Error;
        warn!(state = self.state.code(), reason, "voice agent socket error");
    }

    /// Serialize and send a control message. Dropped unless connected.
    pub fn send(&self, message: &ClientMessage) -> bool {
        if self.state != SocketState::Connected {
            debug!(kind = message.kind(), "not connected; dropping control message");
            return false;
        }
        match serde_json::to_string(message) {
            Ok(json) => self.write(Message::Text(json)),
            Err(e) => {
                error!(error = %e, "cannot serialize control message");
                false
            }
        }
    }

    /// Send one block of wire-format audio. Dropped unless connected.
    pub fn send_audio(&self, bytes: Vec<u8>) -> bool {
        if self.state != SocketState::Connected {
            return false;
        }
        self.write(Message::Binary(bytes))
    }

    fn write(&self, message: Message) -> bool {
        match &self.outbound {
            Some(outbound) => outbound.send(message).is_ok(),
            None => false,
        }
    }

    /// Close the socket and cancel every timer. Later events are ignored.
    pub fn shutdown(&mut self) {
        for handle in [self.heartbeat.take(), self.reconnect_timer.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        // dropping the sender makes the socket task send a close frame
        self.outbound = None;
        self.connection = None;
        self.generation += 1;
        self.state = SocketState::Disconnected;
        info!("voice agent session shut down");
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        for handle in [
            self.heartbeat.take(),
            self.reconnect_timer.take(),
            self.connection.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// Sends `KeepAlive` every `period`, starting one period from now.
fn spawn_heartbeat(outbound: mpsc::UnboundedSender<Message>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let json = match serde_json::to_string(&ClientMessage::KeepAlive) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "cannot serialize keep-alive");
                    break;
                }
            };
            if outbound.send(Message::Text(json)).is_err() {
                break;
            }
            debug!("sent keep-alive");
        }
    })
}

fn spawn_reconnect_timer(
    generation: u64,
    delay: Duration,
    events: mpsc::UnboundedSender<TaggedEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send((generation, TransportEvent::ReconnectDue));
    })
}

/// One connection attempt, from credential fetch to close.
///
/// Always finishes by reporting `Closed`, after an `Error` when the attempt
/// failed.
async fn run_connection(
    generation: u64,
    url: String,
    authenticator: Arc<dyn Authenticator>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<TaggedEvent>,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send((generation, event));
    };

    let socket = match open_socket(&url, authenticator.as_ref()).await {
        Ok(socket) => socket,
        Err(e) => {
            emit(TransportEvent::Error(e.to_string()));
            emit(TransportEvent::Closed);
            return;
        }
    };
    emit(TransportEvent::Opened);

    let (mut write, mut read) = socket.split();
    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Binary(bytes))) => emit(TransportEvent::Audio(bytes)),
                    Some(Ok(Message::Text(text))) => match ServerMessage::parse(&text) {
                        Ok(message) => emit(TransportEvent::Control(message)),
                        Err(e) => warn!(error = %e, "dropping malformed control message"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "agent closed the socket");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => break,
                }
            }
            message = outbound.recv() => {
                match message {
                    Some(message) => {
                        if let Err(e) = write.send(message).await {
                            emit(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }
    emit(TransportEvent::Closed);
}

type AgentSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Fetch a fresh key and open the socket, presenting the key as the
/// `token, <key>` sub-protocol.
async fn open_socket(url: &str, authenticator: &dyn Authenticator) -> AppResult<AgentSocket> {
    let key = authenticator.fetch_key().await?;

    let mut request = url.into_client_request()?;
    let protocol = HeaderValue::from_str(&format!("token, {}", key))
        .map_err(|e| AppError::Credential(format!("key is not a valid header value: {}", e)))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", protocol);

    let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::credentials::StaticAuthenticator;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Instant};
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    /// Authenticator that always fails and records when it was asked.
    #[derive(Default)]
    struct RefusingAuthenticator {
        calls: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl Authenticator for RefusingAuthenticator {
        async fn fetch_key(&self) -> AppResult<String> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(Instant::now());
            }
            Err(AppError::Credential("no key".to_string()))
        }
    }

    fn session(
        url: &str,
        authenticator: Arc<dyn Authenticator>,
    ) -> (TransportSession, mpsc::UnboundedReceiver<TaggedEvent>) {
        let config = AppConfig::default();
        let mut transport = config.transport.clone();
        transport.agent_url = url.to_string();
        let settings = ClientMessage::settings(&config.audio, &config.agent);
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportSession::new(transport, authenticator, settings, tx), rx)
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(SocketState::Disconnected.code(), -1);
        assert_eq!(SocketState::Connecting.code(), 0);
        assert_eq!(SocketState::Connected.code(), 1);
        assert_eq!(SocketState::Error.code(), 2);
        assert_eq!(SocketState::Closed.code(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_bounded() {
        let auth = Arc::new(RefusingAuthenticator::default());
        let (mut transport, mut rx) = session("ws://127.0.0.1:9", auth.clone());

        transport.connect().unwrap();
        while let Ok(Some((generation, event))) = timeout(Duration::from_secs(60), rx.recv()).await
        {
            transport.handle_event(generation, event);
        }

        assert!(transport.is_rate_limited());
        assert_eq!(transport.reconnect_attempts(), 5);
        assert_eq!(transport.state(), SocketState::Closed);

        let calls = auth.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 5);
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(3));
        }

        assert!(matches!(
            transport.connect(),
            Err(AppError::RateLimited { attempts: 5 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_coalesces_while_reconnect_pending() {
        let auth = Arc::new(RefusingAuthenticator::default());
        let (mut transport, mut rx) = session("ws://127.0.0.1:9", auth.clone());

        transport.connect().unwrap();
        transport.connect().unwrap();
        loop {
            let (generation, event) = rx.recv().await.unwrap();
            let closed = event == TransportEvent::Closed;
            transport.handle_event(generation, event);
            if closed {
                break;
            }
        }
        assert_eq!(transport.state(), SocketState::Closed);

        // timer pending: external connects collapse into it
        transport.connect().unwrap();
        transport.connect().unwrap();
        tokio::task::yield_now().await;
        assert_eq!(auth.calls.lock().unwrap().len(), 1);

        transport.shutdown();
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let (mut transport, _rx) = session("ws://127.0.0.1:9", Arc::new(StaticAuthenticator("k".into())));
        assert_eq!(transport.handle_event(42, TransportEvent::Opened), None);
        assert_eq!(transport.state(), SocketState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_dropped_unless_connected() {
        let (transport, _rx) = session("ws://127.0.0.1:9", Arc::new(StaticAuthenticator("k".into())));
        assert!(!transport.send(&ClientMessage::KeepAlive));
        assert!(!transport.send_audio(vec![0, 0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let heartbeat = spawn_heartbeat(tx, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(9_900)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        match rx.try_recv() {
            Ok(Message::Text(text)) => assert_eq!(text, r#"{"type":"KeepAlive"}"#),
            other => panic!("expected keep-alive, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_ok());

        heartbeat.abort();
    }

    /// Drive the session to `Connected` over an in-memory outbound queue.
    fn open_in_memory(transport: &mut TransportSession) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.state = SocketState::Connecting;
        transport.outbound = Some(tx);
        assert_eq!(
            transport.handle_event(transport.generation, TransportEvent::Opened),
            Some(Inbound::Connected)
        );
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_resets_budget_and_close_stops_keepalive() {
        let (mut transport, _events) =
            session("ws://127.0.0.1:9", Arc::new(StaticAuthenticator("k".into())));
        let generation = transport.generation;

        for _ in 0..4 {
            transport.handle_event(generation, TransportEvent::Closed);
        }
        assert_eq!(transport.reconnect_attempts(), 4);
        assert!(!transport.is_rate_limited());

        let mut outbound = open_in_memory(&mut transport);
        assert_eq!(transport.reconnect_attempts(), 0);
        match outbound.try_recv() {
            Ok(Message::Text(text)) => assert!(text.contains(r#""type":"Settings""#)),
            other => panic!("expected settings, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(10_100)).await;
        match outbound.try_recv() {
            Ok(Message::Text(text)) => assert_eq!(text, r#"{"type":"KeepAlive"}"#),
            other => panic!("expected keep-alive, got {:?}", other),
        }

        transport.handle_event(generation, TransportEvent::Closed);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(outbound.try_recv().is_err());

        for _ in 0..3 {
            transport.handle_event(generation, TransportEvent::Closed);
        }
        assert_eq!(transport.reconnect_attempts(), 4);
        assert!(!transport.is_rate_limited());

        transport.handle_event(generation, TransportEvent::Closed);
        assert!(transport.is_rate_limited());
        transport.shutdown();
    }

    #[tokio::test]
    async fn test_session_against_local_agent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let agent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
                let protocol = request
                    .headers()
                    .get("Sec-WebSocket-Protocol")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                assert_eq!(protocol, "token, test-key");
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("token"));
                Ok(response)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();

            let first = ws.next().await.unwrap().unwrap();
            ws.send(Message::Binary(vec![1, 2, 3, 4])).await.unwrap();
            ws.send(Message::Text("{oops".to_string())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"AgentAudioDone"}"#.to_string()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
            first.into_text().unwrap()
        });

        let (mut transport, mut rx) = session(&url, Arc::new(StaticAuthenticator("test-key".into())));
        transport.connect().unwrap();

        let mut inbound = Vec::new();
        loop {
            let (generation, event) = timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let closed = event == TransportEvent::Closed;
            if let Some(item) = transport.handle_event(generation, event) {
                inbound.push(item);
            }
            if closed {
                break;
            }
        }

        assert_eq!(
            inbound,
            vec![
                Inbound::Connected,
                Inbound::Audio(vec![1, 2, 3, 4]),
                Inbound::Control(ServerMessage::AgentAudioDone),
                Inbound::Disconnected,
            ]
        );

        let handshake = agent.await.unwrap();
        assert!(handshake.contains(r#""type":"Settings""#));

        assert_eq!(transport.state(), SocketState::Closed);
        assert_eq!(transport.reconnect_attempts(), 1);
        transport.shutdown();
        assert_eq!(transport.state(), SocketState::Disconnected);
    }
}
