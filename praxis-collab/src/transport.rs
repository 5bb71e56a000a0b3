//! Authenticated WebSocket transport.
//!
//! Owns the single duplex connection to the collaboration server:
//!
//! ```text
//! connect()
//!    │ fetch credential ──► TokenManager
//!    ▼
//! WebSocket upgrade (session cookie)
//!    │
//!    ▼
//! Hello { csrf_token } ──► Welcome | Reject      (bounded by connect_timeout)
//!    │
//!    ▼
//! reader task ◄── frames ──► writer task
//!    │ connection lost
//!    ▼
//! reconnect loop: forced credential refresh, handshake, Reconnected event
//! ```
//!
//! A handshake rejection that pattern-matches credential keywords triggers
//! exactly one forced token refresh and retry; every other failure class is
//! surfaced unmodified. `send` while not connected fails immediately — there
//! is no outbound queue, so messages during a reconnect window are lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::CollabConfig;
use crate::error::CollabError;
use crate::protocol::{FrameType, WireFrame};
use crate::token::{Credential, TokenManager};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Name of the cookie carrying the credential session id.
const SESSION_COOKIE: &str = "praxis_session";

/// How long `disconnect` waits for the close acknowledgement.
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Initial connection established
    Connected,
    /// Connection dropped unexpectedly; reconnection in progress
    ConnectionLost,
    /// Connection re-established with a fresh credential
    Reconnected,
    /// Connection closed for good (explicit or attempts exhausted)
    Disconnected,
    /// Inbound named event frame
    Event { name: String, data: Vec<u8> },
}

struct TransportInner {
    config: CollabConfig,
    tokens: Arc<TokenManager>,
    state: RwLock<ConnectionState>,
    /// Credential installed into the live connection's auth context.
    auth: RwLock<Option<Arc<Credential>>>,
    active_url: RwLock<String>,
    outgoing: RwLock<Option<mpsc::Sender<Message>>>,
    closed: RwLock<Option<watch::Receiver<bool>>>,
    events: broadcast::Sender<TransportEvent>,
    shutdown: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// The authenticated duplex transport.
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new(config: CollabConfig, tokens: Arc<TokenManager>) -> Self {
        let (events, _) = broadcast::channel(64);
        let url = config.websocket_url();
        Self {
            inner: Arc::new(TransportInner {
                config,
                tokens,
                state: RwLock::new(ConnectionState::Disconnected),
                auth: RwLock::new(None),
                active_url: RwLock::new(url),
                outgoing: RwLock::new(None),
                closed: RwLock::new(None),
                events,
                shutdown: AtomicBool::new(false),
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to transport events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// The credential currently installed in the connection's auth context.
    pub async fn current_credential(&self) -> Option<Arc<Credential>> {
        self.inner.auth.read().await.clone()
    }

    /// Connect to the configured server. No-op when already connected.
    pub async fn connect(&self) -> Result<(), CollabError> {
        let url = self.inner.config.websocket_url();
        self.connect_to(&url).await
    }

    /// Connect to an explicit WebSocket URL. No-op when already connected.
    pub async fn connect_to(&self, url: &str) -> Result<(), CollabError> {
        if *self.inner.state.read().await == ConnectionState::Connected {
            log::debug!("connect: already connected");
            return Ok(());
        }

        self.inner.shutdown.store(false, Ordering::SeqCst);
        self.inner.abort_tasks();
        *self.inner.active_url.write().await = url.to_string();
        *self.inner.state.write().await = ConnectionState::Connecting;

        match self.inner.establish(false).await {
            Ok(()) => {
                let _ = self.inner.events.send(TransportEvent::Connected);
                Ok(())
            }
            Err(e) if e.is_auth_related() => {
                log::warn!("handshake rejected for credential reasons, retrying with fresh token: {e}");
                match self.inner.establish(true).await {
                    Ok(()) => {
                        let _ = self.inner.events.send(TransportEvent::Connected);
                        Ok(())
                    }
                    Err(e) => {
                        *self.inner.state.write().await = ConnectionState::Disconnected;
                        Err(e)
                    }
                }
            }
            Err(e) => {
                *self.inner.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Send a named event frame.
    ///
    /// Fails immediately with [`CollabError::NotConnected`] when the
    /// transport is not connected; nothing is queued.
    pub async fn send(&self, event: &str, data: Vec<u8>) -> Result<(), CollabError> {
        if *self.inner.state.read().await != ConnectionState::Connected {
            return Err(CollabError::NotConnected);
        }
        let tx = self
            .inner
            .outgoing
            .read()
            .await
            .clone()
            .ok_or(CollabError::NotConnected)?;

        let encoded = WireFrame::event(event, data).encode()?;
        tx.send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| CollabError::ConnectionClosed)
    }

    /// Close the connection and resolve once the close acknowledgement is
    /// observed (bounded wait). Idempotent.
    pub async fn disconnect(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);

        let tx = self.inner.outgoing.write().await.take();
        let closed = self.inner.closed.write().await.take();

        if let Some(tx) = tx {
            let _ = tx.send(Message::Close(None)).await;
            drop(tx);
            if let Some(mut closed) = closed {
                let _ = tokio::time::timeout(CLOSE_ACK_TIMEOUT, closed.wait_for(|c| *c)).await;
            }
        }

        self.inner.abort_tasks();
        *self.inner.state.write().await = ConnectionState::Disconnected;
        *self.inner.auth.write().await = None;
        let _ = self.inner.events.send(TransportEvent::Disconnected);
        log::info!("transport disconnected");
    }
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl TransportInner {
    /// Fetch a credential (forced when asked), install it into the auth
    /// context, run the handshake within the configured timeout, and wire up
    /// the reader/writer tasks. Leaves the state untouched on failure — the
    /// caller owns the transition.
    // Returns a boxed future rather than being an `async fn` so it has a
    // concrete (non-opaque) type. This breaks the async opaque-type cycle
    // install -> reader_loop -> reconnect_loop -> establish -> install, which
    // the compiler cannot otherwise resolve for `Send`.
    fn establish(
        self: &Arc<Self>,
        force_token: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CollabError>> + Send>> {
        let this = self.clone();
        Box::pin(async move {
            let cred = this.tokens.get_token(force_token).await?;
            *this.auth.write().await = Some(cred.clone());

            let url = this.active_url.read().await.clone();
            let ws = tokio::time::timeout(
                this.config.connect_timeout,
                Self::open_and_handshake(&url, &cred),
            )
            .await
            .map_err(|_| CollabError::ConnectionTimeout)??;

            this.install(ws).await;
            *this.state.write().await = ConnectionState::Connected;
            log::info!("connected to {url}");
            Ok(())
        })
    }

    /// Open the WebSocket (session cookie attached) and run the credential
    /// handshake: send `Hello`, wait for `Welcome` or `Reject`.
    async fn open_and_handshake(url: &str, cred: &Credential) -> Result<WsStream, CollabError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| CollabError::Handshake(e.to_string()))?;
        let cookie = format!("{SESSION_COOKIE}={}", cred.session_id);
        request.headers_mut().insert(
            COOKIE,
            HeaderValue::from_str(&cookie).map_err(|e| CollabError::Handshake(e.to_string()))?,
        );

        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|e| CollabError::Handshake(e.to_string()))?;

        let hello = WireFrame::hello(&cred.csrf_token).encode()?;
        ws.send(Message::Binary(hello.into()))
            .await
            .map_err(|e| CollabError::Handshake(e.to_string()))?;

        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    match WireFrame::decode(&bytes) {
                        Ok(frame) => match frame.frame_type {
                            FrameType::Welcome => return Ok(ws),
                            FrameType::Reject => {
                                let reason = frame
                                    .reject_reason()
                                    .unwrap_or_else(|_| "handshake rejected".to_string());
                                return Err(CollabError::Auth(reason));
                            }
                            other => {
                                log::debug!("ignoring pre-handshake frame {other:?}");
                            }
                        },
                        Err(e) => log::debug!("discarding undecodable handshake frame: {e}"),
                    }
                }
                Ok(Message::Close(_)) => return Err(CollabError::ConnectionClosed),
                Ok(_) => {}
                Err(e) => return Err(CollabError::Handshake(e.to_string())),
            }
        }
        Err(CollabError::ConnectionClosed)
    }

    /// Split the socket and spawn the writer/reader tasks.
    async fn install(self: &Arc<Self>, ws: WsStream) {
        let (mut sink, stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        let (closed_tx, closed_rx) = watch::channel(false);

        *self.outgoing.write().await = Some(out_tx);
        *self.closed.write().await = Some(closed_rx);

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let inner = self.clone();
        let reader = tokio::spawn(async move {
            inner.reader_loop(stream, closed_tx).await;
        });

        self.push_task(writer);
        self.push_task(reader);
    }

    async fn reader_loop(
        self: Arc<Self>,
        mut stream: futures_util::stream::SplitStream<WsStream>,
        closed_tx: watch::Sender<bool>,
    ) {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    match WireFrame::decode(&bytes) {
                        Ok(frame) => self.handle_frame(frame).await,
                        Err(e) => log::debug!("discarding undecodable frame: {e}"),
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = closed_tx.send(true);

        // Unexpected loss from Connected enters the reconnect path; explicit
        // disconnect and handshake teardown do not.
        let lost = {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Connected && !self.shutdown.load(Ordering::SeqCst) {
                *state = ConnectionState::Reconnecting;
                true
            } else {
                false
            }
        };
        if !lost {
            return;
        }

        *self.outgoing.write().await = None;
        let _ = self.events.send(TransportEvent::ConnectionLost);

        if self.config.reconnection {
            log::warn!("connection lost, reconnecting");
            let inner = self.clone();
            let handle = tokio::spawn(async move {
                inner.reconnect_loop().await;
            });
            self.push_task(handle);
        } else {
            *self.state.write().await = ConnectionState::Disconnected;
            let _ = self.events.send(TransportEvent::Disconnected);
        }
    }

    async fn handle_frame(&self, frame: WireFrame) {
        match frame.frame_type {
            FrameType::Event => match frame.event_payload() {
                Ok(payload) => {
                    let _ = self.events.send(TransportEvent::Event {
                        name: payload.name,
                        data: payload.data,
                    });
                }
                Err(e) => log::debug!("discarding malformed event frame: {e}"),
            },
            FrameType::Ping => {
                if let Some(tx) = self.outgoing.read().await.clone() {
                    if let Ok(pong) = WireFrame::pong().encode() {
                        let _ = tx.send(Message::Binary(pong.into())).await;
                    }
                }
            }
            FrameType::Pong => {}
            other => log::debug!("ignoring unexpected frame {other:?}"),
        }
    }

    /// Bounded reconnect loop. Every attempt refreshes the credential by
    /// force and installs it into the auth context before the handshake, so
    /// resumed traffic never carries a stale token.
    async fn reconnect_loop(self: Arc<Self>) {
        let attempts = self.config.reconnection_attempts;
        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.reconnection_delay).await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            log::info!("reconnect attempt {attempt}/{attempts}");
            match self.establish(true).await {
                Ok(()) => {
                    let _ = self.events.send(TransportEvent::Reconnected);
                    return;
                }
                Err(e) => log::warn!("reconnect attempt {attempt}/{attempts} failed: {e}"),
            }
        }

        log::error!("reconnection attempts exhausted");
        *self.state.write().await = ConnectionState::Disconnected;
        let _ = self.events.send(TransportEvent::Disconnected);
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.lock_tasks();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn abort_tasks(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
