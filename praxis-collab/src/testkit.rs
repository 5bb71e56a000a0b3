//! In-process test doubles for the collaboration layer.
//!
//! - [`MockEngine`] — a recording [`CollabEngine`] with scriptable failures
//!   and an injectable event stream.
//! - [`ScriptedCredentials`] — a deterministic credential source with a
//!   fetch counter.
//! - [`CollabTestServer`] — a real WebSocket endpoint speaking the wire
//!   protocol, with scriptable handshake behavior (reject, stall) and
//!   forced connection drops for reconnect tests.
//!
//! Everything here is also used by the crate's own test suites.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::engine::{
    CollabEngine, CursorPosition, EngineEvent, Operation, PresenceEntry, SelectionState, User,
    UserUpdate,
};
use crate::error::CollabError;
use crate::protocol::{FrameType, WireFrame};
use crate::token::{CredentialClaims, CredentialSource};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────────
// Scripted credential source
// ───────────────────────────────────────────────────────────────────

/// Deterministic credential source: yields `csrf-1`, `csrf-2`, … and counts
/// successful fetches.
#[derive(Default)]
pub struct ScriptedCredentials {
    fetches: AtomicUsize,
    fail_next: StdMutex<Option<String>>,
}

impl ScriptedCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful fetches so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Make the next fetch fail with the given reason.
    pub fn fail_next(&self, reason: &str) {
        *lock(&self.fail_next) = Some(reason.to_string());
    }
}

#[async_trait]
impl CredentialSource for ScriptedCredentials {
    async fn fetch(&self) -> Result<CredentialClaims, CollabError> {
        if let Some(reason) = lock(&self.fail_next).take() {
            return Err(CollabError::TokenFetch(reason));
        }
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CredentialClaims {
            csrf_token: format!("csrf-{n}"),
            session_id: format!("sess-{n}"),
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Mock engine
// ───────────────────────────────────────────────────────────────────

/// One recorded engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    CreateSession {
        project_id: Uuid,
        user_id: Uuid,
    },
    JoinSession {
        session_id: Uuid,
        user: User,
    },
    LeaveSession {
        session_id: Uuid,
        user_id: Uuid,
    },
    BroadcastCursor {
        session_id: Uuid,
        user_id: Uuid,
        cursor: CursorPosition,
    },
    BroadcastSelection {
        session_id: Uuid,
        user_id: Uuid,
        selection: SelectionState,
    },
    UpdatePresence {
        session_id: Uuid,
        user_id: Uuid,
        update: UserUpdate,
    },
    ApplyOperation {
        session_id: Uuid,
        op: Operation,
    },
    PresenceState {
        session_id: Uuid,
    },
}

/// Recording engine double with scriptable failures.
pub struct MockEngine {
    calls: StdMutex<Vec<EngineCall>>,
    events: broadcast::Sender<EngineEvent>,
    next_session_id: StdMutex<Option<Uuid>>,
    fail_broadcasts: AtomicBool,
    fail_next_apply: StdMutex<Option<String>>,
    presence: StdMutex<HashMap<Uuid, PresenceEntry>>,
}

impl MockEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            calls: StdMutex::new(Vec::new()),
            events,
            next_session_id: StdMutex::new(None),
            fail_broadcasts: AtomicBool::new(false),
            fail_next_apply: StdMutex::new(None),
            presence: StdMutex::new(HashMap::new()),
        }
    }

    /// All recorded calls, in invocation order.
    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.calls).clone()
    }

    /// Inject an event into the stream, as the engine would deliver it.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Pin the id returned by the next `create_session`.
    pub fn set_next_session_id(&self, session_id: Uuid) {
        *lock(&self.next_session_id) = Some(session_id);
    }

    /// Toggle failure of cursor/selection broadcasts.
    pub fn fail_broadcasts(&self, fail: bool) {
        self.fail_broadcasts.store(fail, Ordering::SeqCst);
    }

    /// Make the next `apply_operation` fail with the given reason.
    pub fn fail_next_apply(&self, reason: &str) {
        *lock(&self.fail_next_apply) = Some(reason.to_string());
    }

    /// Seed the presence view returned by `presence_state`.
    pub fn seed_presence(&self, user_id: Uuid, entry: PresenceEntry) {
        lock(&self.presence).insert(user_id, entry);
    }

    fn record(&self, call: EngineCall) {
        lock(&self.calls).push(call);
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CollabEngine for MockEngine {
    async fn create_session(&self, project_id: Uuid, user_id: Uuid) -> Result<Uuid, CollabError> {
        self.record(EngineCall::CreateSession {
            project_id,
            user_id,
        });
        Ok(lock(&self.next_session_id)
            .take()
            .unwrap_or_else(Uuid::new_v4))
    }

    async fn join_session(&self, session_id: Uuid, user: User) -> Result<(), CollabError> {
        self.record(EngineCall::JoinSession { session_id, user });
        Ok(())
    }

    async fn leave_session(&self, session_id: Uuid, user_id: Uuid) -> Result<(), CollabError> {
        self.record(EngineCall::LeaveSession {
            session_id,
            user_id,
        });
        Ok(())
    }

    async fn broadcast_cursor(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        cursor: CursorPosition,
    ) -> Result<(), CollabError> {
        self.record(EngineCall::BroadcastCursor {
            session_id,
            user_id,
            cursor,
        });
        if self.fail_broadcasts.load(Ordering::SeqCst) {
            return Err(CollabError::PresenceBroadcast("scripted failure".into()));
        }
        Ok(())
    }

    async fn broadcast_selection(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        selection: SelectionState,
    ) -> Result<(), CollabError> {
        self.record(EngineCall::BroadcastSelection {
            session_id,
            user_id,
            selection,
        });
        if self.fail_broadcasts.load(Ordering::SeqCst) {
            return Err(CollabError::PresenceBroadcast("scripted failure".into()));
        }
        Ok(())
    }

    async fn update_presence(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        update: UserUpdate,
    ) -> Result<(), CollabError> {
        self.record(EngineCall::UpdatePresence {
            session_id,
            user_id,
            update,
        });
        Ok(())
    }

    async fn apply_operation(&self, session_id: Uuid, op: Operation) -> Result<(), CollabError> {
        self.record(EngineCall::ApplyOperation { session_id, op });
        if let Some(reason) = lock(&self.fail_next_apply).take() {
            return Err(CollabError::Engine(reason));
        }
        Ok(())
    }

    async fn presence_state(
        &self,
        session_id: Uuid,
    ) -> Result<HashMap<Uuid, PresenceEntry>, CollabError> {
        self.record(EngineCall::PresenceState { session_id });
        Ok(lock(&self.presence).clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

// ───────────────────────────────────────────────────────────────────
// In-process collaboration server
// ───────────────────────────────────────────────────────────────────

struct ServerShared {
    reject_remaining: AtomicUsize,
    reject_reason: StdMutex<String>,
    stall_handshake: AtomicBool,
    hellos: StdMutex<Vec<String>>,
    cookies: StdMutex<Vec<String>>,
    event_names: StdMutex<Vec<String>>,
    kill: broadcast::Sender<()>,
}

/// A real WebSocket endpoint speaking the collaboration wire protocol.
pub struct CollabTestServer {
    addr: SocketAddr,
    shared: Arc<ServerShared>,
    accept_task: JoinHandle<()>,
}

impl CollabTestServer {
    /// Bind on an ephemeral local port and start accepting.
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");

        let (kill, _) = broadcast::channel(8);
        let shared = Arc::new(ServerShared {
            reject_remaining: AtomicUsize::new(0),
            reject_reason: StdMutex::new(String::new()),
            stall_handshake: AtomicBool::new(false),
            hellos: StdMutex::new(Vec::new()),
            cookies: StdMutex::new(Vec::new()),
            event_names: StdMutex::new(Vec::new()),
            kill,
        });

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let conn_shared = accept_shared.clone();
                tokio::spawn(async move {
                    Self::handle_connection(stream, conn_shared).await;
                });
            }
        });

        Self {
            addr,
            shared,
            accept_task,
        }
    }

    /// WebSocket URL of this server.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Reject the next `n` handshakes with the given reason.
    pub fn reject_next(&self, n: usize, reason: &str) {
        *lock(&self.shared.reject_reason) = reason.to_string();
        self.shared.reject_remaining.store(n, Ordering::SeqCst);
    }

    /// Accept connections but never answer the handshake.
    pub fn stall_handshake(&self, stall: bool) {
        self.shared.stall_handshake.store(stall, Ordering::SeqCst);
    }

    /// Drop every active connection without a close handshake.
    pub fn kill_connections(&self) {
        let _ = self.shared.kill.send(());
    }

    /// CSRF tokens observed in `Hello` frames, in arrival order.
    pub fn hellos(&self) -> Vec<String> {
        lock(&self.shared.hellos).clone()
    }

    /// Cookie headers observed on upgrade requests, in arrival order.
    pub fn cookies(&self) -> Vec<String> {
        lock(&self.shared.cookies).clone()
    }

    /// Names of `Event` frames received after the handshake.
    pub fn event_names(&self) -> Vec<String> {
        lock(&self.shared.event_names).clone()
    }

    async fn handle_connection(stream: tokio::net::TcpStream, shared: Arc<ServerShared>) {
        let header_shared = shared.clone();
        let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if let Some(cookie) = request.headers().get("Cookie") {
                if let Ok(value) = cookie.to_str() {
                    lock(&header_shared.cookies).push(value.to_string());
                }
            }
            Ok(response)
        };

        let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
            return;
        };
        let mut kill_rx = shared.kill.subscribe();

        loop {
            tokio::select! {
                msg = ws.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let Ok(frame) = WireFrame::decode(&bytes) else {
                            continue;
                        };
                        match frame.frame_type {
                            FrameType::Hello => {
                                if let Ok(hello) = frame.hello_payload() {
                                    lock(&shared.hellos).push(hello.csrf_token);
                                }
                                if shared.stall_handshake.load(Ordering::SeqCst) {
                                    continue;
                                }
                                let rejected = shared
                                    .reject_remaining
                                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                                        n.checked_sub(1)
                                    })
                                    .is_ok();
                                let reply = if rejected {
                                    WireFrame::reject(lock(&shared.reject_reason).clone())
                                } else {
                                    WireFrame::welcome()
                                };
                                let Ok(encoded) = reply.encode() else { break; };
                                if ws.send(Message::Binary(encoded.into())).await.is_err() {
                                    break;
                                }
                                if rejected {
                                    let _ = ws.close(None).await;
                                    break;
                                }
                            }
                            FrameType::Event => {
                                if let Ok(payload) = frame.event_payload() {
                                    lock(&shared.event_names).push(payload.name.clone());
                                    // Echo back so inbound delivery is observable.
                                    if let Ok(encoded) =
                                        WireFrame::event(payload.name, payload.data).encode()
                                    {
                                        let _ = ws.send(Message::Binary(encoded.into())).await;
                                    }
                                }
                            }
                            FrameType::Ping => {
                                if let Ok(encoded) = WireFrame::pong().encode() {
                                    let _ = ws.send(Message::Binary(encoded.into())).await;
                                }
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                },
                _ = kill_rx.recv() => {
                    // Drop without a close handshake to simulate abnormal loss.
                    break;
                }
            }
        }
    }
}

impl Drop for CollabTestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
