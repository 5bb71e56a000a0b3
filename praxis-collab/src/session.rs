//! Session lifecycle, inbound event dispatch, and operation submission.
//!
//! The controller coordinates the transport, the external engine, and the
//! local mirrored state:
//!
//! ```text
//! create_session / join_session
//!        │
//!        ▼
//! Transport::connect ── TokenManager
//!        │
//!        ▼
//! engine.create_session / engine.join_session
//!        │
//!        ▼
//! SharedState swap ──► dispatcher task ◄── engine event stream
//! ```
//!
//! State is published as immutable snapshots: every mutation clones the
//! current [`SessionSnapshot`], applies the change, and swaps the `Arc`, so
//! a reader holding a snapshot never observes a half-applied update.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::{
    CollabEngine, CursorPosition, EngineEvent, Operation, PresenceUpdate, SelectionState, User,
};
use crate::error::CollabError;
use crate::presence::PresenceSynchronizer;
use crate::transport::Transport;

/// Immutable view of the active session and its participants.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub session_id: Option<Uuid>,
    pub current_user: Option<User>,
    /// Remote participants. Never contains the local user.
    pub users: HashMap<Uuid, User>,
    /// Remote cursors, last-write-wins per participant.
    pub cursors: HashMap<Uuid, CursorPosition>,
    /// Remote selections, replaced whole on every update.
    pub selections: HashMap<Uuid, SelectionState>,
    /// Confirmed local operation submissions this session.
    pub operation_count: u64,
    pub is_connected: bool,
}

impl SessionSnapshot {
    pub fn has_session(&self) -> bool {
        self.session_id.is_some()
    }

    /// Whether `user_id` is the local participant.
    pub fn is_local(&self, user_id: Uuid) -> bool {
        self.current_user.as_ref().is_some_and(|u| u.id == user_id)
    }
}

/// Copy-on-write holder for the session snapshot.
#[derive(Clone)]
pub struct SharedState {
    current: Arc<RwLock<Arc<SessionSnapshot>>>,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(SessionSnapshot::default()))),
        }
    }

    /// The current snapshot. Cheap — clones an `Arc`, not the maps.
    pub async fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.current.read().await.clone()
    }

    /// Clone-modify-swap. The write lock is held only for the swap, and
    /// previously handed-out snapshots are untouched.
    pub(crate) async fn update(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        let mut guard = self.current.write().await;
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}

/// Top-level façade for the collaborative session lifecycle.
pub struct SessionController {
    engine: Arc<dyn CollabEngine>,
    transport: Arc<Transport>,
    state: SharedState,
    presence: Arc<PresenceSynchronizer>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    pub(crate) fn new(
        engine: Arc<dyn CollabEngine>,
        transport: Arc<Transport>,
        state: SharedState,
        presence: Arc<PresenceSynchronizer>,
    ) -> Self {
        Self {
            engine,
            transport,
            state,
            presence,
            dispatcher: StdMutex::new(None),
        }
    }

    /// The current session snapshot.
    pub async fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.state.snapshot().await
    }

    /// Create a new session for a project and join it as `user`.
    pub async fn create_session(&self, project_id: Uuid, user: User) -> Result<Uuid, CollabError> {
        self.transport.connect().await.map_err(|e| {
            log::error!("create_session: connect failed for project {project_id}: {e}");
            e
        })?;

        let session_id = self
            .engine
            .create_session(project_id, user.id)
            .await
            .map_err(|e| {
                log::error!("create_session failed for project {project_id}: {e}");
                e
            })?;

        self.engine
            .join_session(session_id, user.clone())
            .await
            .map_err(|e| {
                log::error!("join after create failed for session {session_id}: {e}");
                e
            })?;

        self.finish_join(session_id, user).await;
        Ok(session_id)
    }

    /// Join an existing session as `user`.
    pub async fn join_session(&self, session_id: Uuid, user: User) -> Result<(), CollabError> {
        self.transport.connect().await.map_err(|e| {
            log::error!("join_session: connect failed for session {session_id}: {e}");
            e
        })?;

        self.engine
            .join_session(session_id, user.clone())
            .await
            .map_err(|e| {
                log::error!("join_session failed for session {session_id}: {e}");
                e
            })?;

        self.finish_join(session_id, user).await;
        Ok(())
    }

    /// Leave the active session and reset local state. No-op without one.
    pub async fn leave_session(&self) -> Result<(), CollabError> {
        let snap = self.state.snapshot().await;
        let (Some(session_id), Some(user)) = (snap.session_id, snap.current_user.clone()) else {
            log::debug!("leave_session: no active session");
            return Ok(());
        };

        self.engine
            .leave_session(session_id, user.id)
            .await
            .map_err(|e| {
                log::error!("leave_session failed for session {session_id}: {e}");
                e
            })?;

        self.stop_dispatcher();
        self.presence.cancel_pending().await;
        self.state.update(|s| *s = SessionSnapshot::default()).await;
        log::info!("left session {session_id}");
        Ok(())
    }

    /// Submit a document operation.
    ///
    /// At-most-once from this layer: the operation counter moves only after
    /// a confirmed apply, and failures are re-thrown for the caller to
    /// handle — retrying is the caller's decision.
    pub async fn apply_operation(&self, op: Operation) -> Result<(), CollabError> {
        let snap = self.state.snapshot().await;
        let Some(session_id) = snap.session_id else {
            log::debug!("apply_operation: no active session, dropping");
            return Ok(());
        };

        match self.engine.apply_operation(session_id, op).await {
            Ok(()) => {
                self.state.update(|s| s.operation_count += 1).await;
                Ok(())
            }
            Err(e) => {
                log::error!("operation apply failed in session {session_id}: {e}");
                Err(CollabError::OperationApply(e.to_string()))
            }
        }
    }

    async fn finish_join(&self, session_id: Uuid, user: User) {
        self.state
            .update(|s| {
                s.is_connected = true;
                s.session_id = Some(session_id);
                s.current_user = Some(user);
            })
            .await;
        self.seed_presence(session_id).await;
        self.start_dispatcher(session_id);
        log::info!("joined session {session_id}");
    }

    /// Mirror the engine's current presence view, excluding the local user.
    async fn seed_presence(&self, session_id: Uuid) {
        match self.engine.presence_state(session_id).await {
            Ok(entries) => {
                self.state
                    .update(|s| {
                        for (user_id, entry) in entries {
                            if s.is_local(user_id) {
                                continue;
                            }
                            if let Some(cursor) = entry.cursor {
                                s.cursors.insert(user_id, cursor);
                            }
                            if let Some(selection) = entry.selection {
                                s.selections.insert(user_id, selection);
                            }
                        }
                    })
                    .await;
            }
            Err(e) => log::warn!("presence state unavailable for session {session_id}: {e}"),
        }
    }

    /// (Re)start the dispatcher with a fresh subscription bound to one
    /// session identity. The previous task is aborted first, so handlers
    /// never duplicate or leak across session transitions.
    fn start_dispatcher(&self, session_id: Uuid) {
        let mut rx = self.engine.subscribe();
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.session_id() != session_id {
                            log::debug!(
                                "discarding event for stale session {}",
                                event.session_id()
                            );
                            continue;
                        }
                        state.update(|s| apply_event(s, event)).await;
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("engine event stream lagged, {n} events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(old) = self.lock_dispatcher().replace(handle) {
            old.abort();
        }
    }

    fn stop_dispatcher(&self) {
        if let Some(task) = self.lock_dispatcher().take() {
            task.abort();
        }
    }

    fn lock_dispatcher(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Ok(slot) = self.dispatcher.get_mut() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

fn apply_event(s: &mut SessionSnapshot, event: EngineEvent) {
    match event {
        EngineEvent::SessionJoined { user, .. } => {
            if s.is_local(user.id) {
                return;
            }
            s.users.insert(user.id, user);
        }
        EngineEvent::SessionLeft { user_id, .. } => {
            s.users.remove(&user_id);
            s.cursors.remove(&user_id);
            s.selections.remove(&user_id);
        }
        EngineEvent::PresenceUpdated { update, .. } => apply_presence(s, update),
    }
}

/// Apply one presence update to the snapshot. Updates about the local user
/// touch `current_user`; everything else lands in the remote maps,
/// replacing any prior value.
pub(crate) fn apply_presence(s: &mut SessionSnapshot, update: PresenceUpdate) {
    match update {
        PresenceUpdate::Cursor { user_id, cursor } => {
            if s.is_local(user_id) {
                return;
            }
            s.cursors.insert(user_id, cursor);
        }
        PresenceUpdate::Selection { user_id, selection } => {
            if s.is_local(user_id) {
                return;
            }
            s.selections.insert(user_id, selection);
        }
        PresenceUpdate::User { user_id, update } => {
            if s.is_local(user_id) {
                if let Some(user) = s.current_user.as_mut() {
                    user.apply(&update);
                }
            } else if let Some(user) = s.users.get_mut(&user_id) {
                user.apply(&update);
            } else {
                log::debug!("profile update for unknown participant {user_id}");
            }
        }
    }
}
