//! Throttled presence synchronization.
//!
//! ```text
//! update_cursor(p1) ─┐
//! update_cursor(p2) ─┤ overwrite pending     ┌── sleep(window) ──┐
//! update_cursor(p3) ─┘                       │ flush task        │
//!         │                                  │ take pending (p3) │
//!         └── arm (first call in window) ──► │ broadcast_cursor  │
//!                                            └───────────────────┘
//! ```
//!
//! A burst of updates inside one window collapses to a single outbound
//! broadcast carrying the last value observed — last-write-wins, never
//! merged. Cursor and selection run on independent timers, so their
//! relative ordering is not guaranteed.
//!
//! Presence is ephemeral: broadcast failures are logged and swallowed, a
//! later successful update supersedes any lost one.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::engine::{CollabEngine, CursorPosition, PresenceUpdate, SelectionState, UserUpdate};
use crate::session::{apply_presence, SharedState};

struct PresenceInner {
    engine: Arc<dyn CollabEngine>,
    state: SharedState,
    cursor_window: Duration,
    selection_window: Duration,
    cursor_pending: Mutex<Option<CursorPosition>>,
    cursor_task: StdMutex<Option<JoinHandle<()>>>,
    selection_pending: Mutex<Option<SelectionState>>,
    selection_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Coalesces local presence changes into throttled broadcasts and applies
/// inbound presence to the shared session state.
pub struct PresenceSynchronizer {
    inner: Arc<PresenceInner>,
}

impl PresenceSynchronizer {
    pub(crate) fn new(
        engine: Arc<dyn CollabEngine>,
        state: SharedState,
        config: &CollabConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                engine,
                state,
                cursor_window: config.throttle_cursor,
                selection_window: config.throttle_selection,
                cursor_pending: Mutex::new(None),
                cursor_task: StdMutex::new(None),
                selection_pending: Mutex::new(None),
                selection_task: StdMutex::new(None),
            }),
        }
    }

    /// Record a local cursor move. No-op without an active session.
    pub async fn update_cursor(&self, cursor: CursorPosition) {
        let snap = self.inner.state.snapshot().await;
        let Some(session_id) = snap.session_id else {
            return;
        };
        let Some(user) = snap.current_user.as_ref() else {
            return;
        };
        let user_id = user.id;

        *self.inner.cursor_pending.lock().await = Some(cursor);
        self.arm_cursor_flush(session_id, user_id);
    }

    /// Record a local selection change. No-op without an active session.
    pub async fn update_selection(
        &self,
        node_ids: impl IntoIterator<Item = Uuid>,
        edge_ids: impl IntoIterator<Item = Uuid>,
    ) {
        let snap = self.inner.state.snapshot().await;
        let Some(session_id) = snap.session_id else {
            return;
        };
        let Some(user) = snap.current_user.as_ref() else {
            return;
        };
        let user_id = user.id;

        let selection = SelectionState::new(node_ids, edge_ids);
        *self.inner.selection_pending.lock().await = Some(selection);
        self.arm_selection_flush(session_id, user_id);
    }

    /// Apply a profile update for a participant.
    ///
    /// Routed by identity: the local user's profile updates `current_user`
    /// and is broadcast to the session; a remote id updates the remote map
    /// through the same path inbound events take.
    pub async fn update_user(&self, user_id: Uuid, update: UserUpdate) {
        self.inner
            .state
            .update(|s| {
                apply_presence(
                    s,
                    PresenceUpdate::User {
                        user_id,
                        update: update.clone(),
                    },
                )
            })
            .await;

        let snap = self.inner.state.snapshot().await;
        if let Some(session_id) = snap.session_id {
            if snap.is_local(user_id) {
                if let Err(e) = self
                    .inner
                    .engine
                    .update_presence(session_id, user_id, update)
                    .await
                {
                    log::warn!("profile broadcast failed for session {session_id}: {e}");
                }
            }
        }
    }

    /// Abort pending flushes and drop their values. Nothing can fire after
    /// this returns.
    pub async fn cancel_pending(&self) {
        if let Some(task) = lock_slot(&self.inner.cursor_task).take() {
            task.abort();
        }
        if let Some(task) = lock_slot(&self.inner.selection_task).take() {
            task.abort();
        }
        *self.inner.cursor_pending.lock().await = None;
        *self.inner.selection_pending.lock().await = None;
    }

    /// First call in a window arms the deferred flush; later calls find the
    /// timer already armed and only overwrite the pending value.
    fn arm_cursor_flush(&self, session_id: Uuid, user_id: Uuid) {
        let mut slot = lock_slot(&self.inner.cursor_task);
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let inner = self.inner.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.cursor_window).await;
            let pending = inner.cursor_pending.lock().await.take();
            if let Some(cursor) = pending {
                if let Err(e) = inner
                    .engine
                    .broadcast_cursor(session_id, user_id, cursor)
                    .await
                {
                    log::warn!("cursor broadcast failed for session {session_id}: {e}");
                }
            }
        }));
    }

    fn arm_selection_flush(&self, session_id: Uuid, user_id: Uuid) {
        let mut slot = lock_slot(&self.inner.selection_task);
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let inner = self.inner.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.selection_window).await;
            let pending = inner.selection_pending.lock().await.take();
            if let Some(selection) = pending {
                if let Err(e) = inner
                    .engine
                    .broadcast_selection(session_id, user_id, selection)
                    .await
                {
                    log::warn!("selection broadcast failed for session {session_id}: {e}");
                }
            }
        }));
    }
}

impl Drop for PresenceInner {
    fn drop(&mut self) {
        for slot in [&mut self.cursor_task, &mut self.selection_task] {
            if let Ok(slot) = slot.get_mut() {
                if let Some(task) = slot.take() {
                    task.abort();
                }
            }
        }
    }
}

fn lock_slot(slot: &StdMutex<Option<JoinHandle<()>>>) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::User;
    use crate::testkit::{EngineCall, MockEngine};

    async fn active_session(state: &SharedState) -> (Uuid, User) {
        let session_id = Uuid::new_v4();
        let user = User::new("Ada");
        let local = user.clone();
        state
            .update(move |s| {
                s.session_id = Some(session_id);
                s.current_user = Some(local);
                s.is_connected = true;
            })
            .await;
        (session_id, user)
    }

    fn synchronizer(
        engine: &Arc<MockEngine>,
        state: &SharedState,
        cursor_ms: u64,
        selection_ms: u64,
    ) -> PresenceSynchronizer {
        let config = CollabConfig {
            throttle_cursor: Duration::from_millis(cursor_ms),
            throttle_selection: Duration::from_millis(selection_ms),
            ..CollabConfig::default()
        };
        PresenceSynchronizer::new(engine.clone() as Arc<dyn CollabEngine>, state.clone(), &config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_last_cursor() {
        let engine = Arc::new(MockEngine::new());
        let state = SharedState::new();
        let (session_id, user) = active_session(&state).await;
        let presence = synchronizer(&engine, &state, 50, 200);

        presence.update_cursor(CursorPosition::new(1.0, 1.0)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        presence.update_cursor(CursorPosition::new(2.0, 2.0)).await;

        tokio::time::sleep(Duration::from_millis(60)).await;

        let broadcasts: Vec<_> = engine
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::BroadcastCursor {
                    session_id: s,
                    user_id: u,
                    cursor,
                } => Some((s, u, cursor)),
                _ => None,
            })
            .collect();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0], (session_id, user.id, CursorPosition::new(2.0, 2.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_rapid_updates_one_broadcast() {
        let engine = Arc::new(MockEngine::new());
        let state = SharedState::new();
        active_session(&state).await;
        let presence = synchronizer(&engine, &state, 50, 200);

        for i in 0..20 {
            presence
                .update_cursor(CursorPosition::new(i as f32, i as f32))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let cursors: Vec<_> = engine
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::BroadcastCursor { cursor, .. } => Some(cursor),
                _ => None,
            })
            .collect();
        assert_eq!(cursors, vec![CursorPosition::new(19.0, 19.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_windows_broadcast_separately() {
        let engine = Arc::new(MockEngine::new());
        let state = SharedState::new();
        active_session(&state).await;
        let presence = synchronizer(&engine, &state, 50, 200);

        presence.update_cursor(CursorPosition::new(1.0, 1.0)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        presence.update_cursor(CursorPosition::new(2.0, 2.0)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let count = engine
            .calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::BroadcastCursor { .. }))
            .count();
        assert_eq!(count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_and_selection_throttle_independently() {
        let engine = Arc::new(MockEngine::new());
        let state = SharedState::new();
        active_session(&state).await;
        let presence = synchronizer(&engine, &state, 50, 200);

        let node = Uuid::new_v4();
        presence.update_cursor(CursorPosition::new(1.0, 1.0)).await;
        presence.update_selection([node], []).await;

        // Cursor window has elapsed, selection window has not.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let calls = engine.calls();
        assert!(calls
            .iter()
            .any(|c| matches!(c, EngineCall::BroadcastCursor { .. })));
        assert!(!calls
            .iter()
            .any(|c| matches!(c, EngineCall::BroadcastSelection { .. })));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let selections: Vec<_> = engine
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::BroadcastSelection { selection, .. } => Some(selection),
                _ => None,
            })
            .collect();
        assert_eq!(selections.len(), 1);
        assert!(selections[0].node_ids.contains(&node));
    }

    #[tokio::test(start_paused = true)]
    async fn test_noop_without_active_session() {
        let engine = Arc::new(MockEngine::new());
        let state = SharedState::new();
        let presence = synchronizer(&engine, &state, 50, 200);

        presence.update_cursor(CursorPosition::new(1.0, 1.0)).await;
        presence.update_selection([Uuid::new_v4()], []).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(engine.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_failure_swallowed() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_broadcasts(true);
        let state = SharedState::new();
        active_session(&state).await;
        let presence = synchronizer(&engine, &state, 50, 200);

        presence.update_cursor(CursorPosition::new(1.0, 1.0)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        // The failed broadcast was attempted, and a later one supersedes it.
        engine.fail_broadcasts(false);
        presence.update_cursor(CursorPosition::new(2.0, 2.0)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let count = engine
            .calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::BroadcastCursor { .. }))
            .count();
        assert_eq!(count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_prevents_flush() {
        let engine = Arc::new(MockEngine::new());
        let state = SharedState::new();
        active_session(&state).await;
        let presence = synchronizer(&engine, &state, 50, 200);

        presence.update_cursor(CursorPosition::new(1.0, 1.0)).await;
        presence.update_selection([Uuid::new_v4()], []).await;
        presence.cancel_pending().await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(engine.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_profile_update_broadcasts() {
        let engine = Arc::new(MockEngine::new());
        let state = SharedState::new();
        let (_, user) = active_session(&state).await;
        let presence = synchronizer(&engine, &state, 50, 200);

        presence
            .update_user(
                user.id,
                UserUpdate {
                    name: Some("Ada L.".into()),
                    color: None,
                },
            )
            .await;

        let snap = state.snapshot().await;
        assert_eq!(snap.current_user.as_ref().unwrap().name, "Ada L.");
        assert!(engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::UpdatePresence { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_profile_update_not_broadcast() {
        let engine = Arc::new(MockEngine::new());
        let state = SharedState::new();
        active_session(&state).await;
        let presence = synchronizer(&engine, &state, 50, 200);

        let remote = User::new("Grace");
        state
            .update({
                let remote = remote.clone();
                move |s| {
                    s.users.insert(remote.id, remote);
                }
            })
            .await;

        presence
            .update_user(
                remote.id,
                UserUpdate {
                    name: Some("Grace H.".into()),
                    color: None,
                },
            )
            .await;

        let snap = state.snapshot().await;
        assert_eq!(snap.users[&remote.id].name, "Grace H.");
        assert!(!engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::UpdatePresence { .. })));
    }
}
