//! External collaboration-engine contract.
//!
//! The engine that actually orders and merges document operations lives
//! outside this crate. We consume it through [`CollabEngine`] plus a typed
//! event stream — this layer never interprets operation payloads and never
//! resolves conflicts.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::CollabError;

/// A participant identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    /// RGBA color for cursor/selection rendering
    pub color: [f32; 4],
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            name: name.into(),
            color: color_from_id(id),
        }
    }

    /// Create with an explicit id (color stays stable per id).
    pub fn with_id(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color: color_from_id(id),
        }
    }

    /// Merge a partial update into this user.
    pub fn apply(&mut self, update: &UserUpdate) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(color) = update.color {
            self.color = color;
        }
    }
}

/// Stable color derived from a participant id.
fn color_from_id(id: Uuid) -> [f32; 4] {
    let hash = id.as_u128();
    let r = (hash & 0xFF) as f32 / 255.0;
    let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
    let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
    [r, g, b, 1.0]
}

/// Partial user update — every field optional, absent fields untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub color: Option<[f32; 4]>,
}

/// Cursor position in document (world) coordinates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CursorPosition {
    pub x: f32,
    pub y: f32,
}

impl CursorPosition {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// A participant's selection: node and edge ids of the graph document.
///
/// Replaced whole on every update — never merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionState {
    pub node_ids: HashSet<Uuid>,
    pub edge_ids: HashSet<Uuid>,
}

impl SelectionState {
    pub fn new(
        node_ids: impl IntoIterator<Item = Uuid>,
        edge_ids: impl IntoIterator<Item = Uuid>,
    ) -> Self {
        Self {
            node_ids: node_ids.into_iter().collect(),
            edge_ids: edge_ids.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty() && self.edge_ids.is_empty()
    }
}

/// An opaque, durable edit intent handed to the engine.
///
/// This layer only observes the success or failure of the submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation {
    payload: Vec<u8>,
}

impl Operation {
    pub fn from_bytes(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// One remote participant's ephemeral state as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceEntry {
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionState>,
}

/// A presence change for a single participant.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceUpdate {
    Cursor {
        user_id: Uuid,
        cursor: CursorPosition,
    },
    Selection {
        user_id: Uuid,
        selection: SelectionState,
    },
    User {
        user_id: Uuid,
        update: UserUpdate,
    },
}

impl PresenceUpdate {
    /// The participant this update is about.
    pub fn user_id(&self) -> Uuid {
        match self {
            Self::Cursor { user_id, .. }
            | Self::Selection { user_id, .. }
            | Self::User { user_id, .. } => *user_id,
        }
    }
}

/// Inbound engine events, delivered in engine order.
///
/// A closed union — the dispatcher matches exhaustively, so a new event kind
/// is a compile error at every consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SessionJoined { session_id: Uuid, user: User },
    SessionLeft { session_id: Uuid, user_id: Uuid },
    PresenceUpdated {
        session_id: Uuid,
        update: PresenceUpdate,
    },
}

impl EngineEvent {
    /// The session this event belongs to, for stale-session filtering.
    pub fn session_id(&self) -> Uuid {
        match self {
            Self::SessionJoined { session_id, .. }
            | Self::SessionLeft { session_id, .. }
            | Self::PresenceUpdated { session_id, .. } => *session_id,
        }
    }
}

/// The external conflict-resolution engine, as consumed by this layer.
///
/// Ordering and merging of operations is entirely the engine's concern.
#[async_trait]
pub trait CollabEngine: Send + Sync {
    /// Create a new session for a project, returning its id.
    async fn create_session(&self, project_id: Uuid, user_id: Uuid) -> Result<Uuid, CollabError>;

    /// Join an existing session.
    async fn join_session(&self, session_id: Uuid, user: User) -> Result<(), CollabError>;

    /// Leave a session.
    async fn leave_session(&self, session_id: Uuid, user_id: Uuid) -> Result<(), CollabError>;

    /// Broadcast the local cursor position (best-effort).
    async fn broadcast_cursor(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        cursor: CursorPosition,
    ) -> Result<(), CollabError>;

    /// Broadcast the local selection (best-effort).
    async fn broadcast_selection(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        selection: SelectionState,
    ) -> Result<(), CollabError>;

    /// Broadcast a profile update for a participant (best-effort).
    async fn update_presence(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        update: UserUpdate,
    ) -> Result<(), CollabError>;

    /// Submit a document operation.
    async fn apply_operation(&self, session_id: Uuid, op: Operation) -> Result<(), CollabError>;

    /// Current ephemeral state of every participant the engine knows about.
    async fn presence_state(
        &self,
        session_id: Uuid,
    ) -> Result<HashMap<Uuid, PresenceEntry>, CollabError>;

    /// Subscribe to the engine's event stream.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}
