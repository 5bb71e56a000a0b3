//! # praxis-collab — Realtime collaboration client for Praxis
//!
//! Client-side synchronization layer for multiplayer editing of Praxis
//! node-graph documents: authenticates a persistent WebSocket, manages the
//! session lifecycle, throttles ephemeral presence, and submits opaque
//! document operations to the external conflict-resolution engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────── CollaborationRuntime ─────────────────────────┐
//! │                                                                        │
//! │  SessionController ──► CollabEngine (external, trait)                  │
//! │        │    ▲                │                                         │
//! │        │    └── dispatcher ◄─┘ typed event stream                      │
//! │        ▼                                                               │
//! │  Transport ──► TokenManager ──► credential endpoint                    │
//! │        │                                                               │
//! │  PresenceSynchronizer (throttled cursor/selection broadcasts)          │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`token`] — credential fetch, cache, scheduled refresh
//! - [`transport`] — authenticated WebSocket with bounded reconnection
//! - [`protocol`] — binary wire frames (bincode)
//! - [`engine`] — external engine contract and typed events
//! - [`session`] — session lifecycle, event dispatch, operation submission
//! - [`presence`] — trailing-edge throttled presence synchronization
//! - [`runtime`] — composition root
//! - [`testkit`] — in-process doubles for tests
//!
//! Conflict resolution, operation ordering, and durability all live behind
//! the [`engine::CollabEngine`] seam — this crate guarantees neither
//! ordering nor delivery of presence, and keeps no state across restarts.

pub mod config;
pub mod engine;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod testkit;
pub mod token;
pub mod transport;

// Re-exports for convenience
pub use config::CollabConfig;
pub use engine::{
    CollabEngine, CursorPosition, EngineEvent, Operation, PresenceEntry, PresenceUpdate,
    SelectionState, User, UserUpdate,
};
pub use error::CollabError;
pub use presence::PresenceSynchronizer;
pub use protocol::{EventPayload, FrameType, HelloPayload, RejectPayload, WireFrame};
pub use runtime::CollaborationRuntime;
pub use session::{SessionController, SessionSnapshot};
pub use token::{Credential, CredentialClaims, CredentialSource, HttpCredentialSource, TokenManager};
pub use transport::{ConnectionState, Transport, TransportEvent};
