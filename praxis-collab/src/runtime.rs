//! Composition root for the collaboration client.
//!
//! A [`CollaborationRuntime`] is constructed once per client and injected
//! where needed — there are no module-level singletons, so tests can run
//! fully isolated instances side by side.

use std::sync::Arc;

use crate::config::CollabConfig;
use crate::engine::CollabEngine;
use crate::presence::PresenceSynchronizer;
use crate::session::{SessionController, SessionSnapshot, SharedState};
use crate::token::{CredentialSource, TokenManager};
use crate::transport::Transport;

/// Owns the token manager, transport, presence synchronizer, and session
/// controller of one collaboration client.
pub struct CollaborationRuntime {
    tokens: Arc<TokenManager>,
    transport: Arc<Transport>,
    presence: Arc<PresenceSynchronizer>,
    session: SessionController,
}

impl CollaborationRuntime {
    /// Build a runtime fetching credentials from the configured server.
    pub fn new(config: CollabConfig, engine: Arc<dyn CollabEngine>) -> Self {
        let tokens = Arc::new(TokenManager::new(&config));
        Self::assemble(config, engine, tokens)
    }

    /// Build a runtime with an explicit credential source.
    pub fn with_credential_source(
        config: CollabConfig,
        engine: Arc<dyn CollabEngine>,
        source: Arc<dyn CredentialSource>,
    ) -> Self {
        let tokens = Arc::new(TokenManager::with_source(&config, source));
        Self::assemble(config, engine, tokens)
    }

    fn assemble(
        config: CollabConfig,
        engine: Arc<dyn CollabEngine>,
        tokens: Arc<TokenManager>,
    ) -> Self {
        let transport = Arc::new(Transport::new(config.clone(), tokens.clone()));
        let state = SharedState::new();
        let presence = Arc::new(PresenceSynchronizer::new(
            engine.clone(),
            state.clone(),
            &config,
        ));
        let session = SessionController::new(engine, transport.clone(), state, presence.clone());

        Self {
            tokens,
            transport,
            presence,
            session,
        }
    }

    pub fn session(&self) -> &SessionController {
        &self.session
    }

    pub fn presence(&self) -> &PresenceSynchronizer {
        &self.presence
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// The current session snapshot.
    pub async fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.session.snapshot().await
    }

    /// Leave any active session, close the connection, and drop the
    /// credential. Pending timers are cancelled on every path.
    pub async fn shutdown(&self) {
        if let Err(e) = self.session.leave_session().await {
            log::warn!("leave during shutdown failed: {e}");
        }
        self.presence.cancel_pending().await;
        self.transport.disconnect().await;
        self.tokens.clear_token().await;
        log::info!("collaboration runtime shut down");
    }
}
