//! Credential lifecycle: fetch, cache, scheduled refresh.
//!
//! The server issues short-lived CSRF credentials from
//! `GET {server_url}/api/collaboration/csrf-token` (cookie-credentialed,
//! JSON `{csrfToken, sessionId}`). The endpoint returns no TTL, so the
//! client fabricates one (`CollabConfig::token_ttl`, 1 hour by default) and
//! schedules a background refresh shortly before that expiry.
//!
//! The manager caches at most one live credential. A failed fetch never
//! touches the cache; a forced fetch always bypasses it.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CollabConfig;
use crate::error::CollabError;

/// A live authentication credential.
#[derive(Debug, Clone)]
pub struct Credential {
    pub csrf_token: String,
    pub session_id: String,
    pub expires_at: Instant,
}

impl Credential {
    /// Whether the credential has passed its claimed expiry.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Raw claims returned by a credential fetch, before the client stamps an
/// expiry onto them.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialClaims {
    pub csrf_token: String,
    pub session_id: String,
}

/// Where credentials come from.
///
/// Production uses [`HttpCredentialSource`]; tests inject deterministic
/// sources and drive virtual time instead of real endpoints.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<CredentialClaims, CollabError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CsrfTokenResponse {
    csrf_token: String,
    session_id: String,
}

/// Fetches credentials over HTTP with session cookies included.
pub struct HttpCredentialSource {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpCredentialSource {
    pub fn new(server_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint: format!(
                "{}/api/collaboration/csrf-token",
                server_url.trim_end_matches('/')
            ),
        }
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self) -> Result<CredentialClaims, CollabError> {
        let response = self
            .http
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| CollabError::TokenFetch(e.to_string()))?
            .error_for_status()
            .map_err(|e| CollabError::TokenFetch(e.to_string()))?;

        let body: CsrfTokenResponse = response
            .json()
            .await
            .map_err(|e| CollabError::TokenFetch(e.to_string()))?;

        Ok(CredentialClaims {
            csrf_token: body.csrf_token,
            session_id: body.session_id,
        })
    }
}

struct TokenInner {
    source: Arc<dyn CredentialSource>,
    auto_refresh: bool,
    refresh_threshold: Duration,
    ttl: Duration,
    cached: RwLock<Option<Arc<Credential>>>,
    refresh_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Acquires, caches, and auto-refreshes the client credential.
pub struct TokenManager {
    inner: Arc<TokenInner>,
}

impl TokenManager {
    /// Create a manager fetching from the configured server URL.
    pub fn new(config: &CollabConfig) -> Self {
        Self::with_source(config, Arc::new(HttpCredentialSource::new(&config.server_url)))
    }

    /// Create a manager with an explicit credential source.
    pub fn with_source(config: &CollabConfig, source: Arc<dyn CredentialSource>) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                source,
                auto_refresh: config.auto_refresh_token,
                refresh_threshold: config.token_refresh_threshold,
                ttl: config.token_ttl,
                cached: RwLock::new(None),
                refresh_task: StdMutex::new(None),
            }),
        }
    }

    /// Get a credential, fetching one if the cache is empty, expired, or
    /// bypassed via `force`.
    ///
    /// Two calls within the credential's validity return the same
    /// `Arc<Credential>`. A failed fetch leaves the cache untouched and
    /// propagates the error — no internal retry.
    pub async fn get_token(&self, force: bool) -> Result<Arc<Credential>, CollabError> {
        if !force {
            let cached = self.inner.cached.read().await;
            if let Some(cred) = cached.as_ref() {
                if !cred.is_expired() {
                    return Ok(cred.clone());
                }
            }
        }

        let cred = self.inner.fetch_fresh().await?;
        self.inner.schedule_refresh(cred.expires_at);
        Ok(cred)
    }

    /// The currently cached credential, if any.
    pub async fn current(&self) -> Option<Arc<Credential>> {
        self.inner.cached.read().await.clone()
    }

    /// Cancel any pending refresh and drop the cached credential.
    pub async fn clear_token(&self) {
        self.inner.cancel_refresh();
        *self.inner.cached.write().await = None;
        log::debug!("credential cache cleared");
    }
}

impl TokenInner {
    async fn fetch_fresh(&self) -> Result<Arc<Credential>, CollabError> {
        let claims = self.source.fetch().await?;
        let cred = Arc::new(Credential {
            csrf_token: claims.csrf_token,
            session_id: claims.session_id,
            expires_at: Instant::now() + self.ttl,
        });
        *self.cached.write().await = Some(cred.clone());
        log::debug!("credential acquired for session {}", cred.session_id);
        Ok(cred)
    }

    /// Arm the background refresh to fire at `expires_at - refresh_threshold`.
    /// Replaces (and cancels) any previously armed refresh.
    fn schedule_refresh(self: &Arc<Self>, expires_at: Instant) {
        if !self.auto_refresh {
            return;
        }

        let inner = self.clone();
        let mut expires_at = expires_at;
        let handle = tokio::spawn(async move {
            loop {
                let delay = expires_at
                    .duration_since(Instant::now())
                    .saturating_sub(inner.refresh_threshold);
                tokio::time::sleep(delay).await;

                match inner.fetch_fresh().await {
                    Ok(cred) => {
                        log::debug!("scheduled credential refresh completed");
                        expires_at = cred.expires_at;
                    }
                    Err(e) => {
                        // Cache untouched; the next get_token fetches on demand.
                        log::warn!("scheduled credential refresh failed: {e}");
                        break;
                    }
                }
            }
        });

        if let Some(old) = self.lock_task().replace(handle) {
            old.abort();
        }
    }

    fn cancel_refresh(&self) {
        if let Some(task) = self.lock_task().take() {
            task.abort();
        }
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        if let Ok(slot) = self.refresh_task.get_mut() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}
