use std::sync::Arc;

use async_trait::async_trait;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use reqwest::Client;
use shared::protocol::{codes, AuthTokens, Envelope, RefreshRequest};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Where the token pair lives between calls. Injected rather than ambient
/// so every test can hold its own isolated store.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Option<AuthTokens>;
    async fn store(&self, tokens: AuthTokens);
    async fn clear(&self);
}

/// Process-memory store; the surrounding shell persists the pair as
/// client-visible cookies and seeds this on startup.
#[derive(Default)]
pub struct MemoryCredentialStore {
    tokens: RwLock<Option<AuthTokens>>,
}

impl MemoryCredentialStore {
    pub fn new(tokens: Option<AuthTokens>) -> Self {
        Self {
            tokens: RwLock::new(tokens),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Option<AuthTokens> {
        self.tokens.read().await.clone()
    }

    async fn store(&self, tokens: AuthTokens) {
        *self.tokens.write().await = Some(tokens);
    }

    async fn clear(&self) {
        *self.tokens.write().await = None;
    }
}

/// Single-flight refresh of the access credential, shared by the HTTP
/// layer and transport reconnection. At most one refresh request is in
/// flight process-wide; concurrent callers await the same outcome.
pub struct TokenCoordinator {
    http: Client,
    refresh_url: String,
    store: Arc<dyn CredentialStore>,
    inflight: Mutex<Option<Shared<BoxFuture<'static, bool>>>>,
}

impl TokenCoordinator {
    pub fn new(api_base_url: &str, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            http: Client::new(),
            refresh_url: format!("{}/auth/refresh", api_base_url.trim_end_matches('/')),
            store,
            inflight: Mutex::new(None),
        }
    }

    /// Exchange the refresh credential for a new token pair. Returns true
    /// when the store now holds fresh credentials; false on any failure,
    /// with the stored pair left untouched. Never errors to callers.
    pub async fn refresh(&self) -> bool {
        let (fut, owner) = {
            let mut inflight = self.inflight.lock().await;
            match inflight.as_ref() {
                Some(fut) => (fut.clone(), false),
                None => {
                    let fut = execute_refresh(
                        self.http.clone(),
                        self.refresh_url.clone(),
                        Arc::clone(&self.store),
                    )
                    .boxed()
                    .shared();
                    *inflight = Some(fut.clone());
                    (fut, true)
                }
            }
        };

        let refreshed = fut.await;

        // Only the caller that started the flight retires it; late joiners
        // may still be polling their clone.
        if owner {
            *self.inflight.lock().await = None;
        }

        refreshed
    }
}

/// Posts directly with a bare client: the refresh endpoint must never go
/// through the 401-retry layer, or a rejected refresh would recurse.
async fn execute_refresh(
    http: Client,
    refresh_url: String,
    store: Arc<dyn CredentialStore>,
) -> bool {
    let Some(current) = store.load().await else {
        warn!("token refresh skipped: no credentials in store");
        return false;
    };

    let response = match http
        .post(&refresh_url)
        .json(&RefreshRequest {
            refresh_token: current.refresh_token,
        })
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            warn!("token refresh request failed: {err}");
            return false;
        }
    };

    let status = response.status();
    let envelope: Envelope<AuthTokens> = match response.json().await {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(status = status.as_u16(), "token refresh response unreadable: {err}");
            return false;
        }
    };

    if !envelope.is_success(&[codes::OK]) {
        warn!(code = %envelope.code, "token refresh rejected");
        return false;
    }

    let Some(tokens) = envelope.data else {
        warn!("token refresh succeeded without a token payload");
        return false;
    };

    store.store(tokens).await;
    info!("access credential refreshed");
    true
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
