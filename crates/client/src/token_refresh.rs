//! Refresh-token exchange against `POST /api/token/refresh/`.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use cinebudget_shared::{try_error_detail, SyncError, TokenPair};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::token_store::TokenStore;

/// Something that can renew the session's token pair.
///
/// The socket's 4001 path and the HTTP 401 path share one instance.
#[async_trait]
pub trait TokenRefresh: Send + Sync {
    /// Exchange the stored refresh token for a new pair and persist it.
    async fn refresh(&self) -> Result<TokenPair, SyncError>;
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
    /// Only present when the backend rotates refresh tokens.
    refresh: Option<String>,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<TokenPair, SyncError>>>;

/// HTTP [`TokenRefresh`] that shares one in-flight request between all
/// concurrent callers.
pub struct TokenRefresher {
    http: Client,
    endpoint: String,
    store: Arc<dyn TokenStore>,
    in_flight: Mutex<Option<RefreshFuture>>,
}

impl fmt::Debug for TokenRefresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRefresher")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl TokenRefresher {
    pub fn new(config: &SyncConfig, store: Arc<dyn TokenStore>) -> Result<Self, SyncError> {
        let http = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: config.refresh_url(),
            store,
            in_flight: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn exchange(
        http: Client,
        endpoint: String,
        store: Arc<dyn TokenStore>,
    ) -> Result<TokenPair, SyncError> {
        let Some(refresh) = store.refresh_token() else {
            return Err(SyncError::Auth("no refresh token stored".to_string()));
        };

        tracing::debug!(%endpoint, "refreshing access token");
        let response = http
            .post(&endpoint)
            .json(&RefreshRequest { refresh: &refresh })
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail =
                try_error_detail(&body).unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            tracing::warn!(status = status.as_u16(), %detail, "token refresh rejected");
            return Err(SyncError::Auth(detail));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid refresh response: {e}")))?;
        let pair = TokenPair {
            access: body.access,
            refresh: body.refresh.unwrap_or(refresh),
        };
        store.set(&pair);
        tracing::info!("access token refreshed");
        Ok(pair)
    }
}

#[async_trait]
impl TokenRefresh for TokenRefresher {
    async fn refresh(&self) -> Result<TokenPair, SyncError> {
        let request = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(request) => {
                    tracing::debug!("joining in-flight token refresh");
                    request.clone()
                }
                None => {
                    let request = Self::exchange(
                        self.http.clone(),
                        self.endpoint.clone(),
                        self.store.clone(),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(request.clone());
                    request
                }
            }
        };

        let result = request.clone().await;

        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&request)) {
            *slot = None;
        }
        result
    }
}
