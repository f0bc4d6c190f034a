//! HTTP API client with bearer tokens and refresh-on-401.

use std::sync::Arc;

use cinebudget_shared::{try_error_detail, ApiError, SyncError};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::SyncConfig;
use crate::token_refresh::TokenRefresh;
use crate::token_store::TokenStore;

/// HTTP client for the budget backend's REST API.
///
/// Requests carry `Authorization: Bearer <access>`. A 401 triggers one token
/// refresh through the same [`TokenRefresh`] the project socket uses, then one
/// retry; if the refresh fails the session is cleared.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenStore>,
    refresher: Arc<dyn TokenRefresh>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create a new API client
    pub fn new(
        config: &SyncConfig,
        tokens: Arc<dyn TokenStore>,
        refresher: Arc<dyn TokenRefresh>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.http_base_url(),
            tokens,
            refresher,
        })
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    fn request(&self, method: &Method, url: &str, body: Option<&[u8]>) -> RequestBuilder {
        let mut rb = self.client.request(method.clone(), url);
        if let Some(token) = self.tokens.access_token() {
            rb = rb.bearer_auth(token);
        }
        if let Some(body) = body {
            rb = rb
                .header("Content-Type", "application/json")
                .body(body.to_vec());
        }
        rb
    }

    /// Send a request, refreshing and retrying once on 401. Returns the
    /// response body of a successful call.
    async fn execute(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<String, ApiError> {
        let url = self.url(path);
        let (status, text) = self.send_once(&method, &url, body.as_deref()).await?;

        if status != StatusCode::UNAUTHORIZED {
            return check_status(status, text);
        }

        tracing::debug!(%url, "request unauthorized, refreshing token");
        match self.refresher.refresh().await {
            Ok(_) => {
                let (status, text) = self.send_once(&method, &url, body.as_deref()).await?;
                check_status(status, text)
            }
            Err(SyncError::Transport(e)) => Err(ApiError::Network(e)),
            Err(e) => {
                tracing::warn!(error = %e, "token refresh failed, clearing session");
                self.tokens.clear();
                Err(ApiError::Unauthorized(e.to_string()))
            }
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<(StatusCode, String), ApiError> {
        let resp = self
            .request(method, url, body)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;
        Ok((status, text))
    }

    /// Make an authenticated GET request
    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let text = self.execute(Method::GET, path, None).await?;
        parse_body(&text)
    }

    /// Make an authenticated POST request with JSON body
    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let body_bytes = serde_json::to_vec(body).map_err(|e| ApiError::Deserialize(e.to_string()))?;
        let text = self.execute(Method::POST, path, Some(body_bytes)).await?;
        parse_body(&text)
    }

    /// Make an authenticated DELETE request
    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.execute(Method::DELETE, path, None).await.map(|_| ())
    }
}

fn check_status(status: StatusCode, text: String) -> Result<String, ApiError> {
    if status == StatusCode::UNAUTHORIZED {
        let detail = try_error_detail(&text).unwrap_or_else(|| "unauthorized".to_string());
        return Err(ApiError::Unauthorized(detail));
    }
    if !status.is_success() {
        return Err(ApiError::Http {
            status: status.as_u16(),
            body: text,
        });
    }
    Ok(text)
}

fn parse_body<TRes: DeserializeOwned>(text: &str) -> Result<TRes, ApiError> {
    if text.is_empty() {
        serde_json::from_str("null").map_err(|e| ApiError::Deserialize(e.to_string()))
    } else {
        serde_json::from_str(text).map_err(|e| ApiError::Deserialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_store::MemoryTokenStore;
    use async_trait::async_trait;
    use cinebudget_shared::TokenPair;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StubRefresher {
        store: Arc<MemoryTokenStore>,
        succeed: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenRefresh for StubRefresher {
        async fn refresh(&self) -> Result<TokenPair, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.succeed {
                return Err(SyncError::Auth("refresh rejected".into()));
            }
            let pair = TokenPair {
                access: "fresh".into(),
                refresh: "r".into(),
            };
            self.store.set(&pair);
            Ok(pair)
        }
    }

    fn client(server: &MockServer, succeed: bool) -> (ApiClient, Arc<MemoryTokenStore>, Arc<StubRefresher>) {
        let store = Arc::new(MemoryTokenStore::with_tokens(TokenPair {
            access: "stale".into(),
            refresh: "r".into(),
        }));
        let refresher = Arc::new(StubRefresher {
            store: store.clone(),
            succeed,
            calls: AtomicUsize::new(0),
        });
        let config = SyncConfig::new(server.uri());
        let api = ApiClient::new(&config, store.clone(), refresher.clone()).unwrap();
        (api, store, refresher)
    }

    #[tokio::test]
    async fn sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects/4/"))
            .and(header("Authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 4})))
            .mount(&server)
            .await;

        let (api, _, refresher) = client(&server, true);
        let body: serde_json::Value = api.get_json("/api/projects/4/").await.unwrap();

        assert_eq!(body["id"], 4);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refreshes_and_retries_on_401() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects/"))
            .and(header("Authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/projects/"))
            .and(header("Authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let (api, _, refresher) = client(&server, true);
        let body: Vec<serde_json::Value> = api.get_json("api/projects/").await.unwrap();

        assert!(body.is_empty());
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_clears_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/expenses/"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let (api, store, _) = client(&server, false);
        let err = api
            .post_json::<_, serde_json::Value>("/api/expenses/", &serde_json::json!({"name": "Fuel"}))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Unauthorized(_)));
        assert_eq!(store.access_token(), None);
    }

    #[tokio::test]
    async fn second_401_is_not_retried_again() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/expenses/3/"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(serde_json::json!({"detail": "User is inactive"})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let (api, _, refresher) = client(&server, true);
        let err = api.delete("/api/expenses/3/").await.unwrap_err();

        assert_eq!(err, ApiError::Unauthorized("User is inactive".into()));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn http_errors_keep_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .mount(&server)
            .await;

        let (api, _, _) = client(&server, true);
        let err = api.get_json::<serde_json::Value>("/api/nope/").await.unwrap_err();

        assert_eq!(
            err,
            ApiError::Http {
                status: 404,
                body: "missing".into()
            }
        );
    }
}
