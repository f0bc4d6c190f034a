#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cinebudget_client::ws::{Connector, Frame, FrameSink, FrameStream, HeartbeatConfig};
use cinebudget_client::{
    ExpenseSync, MemoryTokenStore, ReadyState, SyncConfig, TokenRefresh, TokenStore,
};
use cinebudget_shared::{SyncError, TokenPair};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use url::Url;

pub const PONG: &str = r#"{"type":"pong"}"#;
pub const PING: &str = r#"{"type":"ping"}"#;

/// A JWT whose `exp` is `secs` from now on the wall clock.
pub fn token_expiring_in(secs: i64) -> String {
    token_with_claims(&format!(
        r#"{{"exp":{},"user_id":1}}"#,
        chrono::Utc::now().timestamp() + secs
    ))
}

pub fn token_with_claims(claims: &str) -> String {
    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(claims)
    )
}

pub fn url_token(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Refuse,
    RejectAuth,
}

pub struct Attempt {
    pub at: Instant,
    pub url: Url,
}

/// Test side of an accepted socket.
pub struct ServerEnd {
    to_client: Option<UnboundedSender<Result<Frame, SyncError>>>,
    from_client: UnboundedReceiver<Frame>,
}

impl ServerEnd {
    pub fn send_text(&self, text: &str) {
        self.push(Ok(Frame::Text(text.to_string())));
    }

    pub fn send_binary(&self, bytes: &[u8]) {
        self.push(Ok(Frame::Binary(bytes.to_vec())));
    }

    pub fn send_close(&self, code: u16) {
        self.push(Ok(Frame::Close {
            code,
            reason: String::new(),
        }));
    }

    pub fn send_read_error(&self) {
        self.push(Err(SyncError::Transport("connection reset".into())));
    }

    /// End the inbound stream without a close frame.
    pub fn drop_connection(&mut self) {
        self.to_client = None;
    }

    /// Next frame written by the client; `None` once the client side closed.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.from_client.next().await
    }

    /// A frame the client already wrote, without waiting.
    pub fn written(&mut self) -> Option<Frame> {
        self.from_client.next().now_or_never().flatten()
    }

    fn push(&self, frame: Result<Frame, SyncError>) {
        if let Some(tx) = &self.to_client {
            let _ = tx.unbounded_send(frame);
        }
    }
}

struct ConnectorState {
    attempts: Vec<Attempt>,
    servers: Vec<Option<ServerEnd>>,
    script: VecDeque<Outcome>,
    fallback: Outcome,
}

/// In-memory [`Connector`]. Outcomes are taken from the script in order and
/// fall back to a fixed outcome once it runs out.
pub struct MockConnector {
    state: Mutex<ConnectorState>,
    count: watch::Sender<usize>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Self::scripted(Vec::new(), Outcome::Accept)
    }

    pub fn scripted(script: Vec<Outcome>, fallback: Outcome) -> Arc<Self> {
        let (count, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(ConnectorState {
                attempts: Vec::new(),
                servers: Vec::new(),
                script: script.into(),
                fallback,
            }),
            count,
        })
    }

    pub fn set_fallback(&self, fallback: Outcome) {
        self.state.lock().unwrap().fallback = fallback;
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts.len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().attempts.iter().map(|a| a.at).collect()
    }

    /// Milliseconds between consecutive attempts.
    pub fn attempt_gaps_ms(&self) -> Vec<u128> {
        self.attempt_times()
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_millis())
            .collect()
    }

    pub fn url(&self, index: usize) -> Url {
        self.state.lock().unwrap().attempts[index].url.clone()
    }

    /// Take the server end of the `index`-th attempt (which must have been
    /// accepted).
    pub fn server(&self, index: usize) -> ServerEnd {
        self.state.lock().unwrap().servers[index]
            .take()
            .expect("attempt was not accepted or server end already taken")
    }

    pub async fn wait_for_attempts(&self, n: usize) {
        let mut rx = self.count.subscribe();
        rx.wait_for(|count| *count >= n).await.unwrap();
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<(FrameSink, FrameStream), SyncError> {
        let mut state = self.state.lock().unwrap();
        let outcome = state.script.pop_front().unwrap_or(state.fallback);
        state.attempts.push(Attempt {
            at: Instant::now(),
            url: url.clone(),
        });

        let result = match outcome {
            Outcome::Accept => {
                let (client_tx, from_client) = unbounded::<Frame>();
                let (to_client, client_rx) = unbounded::<Result<Frame, SyncError>>();
                state.servers.push(Some(ServerEnd {
                    to_client: Some(to_client),
                    from_client,
                }));
                let sink: FrameSink =
                    Box::pin(client_tx.sink_map_err(|e| SyncError::Transport(e.to_string())));
                let stream: FrameStream = Box::pin(client_rx);
                Ok((sink, stream))
            }
            Outcome::Refuse => {
                state.servers.push(None);
                Err(SyncError::Transport("connection refused".into()))
            }
            Outcome::RejectAuth => {
                state.servers.push(None);
                Err(SyncError::Auth("socket handshake rejected with HTTP 401".into()))
            }
        };

        let attempts = state.attempts.len();
        drop(state);
        self.count.send_replace(attempts);
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Succeed,
    RejectAuth,
    FailTransport,
}

/// [`TokenRefresh`] double that counts calls and stores a fresh pair on
/// success.
pub struct MockRefresher {
    store: Arc<MemoryTokenStore>,
    outcome: Mutex<RefreshOutcome>,
    calls: AtomicUsize,
}

impl MockRefresher {
    pub fn new(store: Arc<MemoryTokenStore>, outcome: RefreshOutcome) -> Arc<Self> {
        Arc::new(Self {
            store,
            outcome: Mutex::new(outcome),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_outcome(&self, outcome: RefreshOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresh for MockRefresher {
    async fn refresh(&self) -> Result<TokenPair, SyncError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = *self.outcome.lock().unwrap();
        match outcome {
            RefreshOutcome::Succeed => {
                let pair = TokenPair {
                    access: token_with_claims(&format!(
                        r#"{{"exp":{},"refreshed":{call}}}"#,
                        chrono::Utc::now().timestamp() + 3600
                    )),
                    refresh: format!("refresh-{call}"),
                };
                self.store.set(&pair);
                Ok(pair)
            }
            RefreshOutcome::RejectAuth => {
                Err(SyncError::Auth("Token is invalid or expired".into()))
            }
            RefreshOutcome::FailTransport => Err(SyncError::Transport("backend unreachable".into())),
        }
    }
}

pub struct Harness {
    pub sync: ExpenseSync,
    pub connector: Arc<MockConnector>,
    pub refresher: Arc<MockRefresher>,
    pub tokens: Arc<MemoryTokenStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(config(), MockConnector::new(), token_expiring_in(3600))
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self::build(config, MockConnector::new(), token_expiring_in(3600))
    }

    pub fn with_connector(connector: Arc<MockConnector>) -> Self {
        Self::build(config(), connector, token_expiring_in(3600))
    }

    pub fn with_access_token(access: String) -> Self {
        Self::build(config(), MockConnector::new(), access)
    }

    fn build(config: SyncConfig, connector: Arc<MockConnector>, access: String) -> Self {
        let tokens = Arc::new(MemoryTokenStore::with_tokens(TokenPair {
            access,
            refresh: "refresh-0".into(),
        }));
        let refresher = MockRefresher::new(tokens.clone(), RefreshOutcome::Succeed);
        let sync = ExpenseSync::with_parts(
            config,
            tokens.clone(),
            refresher.clone(),
            connector.clone(),
        );
        Self {
            sync,
            connector,
            refresher,
            tokens,
        }
    }

    pub async fn wait_for_state(&self, state: ReadyState) {
        let mut rx = self.sync.state_changes();
        rx.wait_for(|current| *current == state).await.unwrap();
    }

    pub fn access_token(&self) -> Option<String> {
        self.tokens.access_token()
    }
}

pub fn config() -> SyncConfig {
    SyncConfig::new("localhost:8000")
}

/// Heartbeat long enough to stay out of the way of a test.
pub fn quiet_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        ping_interval: Duration::from_secs(3600),
        pong_timeout: Duration::from_secs(5),
    }
}

/// Let spawned tasks run without advancing the paused clock.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
