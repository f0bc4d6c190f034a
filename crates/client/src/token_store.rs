//! Session token storage.
//!
//! The access token is a JWT; its `exp` claim is read locally (no signature
//! check) to decide whether a refresh is needed before opening a socket.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cinebudget_shared::TokenPair;
use serde::Deserialize;

use crate::storage::Storage;

const STORAGE_KEY: &str = "session_tokens";

/// Holder of the session's access and refresh tokens.
///
/// Shared as `Arc<dyn TokenStore>` between the socket, the refresher and the
/// HTTP client. Writes are last-write-wins.
pub trait TokenStore: Send + Sync + fmt::Debug {
    fn access_token(&self) -> Option<String>;

    fn refresh_token(&self) -> Option<String>;

    fn set(&self, tokens: &TokenPair);

    fn clear(&self);

    /// Whether `token` is past its `exp` claim. Malformed tokens are expired.
    fn is_expired(&self, token: &str) -> bool {
        is_token_expired(token, chrono::Utc::now().timestamp())
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// The `exp` claim of a JWT, in seconds since the epoch.
pub fn token_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    claims.exp.map(|exp| exp as i64)
}

/// Whether `token` is expired at `now` (seconds since the epoch).
pub fn is_token_expired(token: &str, now: i64) -> bool {
    match token_expiry(token) {
        Some(exp) => exp <= now,
        None => true,
    }
}

/// Process-local token store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<Option<TokenPair>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: TokenPair) -> Self {
        Self {
            tokens: RwLock::new(Some(tokens)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn access_token(&self) -> Option<String> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        tokens.as_ref().map(|t| t.access.clone())
    }

    fn refresh_token(&self) -> Option<String> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        tokens.as_ref().map(|t| t.refresh.clone())
    }

    fn set(&self, tokens: &TokenPair) {
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = Some(tokens.clone());
    }

    fn clear(&self) {
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Token store persisted through [`Storage`], with an in-memory copy.
#[derive(Debug)]
pub struct FileTokenStore {
    storage: Storage,
    cached: MemoryTokenStore,
}

impl FileTokenStore {
    /// Open the store, loading any previously saved session.
    pub fn open(storage: Storage) -> Self {
        let cached = match storage.load::<TokenPair>(STORAGE_KEY) {
            Some(tokens) => MemoryTokenStore::with_tokens(tokens),
            None => MemoryTokenStore::new(),
        };
        Self { storage, cached }
    }
}

impl TokenStore for FileTokenStore {
    fn access_token(&self) -> Option<String> {
        self.cached.access_token()
    }

    fn refresh_token(&self) -> Option<String> {
        self.cached.refresh_token()
    }

    fn set(&self, tokens: &TokenPair) {
        self.cached.set(tokens);
        if !self.storage.save(STORAGE_KEY, tokens) {
            tracing::warn!("session tokens kept in memory only");
        }
    }

    fn clear(&self) {
        self.cached.clear();
        self.storage.remove(STORAGE_KEY);
    }
}
