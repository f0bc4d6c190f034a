//! Cinebudget Client - real-time expense synchronization
//!
//! This crate contains the client side of the budget dashboard's live
//! expense feed: session tokens, token refresh, the per-project WebSocket
//! with heartbeat and reconnect, and the REST client that shares the same
//! refresh path.

pub mod api_client;
pub mod config;
pub mod storage;
pub mod token_refresh;
pub mod token_store;
pub mod ws;

pub use api_client::ApiClient;
pub use config::{SyncConfig, WsAuthMode};
pub use storage::Storage;
pub use token_refresh::{TokenRefresh, TokenRefresher};
pub use token_store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use ws::{ExpenseSync, ListenerId, Notice, ReadyState};
