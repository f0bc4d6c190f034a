//! WebSocket module for real-time expense synchronization.
//!
//! This module provides:
//! - One managed socket per project, with heartbeat and auto-reconnect
//! - Token refresh on server-signaled auth failure (close code 4001)
//! - Fan-out of server-pushed expense updates to registered listeners
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    ExpenseSync                      │
//! │   (facade: connect, send commands, add listeners)   │
//! └─────────────────────────────────────────────────────┘
//!                         │ commands
//!                         ▼
//!              ┌─────────────────────┐
//!              │   connection task   │──── HeartbeatMonitor
//!              │  (one per project)  │──── ReconnectPolicy
//!              └─────────────────────┘──── TokenRefresh
//!                         │ frames
//!          ┌──────────────┼──────────────┐
//!          ▼                             ▼
//!   ┌─────────────┐              ┌──────────────┐
//!   │  Connector  │              │ MessageRouter│
//!   │ (transport) │              │  → listeners │
//!   └─────────────┘              └──────────────┘
//! ```
//!
//! # Usage
//!
//! UI code owns an [`ExpenseSync`], registers listeners and reads
//! [`ExpenseSync::state_changes`] / [`ExpenseSync::notices`] for connection
//! status. Sends return `false` while the socket is not open; nothing is
//! queued.

mod connection;
mod events;
mod expense_sync;
mod heartbeat;
mod reconnect;
mod router;
mod transport;

pub use connection::ReadyState;
pub use events::Notice;
pub use expense_sync::ExpenseSync;
pub use heartbeat::HeartbeatConfig;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use router::{Listener, ListenerId, ListenerRegistry, MessageRouter};
pub use transport::{Connector, Frame, FrameSink, FrameStream, TungsteniteConnector, CLOSE_NO_STATUS};
