//! Shared types for the cinebudget expense sync client and its backend contract.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
