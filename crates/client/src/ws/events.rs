//! User-visible notices raised by the sync layer.

use std::fmt;

/// Something the UI should surface to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A command was dropped because the socket is not open.
    ConnectionUnavailable,
    /// The server reported a non-fatal error for one request.
    ServerError(String),
    /// Credentials could not be renewed; the user must log in again.
    SessionExpired,
    /// Reconnect attempts are exhausted; the connection stays closed.
    ConnectionLost,
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::ConnectionUnavailable => {
                "Real-time connection unavailable, please try again".to_string()
            }
            Notice::ServerError(message) => message.clone(),
            Notice::SessionExpired => "Your session has expired, please log in again".to_string(),
            Notice::ConnectionLost => "Connection lost, please refresh the page".to_string(),
        }
    }

    /// Whether the connection will not recover without user action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Notice::SessionExpired | Notice::ConnectionLost)
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}
