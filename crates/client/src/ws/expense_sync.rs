//! The surface UI code uses to follow one project's expenses in real time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cinebudget_shared::{encode_upload, ExpenseCommand, ExpenseUpdate, SyncError, UploadMetadata};
use tokio::sync::{broadcast, oneshot, watch};

use super::connection::{Command, ConnectionContext, ConnectionHandle, ReadyState};
use super::events::Notice;
use super::router::{ListenerId, ListenerRegistry};
use super::transport::{Connector, TungsteniteConnector};
use crate::config::SyncConfig;
use crate::token_refresh::{TokenRefresh, TokenRefresher};
use crate::token_store::TokenStore;

const NOTICE_CAPACITY: usize = 64;

/// Real-time expense synchronization for one project at a time.
///
/// Holds at most one live connection. Connecting to another project closes
/// the previous socket first; dropping the facade closes it too.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use cinebudget_client::{ExpenseSync, MemoryTokenStore, SyncConfig};
/// # async fn demo() -> Result<(), cinebudget_shared::SyncError> {
/// let tokens = Arc::new(MemoryTokenStore::new());
/// let mut sync = ExpenseSync::new(SyncConfig::from_env(), tokens)?;
/// sync.add_message_listener(|update| {
///     println!("budget gap is now {:?}", update.budget_gap);
///     Ok(())
/// });
/// sync.connect("42").await?;
/// sync.update_expense(7, 120.0, "Fuel");
/// # Ok(())
/// # }
/// ```
pub struct ExpenseSync {
    ctx: ConnectionContext,
    connection: Option<ConnectionHandle>,
}

impl ExpenseSync {
    /// Facade over the real transport and the HTTP token refresher.
    pub fn new(config: SyncConfig, tokens: Arc<dyn TokenStore>) -> Result<Self, SyncError> {
        let refresher = TokenRefresher::new(&config, tokens.clone())?;
        Ok(Self::with_parts(
            config,
            tokens,
            Arc::new(refresher),
            Arc::new(TungsteniteConnector),
        ))
    }

    /// Facade over caller-supplied collaborators. The refresher should be the
    /// same instance the HTTP client uses.
    pub fn with_parts(
        config: SyncConfig,
        tokens: Arc<dyn TokenStore>,
        refresher: Arc<dyn TokenRefresh>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (state, _) = watch::channel(ReadyState::Idle);
        Self {
            ctx: ConnectionContext {
                config: Arc::new(config),
                tokens,
                refresher,
                connector,
                listeners: ListenerRegistry::new(),
                notices,
                state: Arc::new(state),
                attempts: Arc::new(AtomicU32::new(0)),
            },
            connection: None,
        }
    }

    /// Connect to `project_id`'s channel.
    ///
    /// Returns `Ok(())` immediately if a connection to the same project is
    /// already live. Otherwise any previous connection is closed first and
    /// this resolves after the first open attempt: `Err(Auth)` is terminal,
    /// `Err(Transport)` means reconnects are already scheduled.
    pub async fn connect(&mut self, project_id: &str) -> Result<(), SyncError> {
        if let Some(current) = &self.connection {
            if current.project_id() == project_id && current.is_live() {
                tracing::debug!(project_id, "already connected");
                return Ok(());
            }
        }
        if let Some(previous) = self.connection.take() {
            tracing::info!(from = previous.project_id(), to = project_id, "switching project");
            previous.shutdown().await;
        }

        self.ctx.attempts.store(0, Ordering::SeqCst);
        let (handle, first_attempt) =
            ConnectionHandle::spawn(project_id.to_string(), self.ctx.clone());
        self.connection = Some(handle);

        first_attempt.await.unwrap_or_else(|_| {
            Err(SyncError::Transport(
                "connection ended before its first attempt".to_string(),
            ))
        })
    }

    /// Register a callback for every expense update. Listeners run in
    /// registration order; one that fails does not affect the others.
    pub fn add_message_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ExpenseUpdate) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ctx.listeners.add(Arc::new(listener))
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.ctx.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.ctx.listeners.len()
    }

    /// Returns `false` without writing anything when the socket is not open.
    /// `true` means the command was queued to the open socket; if that socket
    /// closes before writing it, [`Notice::ConnectionUnavailable`] is raised.
    pub fn update_expense(&self, subactivity_id: i64, amount_spent: f64, name: &str) -> bool {
        self.send_command(&ExpenseCommand::UpdateExpense {
            subactivity_id,
            amount_spent,
            name: name.to_string(),
        })
    }

    /// Same contract as [`ExpenseSync::update_expense`].
    pub fn delete_expense(&self, expense_id: i64) -> bool {
        self.send_command(&ExpenseCommand::DeleteExpense { expense_id })
    }

    /// Create an expense with its proof of payment in one binary frame and
    /// wait for the server's answer.
    ///
    /// The answer is also delivered to listeners. Only one upload may be
    /// outstanding per connection.
    pub async fn send_expense_with_attachment(
        &self,
        metadata: &UploadMetadata,
        file: &[u8],
    ) -> Result<ExpenseUpdate, SyncError> {
        let frame = encode_upload(metadata, file)?;
        let Some(connection) = self.open_connection() else {
            self.ctx.notices.send(Notice::ConnectionUnavailable).ok();
            return Err(SyncError::Transport("connection is not open".to_string()));
        };

        let (reply, answer) = oneshot::channel();
        if !connection.send(Command::Upload { frame, reply }) {
            self.ctx.notices.send(Notice::ConnectionUnavailable).ok();
            return Err(SyncError::Transport("connection is not open".to_string()));
        }
        answer.await.unwrap_or_else(|_| {
            Err(SyncError::Transport(
                "connection closed before the upload was answered".to_string(),
            ))
        })
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.ctx.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Reconnect attempts since the socket was last open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.ctx.attempts.load(Ordering::SeqCst)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.connection.as_ref().map(ConnectionHandle::project_id)
    }

    pub fn state_changes(&self) -> watch::Receiver<ReadyState> {
        self.ctx.state.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.ctx.notices.subscribe()
    }

    /// Close with 1000, cancel heartbeat and reconnect timers and drop every
    /// listener. Safe to call more than once.
    pub async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            tracing::info!(project_id = connection.project_id(), "disconnecting");
            connection.shutdown().await;
        }
        self.ctx.listeners.clear();
    }

    fn open_connection(&self) -> Option<&ConnectionHandle> {
        self.connection
            .as_ref()
            .filter(|_| self.ready_state() == ReadyState::Open)
    }

    fn send_command(&self, command: &ExpenseCommand) -> bool {
        let Some(connection) = self.open_connection() else {
            tracing::debug!(?command, "socket not open, command not sent");
            self.ctx.notices.send(Notice::ConnectionUnavailable).ok();
            return false;
        };
        let text = match serde_json::to_string(command) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode command");
                return false;
            }
        };
        if connection.send(Command::Send(text)) {
            true
        } else {
            self.ctx.notices.send(Notice::ConnectionUnavailable).ok();
            false
        }
    }
}

impl Drop for ExpenseSync {
    fn drop(&mut self) {
        self.ctx.listeners.clear();
    }
}

impl std::fmt::Debug for ExpenseSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpenseSync")
            .field("project_id", &self.project_id())
            .field("state", &self.ready_state())
            .field("listeners", &self.ctx.listeners.len())
            .finish()
    }
}
