//! One project socket: open, heartbeat, route, close, reconnect.
//!
//! Each connection is a single tokio task that owns the transport, the
//! heartbeat timers and the reconnect timer. The facade talks to it through
//! an unbounded command channel and observes it through a `watch` of
//! [`ReadyState`], so callbacks never race one another.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cinebudget_shared::{
    ControlFrame, ExpenseUpdate, SyncError, CLOSE_ABNORMAL, CLOSE_AUTH_FAILED, CLOSE_GOING_AWAY,
    CLOSE_NORMAL,
};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::events::Notice;
use super::heartbeat::{HeartbeatEvent, HeartbeatMonitor};
use super::reconnect::ReconnectPolicy;
use super::router::{ListenerRegistry, MessageRouter, Routed};
use super::transport::{Connector, Frame, FrameSink, FrameStream};
use crate::config::{SyncConfig, WsAuthMode};
use crate::token_refresh::TokenRefresh;
use crate::token_store::TokenStore;

/// Upper bound on flushing a close frame to a peer that may be gone.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a project socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// No connection has been requested yet.
    Idle,
    Connecting,
    Open,
    /// A client-initiated close is in progress.
    Closing,
    /// Closed; a reconnect may still be scheduled.
    Closed,
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadyState::Idle => write!(f, "Idle"),
            ReadyState::Connecting => write!(f, "Connecting"),
            ReadyState::Open => write!(f, "Open"),
            ReadyState::Closing => write!(f, "Closing"),
            ReadyState::Closed => write!(f, "Closed"),
        }
    }
}

pub(crate) type UploadReply = oneshot::Sender<Result<ExpenseUpdate, SyncError>>;

pub(crate) enum Command {
    /// A JSON text frame.
    Send(String),
    /// A framed attachment upload; answered by the next domain message.
    Upload { frame: Vec<u8>, reply: UploadReply },
    /// Close with 1000 and stop; acknowledged once the close frame is out.
    Disconnect(oneshot::Sender<()>),
}

/// Everything a connection task shares with the facade that spawned it.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub(crate) config: Arc<SyncConfig>,
    pub(crate) tokens: Arc<dyn TokenStore>,
    pub(crate) refresher: Arc<dyn TokenRefresh>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) notices: broadcast::Sender<Notice>,
    pub(crate) state: Arc<watch::Sender<ReadyState>>,
    pub(crate) attempts: Arc<AtomicU32>,
}

impl ConnectionContext {
    fn set_state(&self, next: ReadyState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            tracing::debug!(state = %next, "project socket state changed");
        }
    }

    fn notify(&self, notice: Notice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }
}

/// Owner side of a running connection task.
pub(crate) struct ConnectionHandle {
    project_id: String,
    commands: UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    /// Spawn the task for `project_id`. The receiver resolves with the
    /// outcome of the first open attempt.
    pub(crate) fn spawn(
        project_id: String,
        ctx: ConnectionContext,
    ) -> (Self, oneshot::Receiver<Result<(), SyncError>>) {
        let (commands, receiver) = unbounded();
        let (first_tx, first_rx) = oneshot::channel();

        let task = ConnectionTask {
            id: Uuid::new_v4(),
            project_id: project_id.clone(),
            router: MessageRouter::new(ctx.listeners.clone(), ctx.notices.clone()),
            policy: ReconnectPolicy::new(ctx.config.reconnect.clone()),
            ctx,
            commands: receiver,
            first_attempt: Some(first_tx),
        };
        let task = tokio::spawn(task.run());

        (
            Self {
                project_id,
                commands,
                task: Some(task),
            },
            first_rx,
        )
    }

    pub(crate) fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Whether the task is still running (open, opening or waiting to retry).
    pub(crate) fn is_live(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub(crate) fn send(&self, command: Command) -> bool {
        self.commands.unbounded_send(command).is_ok()
    }

    /// Close with 1000, cancel any pending timer and wait for the task to end.
    pub(crate) async fn shutdown(mut self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.send(Command::Disconnect(ack_tx)) {
            let _ = ack_rx.await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(project_id = %self.project_id, error = %e, "connection task failed");
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let (ack_tx, _) = oneshot::channel();
            let _ = self.commands.unbounded_send(Command::Disconnect(ack_tx));
        }
    }
}

struct Link {
    sink: FrameSink,
    stream: FrameStream,
}

enum Next {
    Connect,
    Retry(Duration),
    /// Terminal: no reconnect will follow.
    Stop,
    Shutdown(Option<oneshot::Sender<()>>),
}

enum Exit {
    Closed { code: u16, reason: String },
    Disconnected(Option<oneshot::Sender<()>>),
}

struct ConnectionTask {
    id: Uuid,
    project_id: String,
    ctx: ConnectionContext,
    router: MessageRouter,
    policy: ReconnectPolicy,
    commands: UnboundedReceiver<Command>,
    first_attempt: Option<oneshot::Sender<Result<(), SyncError>>>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut next = Next::Connect;
        loop {
            next = match next {
                Next::Connect => self.attempt().await,
                Next::Retry(delay) => match self.until_disconnect(tokio::time::sleep(delay)).await {
                    Ok(()) => Next::Connect,
                    Err(ack) => Next::Shutdown(ack),
                },
                Next::Stop => {
                    self.ctx.set_state(ReadyState::Closed);
                    tracing::info!(
                        connection_id = %self.id,
                        project_id = %self.project_id,
                        "project socket stopped"
                    );
                    break;
                }
                Next::Shutdown(ack) => {
                    self.ctx.set_state(ReadyState::Closed);
                    tracing::info!(
                        connection_id = %self.id,
                        project_id = %self.project_id,
                        "project socket disconnected"
                    );
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    break;
                }
            };
        }

        // Reject whatever was queued after the socket went away.
        self.commands.close();
        while let Ok(Some(command)) = self.commands.try_next() {
            self.reject(command);
        }
    }

    /// Await `fut` while serving the command channel. A disconnect (or the
    /// owner going away) abandons `fut`; other commands are rejected since
    /// the socket is not open.
    async fn until_disconnect<F: Future>(
        &mut self,
        fut: F,
    ) -> Result<F::Output, Option<oneshot::Sender<()>>> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Ok(output),
                command = self.commands.next() => match command {
                    Some(Command::Disconnect(ack)) => return Err(Some(ack)),
                    None => return Err(None),
                    Some(other) => self.reject(other),
                },
            }
        }
    }

    fn reject(&self, command: Command) {
        match command {
            Command::Send(_) => {
                tracing::debug!(project_id = %self.project_id, "dropping command, socket not open");
                self.ctx.notify(Notice::ConnectionUnavailable);
            }
            Command::Upload { reply, .. } => {
                let _ = reply.send(Err(SyncError::Transport("connection is not open".to_string())));
            }
            Command::Disconnect(ack) => {
                let _ = ack.send(());
            }
        }
    }

    fn report_first(&mut self, result: Result<(), SyncError>) {
        if let Some(tx) = self.first_attempt.take() {
            let _ = tx.send(result);
        }
    }

    async fn attempt(&mut self) -> Next {
        self.ctx.set_state(ReadyState::Connecting);
        let first = self.first_attempt.is_some();

        let opened = self
            .until_disconnect(open_link(self.ctx.clone(), self.project_id.clone()))
            .await;
        let link = match opened {
            Err(ack) => return Next::Shutdown(ack),
            Ok(Ok(link)) => link,
            Ok(Err(e)) if e.is_auth() => {
                tracing::warn!(
                    connection_id = %self.id,
                    project_id = %self.project_id,
                    error = %e,
                    "project socket could not authenticate"
                );
                if !first {
                    self.force_logout(&e);
                }
                self.report_first(Err(e));
                return Next::Stop;
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    project_id = %self.project_id,
                    code = CLOSE_ABNORMAL,
                    error = %e,
                    "project socket failed to open"
                );
                self.report_first(Err(e));
                return self.schedule_reconnect();
            }
        };

        self.policy.reset();
        self.ctx.attempts.store(0, Ordering::SeqCst);
        self.ctx.set_state(ReadyState::Open);
        tracing::info!(
            connection_id = %self.id,
            project_id = %self.project_id,
            "project socket open"
        );
        self.report_first(Ok(()));

        match self.drive(link).await {
            Exit::Closed { code, reason } => self.handle_close(code, &reason).await,
            Exit::Disconnected(ack) => Next::Shutdown(ack),
        }
    }

    /// Serve an open link until it closes or the owner disconnects.
    async fn drive(&mut self, link: Link) -> Exit {
        let Link {
            mut sink,
            mut stream,
        } = link;
        let mut heartbeat = HeartbeatMonitor::start(&self.ctx.config.heartbeat);
        let mut pending_upload: Option<UploadReply> = None;

        let exit = loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(Frame::Text(text))) => match self.router.route_text(&text) {
                        Routed::Pong => heartbeat.pong_received(),
                        Routed::ServerError(message) => {
                            if let Some(reply) = pending_upload.take() {
                                let _ = reply.send(Err(SyncError::Server(message)));
                            }
                        }
                        Routed::Update(update) => {
                            if let Some(reply) = pending_upload.take() {
                                let _ = reply.send(Ok(update));
                            }
                        }
                        Routed::Dropped(e) => {
                            if let Some(reply) = pending_upload.take() {
                                let _ = reply.send(Err(e));
                            }
                        }
                    },
                    Some(Ok(Frame::Binary(bytes))) => {
                        tracing::debug!(len = bytes.len(), "ignoring inbound binary frame");
                    }
                    Some(Ok(Frame::Close { code, reason })) => break Exit::Closed { code, reason },
                    Some(Err(e)) => {
                        break Exit::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: e.to_string(),
                        }
                    }
                    None => {
                        break Exit::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: "stream ended without a close frame".to_string(),
                        }
                    }
                },
                event = heartbeat.next_event() => match event {
                    HeartbeatEvent::Ping => match control_text(&ControlFrame::Ping) {
                        Ok(ping) => {
                            if let Err(e) = sink.send(Frame::Text(ping)).await {
                                break Exit::Closed {
                                    code: CLOSE_ABNORMAL,
                                    reason: e.to_string(),
                                };
                            }
                            heartbeat.ping_sent();
                        }
                        Err(e) => tracing::error!(error = %e, "failed to encode ping"),
                    },
                    HeartbeatEvent::PongOverdue => {
                        tracing::warn!(
                            connection_id = %self.id,
                            project_id = %self.project_id,
                            last_pong_at = ?heartbeat.last_pong_at(),
                            "pong overdue, closing project socket"
                        );
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                        break Exit::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: "heartbeat timeout".to_string(),
                        };
                    }
                },
                command = self.commands.next() => match command {
                    Some(Command::Send(text)) => {
                        if let Err(e) = sink.send(Frame::Text(text)).await {
                            break Exit::Closed {
                                code: CLOSE_ABNORMAL,
                                reason: e.to_string(),
                            };
                        }
                    }
                    Some(Command::Upload { frame, reply }) => {
                        if pending_upload.as_ref().is_some_and(|waiting| !waiting.is_closed()) {
                            let _ = reply.send(Err(SyncError::UploadInFlight));
                            continue;
                        }
                        tracing::debug!(len = frame.len(), "sending attachment upload");
                        match sink.send(Frame::Binary(frame)).await {
                            Ok(()) => pending_upload = Some(reply),
                            Err(e) => {
                                let _ = reply.send(Err(e.clone()));
                                break Exit::Closed {
                                    code: CLOSE_ABNORMAL,
                                    reason: e.to_string(),
                                };
                            }
                        }
                    }
                    Some(Command::Disconnect(ack)) => {
                        self.ctx.set_state(ReadyState::Closing);
                        close_link(&mut sink).await;
                        break Exit::Disconnected(Some(ack));
                    }
                    None => {
                        self.ctx.set_state(ReadyState::Closing);
                        close_link(&mut sink).await;
                        break Exit::Disconnected(None);
                    }
                },
            }
        };

        if let Some(reply) = pending_upload.take() {
            let _ = reply.send(Err(SyncError::Transport(
                "connection closed before the upload was answered".to_string(),
            )));
        }
        exit
    }

    async fn handle_close(&mut self, code: u16, reason: &str) -> Next {
        self.ctx.set_state(ReadyState::Closed);
        tracing::info!(
            connection_id = %self.id,
            project_id = %self.project_id,
            code,
            reason,
            "project socket closed"
        );

        match code {
            CLOSE_NORMAL | CLOSE_GOING_AWAY => Next::Stop,
            CLOSE_AUTH_FAILED => match self.refresh().await {
                Err(ack) => Next::Shutdown(ack),
                Ok(Ok(())) => Next::Retry(self.ctx.config.auth_retry_delay),
                Ok(Err(e)) => {
                    self.force_logout(&e);
                    Next::Stop
                }
            },
            CLOSE_ABNORMAL if self.access_token_expired() => match self.refresh().await {
                Err(ack) => Next::Shutdown(ack),
                Ok(Ok(())) => Next::Connect,
                Ok(Err(e)) if e.is_auth() => {
                    self.force_logout(&e);
                    Next::Stop
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "token refresh failed, backing off");
                    self.schedule_reconnect()
                }
            },
            _ => self.schedule_reconnect(),
        }
    }

    async fn refresh(&mut self) -> Result<Result<(), SyncError>, Option<oneshot::Sender<()>>> {
        let refresher = self.ctx.refresher.clone();
        self.until_disconnect(async move { refresher.refresh().await.map(|_| ()) })
            .await
    }

    fn access_token_expired(&self) -> bool {
        match self.ctx.tokens.access_token() {
            Some(token) => self.ctx.tokens.is_expired(&token),
            None => true,
        }
    }

    fn schedule_reconnect(&mut self) -> Next {
        match self.policy.next_delay() {
            Some(delay) => {
                let attempt = self.policy.attempts();
                self.ctx.attempts.store(attempt, Ordering::SeqCst);
                tracing::info!(
                    connection_id = %self.id,
                    project_id = %self.project_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                Next::Retry(delay)
            }
            None => {
                let err = SyncError::ExhaustedRetries {
                    attempts: self.policy.attempts(),
                };
                tracing::error!(
                    connection_id = %self.id,
                    project_id = %self.project_id,
                    error = %err,
                    "giving up on project socket"
                );
                self.ctx.notify(Notice::ConnectionLost);
                Next::Stop
            }
        }
    }

    fn force_logout(&self, cause: &SyncError) {
        tracing::warn!(
            project_id = %self.project_id,
            error = %cause,
            "session could not be renewed, logging out"
        );
        self.ctx.tokens.clear();
        self.ctx.notify(Notice::SessionExpired);
    }
}

/// Make sure the access token is usable, build the URL and open the
/// transport. In frame-auth mode the authentication frame is the first thing
/// written.
async fn open_link(ctx: ConnectionContext, project_id: String) -> Result<Link, SyncError> {
    let token = match ctx.tokens.access_token() {
        Some(token) if !ctx.tokens.is_expired(&token) => token,
        Some(_) => {
            tracing::debug!(%project_id, "access token expired, refreshing before connect");
            ctx.refresher.refresh().await?.access
        }
        None => return Err(SyncError::Auth("no access token stored".to_string())),
    };

    let url = ctx.config.ws_url(&project_id, &token)?;
    tracing::debug!(%project_id, path = url.path(), "opening project socket");
    let (mut sink, stream) = ctx.connector.connect(&url).await?;

    if ctx.config.auth_mode == WsAuthMode::AuthFrame {
        let frame = control_text(&ControlFrame::Authentication { token })?;
        sink.send(Frame::Text(frame)).await?;
    }

    Ok(Link { sink, stream })
}

fn control_text(frame: &ControlFrame) -> Result<String, SyncError> {
    Ok(serde_json::to_string(frame)?)
}

async fn close_link(sink: &mut FrameSink) {
    let close = async {
        sink.send(Frame::Close {
            code: CLOSE_NORMAL,
            reason: "client disconnect".to_string(),
        })
        .await?;
        sink.close().await
    };
    match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "close frame not delivered"),
        Err(_) => tracing::debug!("timed out sending close frame"),
    }
}
