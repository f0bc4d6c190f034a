//! Transport seam between the connection task and the WebSocket library.
//!
//! The connection task only sees [`Frame`]s flowing through a boxed sink and
//! stream. [`TungsteniteConnector`] provides them over tokio-tungstenite;
//! tests plug in an in-memory [`Connector`].

use std::pin::Pin;

use async_trait::async_trait;
use cinebudget_shared::SyncError;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

/// Close code reported when a close frame carries no status.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// A data or close frame, as seen by the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = SyncError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, SyncError>> + Send>>;

/// Opens a socket to a URL and hands back its two halves.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolve once the transport is open. A handshake rejected with 401 or
    /// 403 is [`SyncError::Auth`]; every other failure is
    /// [`SyncError::Transport`].
    async fn connect(&self, url: &Url) -> Result<(FrameSink, FrameStream), SyncError>;
}

/// [`Connector`] backed by tokio-tungstenite with rustls.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<(FrameSink, FrameStream), SyncError> {
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(handshake_error)?;
        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| SyncError::Transport(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, SyncError>(to_message(frame))));
        let stream = read.filter_map(|msg| future::ready(from_message(msg)));

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn handshake_error(err: WsError) -> SyncError {
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                SyncError::Auth(format!("socket handshake rejected with HTTP {status}"))
            } else {
                SyncError::Transport(format!("socket handshake failed with HTTP {status}"))
            }
        }
        other => SyncError::Transport(other.to_string()),
    }
}

pub(crate) fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::text(text),
        Frame::Binary(bytes) => Message::binary(bytes),
        Frame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

/// Map a tungstenite message to a [`Frame`]. Protocol-level pings and pongs
/// are answered by tungstenite itself and are skipped.
pub(crate) fn from_message(msg: Result<Message, WsError>) -> Option<Result<Frame, SyncError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
        Ok(Message::Binary(bytes)) => Some(Ok(Frame::Binary(bytes.to_vec()))),
        Ok(Message::Close(frame)) => {
            let (code, reason) = frame
                .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                .unwrap_or((CLOSE_NO_STATUS, String::new()));
            Some(Ok(Frame::Close { code, reason }))
        }
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(Err(SyncError::Transport(e.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_binary_convert_both_ways() {
        let text = to_message(Frame::Text(r#"{"type":"ping"}"#.into()));
        assert_eq!(
            from_message(Ok(text)),
            Some(Ok(Frame::Text(r#"{"type":"ping"}"#.into())))
        );

        let binary = to_message(Frame::Binary(vec![0, 0, 0, 2, b'{', b'}']));
        assert_eq!(
            from_message(Ok(binary)),
            Some(Ok(Frame::Binary(vec![0, 0, 0, 2, b'{', b'}'])))
        );
    }

    #[test]
    fn close_frame_keeps_code_and_reason() {
        let close = to_message(Frame::Close {
            code: 4001,
            reason: "token expired".into(),
        });
        assert_eq!(
            from_message(Ok(close)),
            Some(Ok(Frame::Close {
                code: 4001,
                reason: "token expired".into()
            }))
        );
    }

    #[test]
    fn close_without_status_defaults_to_1005() {
        assert_eq!(
            from_message(Ok(Message::Close(None))),
            Some(Ok(Frame::Close {
                code: CLOSE_NO_STATUS,
                reason: String::new()
            }))
        );
    }

    #[test]
    fn protocol_pings_are_skipped() {
        assert_eq!(from_message(Ok(Message::Ping(vec![1].into()))), None);
        assert_eq!(from_message(Ok(Message::Pong(vec![].into()))), None);
    }

    #[test]
    fn read_errors_are_transport_errors() {
        let err = from_message(Err(WsError::ConnectionClosed));
        assert!(matches!(err, Some(Err(SyncError::Transport(_)))));
    }

    #[test]
    fn handshake_errors_are_transport_errors_by_default() {
        assert!(matches!(
            handshake_error(WsError::ConnectionClosed),
            SyncError::Transport(_)
        ));
    }
}
