//! Project socket protocol: frame shapes, close codes and upload framing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::models::{ExpenseUpdate, UploadMetadata};

/// Normal closure; terminal.
pub const CLOSE_NORMAL: u16 = 1000;
/// Peer is going away; terminal.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Abnormal closure: transport drop, read error or heartbeat timeout.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Application code the backend uses when the socket token is rejected.
pub const CLOSE_AUTH_FAILED: u16 = 4001;

/// Size of the big-endian metadata length prefix of a framed upload.
pub const UPLOAD_PREFIX_LEN: usize = 4;

/// Control frames the client sends.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Ping,
    Authentication { token: String },
}

/// Inbound text frame, classified at the boundary.
///
/// The wire format has no discriminator for domain pushes: a `{"type":"pong"}`
/// object is a heartbeat reply, an object with a string `error` is a
/// non-fatal server error, and every other object is an expense update.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerFrame {
    Pong,
    ServerError(String),
    ExpenseUpdate(ExpenseUpdate),
}

impl ServerFrame {
    /// Classify a text frame. Anything that is not a JSON object is a
    /// protocol error; every other object is a pong, a server error or an
    /// update carrying the object in [`ExpenseUpdate::raw`].
    pub fn parse(text: &str) -> Result<Self, SyncError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(object) = value else {
            return Err(SyncError::Protocol(format!(
                "expected a JSON object, got {}",
                json_kind(&value)
            )));
        };

        if object.get("type").and_then(Value::as_str) == Some("pong") {
            return Ok(ServerFrame::Pong);
        }
        if let Some(Value::String(message)) = object.get("error") {
            return Ok(ServerFrame::ServerError(message.clone()));
        }

        let mut update: ExpenseUpdate =
            serde_json::from_value(Value::Object(object.clone())).unwrap_or_default();
        update.raw = object;
        Ok(ServerFrame::ExpenseUpdate(update))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Build the binary upload frame:
/// `[u32 BE metadata length][metadata JSON][file bytes]`.
pub fn encode_upload(metadata: &UploadMetadata, file: &[u8]) -> Result<Vec<u8>, SyncError> {
    let json = serde_json::to_vec(metadata)?;
    let len = u32::try_from(json.len())
        .map_err(|_| SyncError::Protocol("upload metadata too large".to_string()))?;

    let mut frame = Vec::with_capacity(UPLOAD_PREFIX_LEN + json.len() + file.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);
    frame.extend_from_slice(file);
    Ok(frame)
}

/// Split a binary upload frame back into its metadata and file bytes.
pub fn decode_upload(frame: &[u8]) -> Result<(UploadMetadata, Vec<u8>), SyncError> {
    let Some((prefix, rest)) = frame.split_first_chunk::<UPLOAD_PREFIX_LEN>() else {
        return Err(SyncError::Protocol(format!(
            "upload frame shorter than its {UPLOAD_PREFIX_LEN}-byte length prefix"
        )));
    };

    let len = u32::from_be_bytes(*prefix) as usize;
    if rest.len() < len {
        return Err(SyncError::Protocol(format!(
            "upload metadata length {len} exceeds remaining {} bytes",
            rest.len()
        )));
    }

    let (json, file) = rest.split_at(len);
    let metadata = serde_json::from_slice(json)?;
    Ok((metadata, file.to_vec()))
}

/// Check if a host is a local/development address.
pub fn is_local_address(host: &str) -> bool {
    let host_part = host.split(':').next().unwrap_or(host);
    host_part == "localhost"
        || host_part == "127.0.0.1"
        || host_part == "0.0.0.0"
        || host_part.starts_with("192.168.")
        || host_part.starts_with("10.")
}
