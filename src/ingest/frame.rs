//! Bus frame decoding.
//!
//! Frames arrive as text-encoded JSON records. Decoding turns them into a
//! tagged [`EventPacket`] union; a frame without a sender id is
//! unattributable and rejected here, before any lookups happen.

use serde::Deserialize;
use thiserror::Error;

/// Wire kind discriminator of a bus frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameKind {
    Call,
    Msg,
}

/// Optional frame metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameMeta {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub network: Option<u64>,
}

/// Raw bus frame as received from the consumer.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    /// Event time in epoch milliseconds.
    #[serde(default)]
    pub time: i64,
    pub kind: FrameKind,
    #[serde(rename = "contextType", default)]
    pub context_type: String,
    #[serde(default)]
    pub group: bool,
    #[serde(default)]
    pub meta: Option<FrameMeta>,
}

/// Message activity event.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub sender: String,
    pub recipient: String,
    pub timestamp_ms: i64,
    pub group: bool,
    pub context: String,
    pub network: Option<u64>,
}

/// Call activity event.
#[derive(Debug, Clone)]
pub struct CallEvent {
    pub sender: String,
    pub recipient: String,
    pub timestamp_ms: i64,
    pub context: String,
    pub action: Option<String>,
    pub duration: Option<i64>,
    pub network: Option<u64>,
}

/// A decoded event packet.
#[derive(Debug, Clone)]
pub enum EventPacket {
    Call(CallEvent),
    Message(MessageEvent),
}

impl EventPacket {
    /// Raw sender id of the event.
    pub fn sender(&self) -> &str {
        match self {
            Self::Call(e) => &e.sender,
            Self::Message(e) => &e.sender,
        }
    }

    /// Event time in epoch milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        match self {
            Self::Call(e) => e.timestamp_ms,
            Self::Message(e) => e.timestamp_ms,
        }
    }

    /// Network id carried in the frame metadata, if any.
    pub fn network(&self) -> Option<u64> {
        match self {
            Self::Call(e) => e.network,
            Self::Message(e) => e.network,
        }
    }
}

/// Errors that can occur during frame decoding.
///
/// Both variants mean the frame is unattributable; callers drop it silently.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("undecodable frame: {0}")]
    Undecodable(#[from] serde_json::Error),

    #[error("frame carries no sender id")]
    MalformedFrame,
}

/// Decodes a text frame into an [`EventPacket`].
pub fn parse_frame(text: &str) -> Result<EventPacket, FrameError> {
    let raw: RawFrame = serde_json::from_str(text)?;

    if raw.from.is_empty() {
        return Err(FrameError::MalformedFrame);
    }

    let meta = raw.meta.unwrap_or_default();

    let packet = match raw.kind {
        FrameKind::Msg => EventPacket::Message(MessageEvent {
            sender: raw.from,
            recipient: raw.to,
            timestamp_ms: raw.time,
            group: raw.group,
            context: raw.context_type,
            network: meta.network,
        }),
        FrameKind::Call => EventPacket::Call(CallEvent {
            sender: raw.from,
            recipient: raw.to,
            timestamp_ms: raw.time,
            context: raw.context_type,
            action: meta.action,
            duration: meta.duration,
            network: meta.network,
        }),
    };

    Ok(packet)
}
