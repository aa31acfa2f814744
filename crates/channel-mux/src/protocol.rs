//! Hub wire protocol: JSON frame types, classification, and encode/decode.

use serde::{Deserialize, Serialize};

use crate::Error;

// ---------------------------------------------------------------------------
// Frame type constants
// ---------------------------------------------------------------------------

pub mod kind {
    pub const AUTH: &str = "auth";
    pub const AUTH_ACK: &str = "auth_ack";
    pub const CHANNELS: &str = "channels";
    pub const MESSAGE: &str = "message";
}

/// `status` value of a successful `auth_ack`. Anything else is a rejection.
pub const AUTH_OK: &str = "ok";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A frame pushed by the hub.
///
/// Only `type` is required. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_channels: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct AuthMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    token: &'a str,
}

/// What the connection should do with a decoded frame.
#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    /// Replaces the supported-channel snapshot. Never routed to subscribers.
    ChannelList(Vec<String>),
    /// Handshake result.
    AuthAck {
        accepted: bool,
        message: Option<String>,
    },
    /// Routed to the subscribers of `channel`.
    Channel {
        channel: String,
        message: InboundMessage,
    },
    /// No channel and no control meaning.
    Unrecognized(String),
}

// ---------------------------------------------------------------------------
// Encode / decode helpers
// ---------------------------------------------------------------------------

pub fn decode_msg(text: &str) -> Result<InboundMessage, Error> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_auth_msg(token: &str) -> Result<String, Error> {
    Ok(serde_json::to_string(&AuthMessage {
        kind: kind::AUTH,
        token,
    })?)
}

pub(crate) fn classify(mut msg: InboundMessage) -> Frame {
    if let Some(list) = msg.available_channels.take() {
        return Frame::ChannelList(list);
    }
    if msg.kind == kind::AUTH_ACK {
        return Frame::AuthAck {
            accepted: msg.status.as_deref() == Some(AUTH_OK),
            message: msg.message.or(msg.status),
        };
    }
    match msg.channel.clone() {
        Some(channel) => Frame::Channel {
            channel,
            message: msg,
        },
        None => Frame::Unrecognized(msg.kind),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
