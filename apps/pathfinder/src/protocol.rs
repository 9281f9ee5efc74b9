//! Wire contract between the agent and the control server, plus the
//! binary framing used on a dedicated data channel.
//!
//! Control-channel messages are JSON text with a `type` discriminator.
//! Dedicated-channel telemetry frames are
//! `[kind:1][widget_id_len:1][widget_id][payload]` with kind `0x01` for
//! JPEG images and `0x02` for UTF-8 text.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::widgets::WidgetValue;

pub const FRAME_KIND_IMAGE: u8 = 0x01;
pub const FRAME_KIND_TEXT: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitKind {
    Image,
    Text,
}

impl EmitKind {
    fn tag(self) -> u8 {
        match self {
            EmitKind::Image => FRAME_KIND_IMAGE,
            EmitKind::Text => FRAME_KIND_TEXT,
        }
    }
}

/// SDP blob as exchanged in `signal_offer` / `signal_answer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// One trickle-ICE candidate as it crosses the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// Messages the server pushes down to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerCommand {
    RobotRegistered {
        success: bool,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    ExecuteCode {
        session_id: String,
        source_text: String,
    },
    StopExecution {
        session_id: String,
    },
    WidgetUpdate {
        widget_id: String,
        #[serde(flatten)]
        value: WidgetValue,
    },
    SignalOffer {
        session_id: String,
        description: SessionDescription,
    },
    SignalCandidate {
        session_id: String,
        candidate: Option<CandidateInit>,
    },
}

/// Messages the agent emits up to the server. `emit_image` carries its
/// payload base64-encoded because this is the JSON fallback path; the
/// dedicated channel sends raw bytes instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    RobotConnected {
        id: String,
        name: String,
        version: String,
    },
    Heartbeat {
        id: String,
    },
    Stdout {
        session_id: String,
        text: String,
    },
    Stderr {
        session_id: String,
        text: String,
    },
    Finished {
        session_id: String,
    },
    EmitImage {
        session_id: String,
        widget_id: String,
        image: String,
    },
    EmitText {
        session_id: String,
        widget_id: String,
        text: String,
    },
    SignalAnswer {
        session_id: String,
        description: SessionDescription,
    },
    SignalCandidate {
        session_id: String,
        candidate: Option<CandidateInit>,
    },
}

/// JSON text frames arriving on an open data channel. Widget updates are
/// the only kind the agent accepts there.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    WidgetUpdate {
        widget_id: String,
        #[serde(flatten)]
        value: WidgetValue,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("widget id is {0} bytes, limit is 255")]
    WidgetIdTooLong(usize),
    #[error("frame truncated")]
    Truncated,
    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("widget id is not valid utf-8")]
    InvalidWidgetId,
}

pub fn encode_frame(kind: EmitKind, widget_id: &str, payload: &[u8]) -> Result<Bytes, FrameError> {
    let id = widget_id.as_bytes();
    if id.len() > u8::MAX as usize {
        return Err(FrameError::WidgetIdTooLong(id.len()));
    }
    let mut buf = BytesMut::with_capacity(2 + id.len() + payload.len());
    buf.put_u8(kind.tag());
    buf.put_u8(id.len() as u8);
    buf.put_slice(id);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

pub fn decode_frame(data: &[u8]) -> Result<(EmitKind, &str, &[u8]), FrameError> {
    if data.len() < 2 {
        return Err(FrameError::Truncated);
    }
    let kind = match data[0] {
        FRAME_KIND_IMAGE => EmitKind::Image,
        FRAME_KIND_TEXT => EmitKind::Text,
        other => return Err(FrameError::UnknownKind(other)),
    };
    let id_len = data[1] as usize;
    if data.len() < 2 + id_len {
        return Err(FrameError::Truncated);
    }
    let widget_id =
        std::str::from_utf8(&data[2..2 + id_len]).map_err(|_| FrameError::InvalidWidgetId)?;
    Ok((kind, widget_id, &data[2 + id_len..]))
}
