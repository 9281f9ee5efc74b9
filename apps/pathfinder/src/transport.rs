//! Telemetry path selection: dedicated data channel when one is open
//! for the session, control-channel fallback otherwise. Callers never
//! learn which path carried their payload; only a total send failure
//! surfaces as an error.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::protocol::{encode_frame, ClientEvent, EmitKind};

/// Open data channels keyed by session id, shared between the
/// signaling callbacks (which register channels) and the transport
/// (which sends on them).
pub type ChannelMap = Arc<RwLock<HashMap<String, Arc<RTCDataChannel>>>>;

pub fn new_channel_map() -> ChannelMap {
    Arc::new(RwLock::new(HashMap::new()))
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("control channel queue is closed")]
    ControlChannelClosed,
}

pub struct DataChannelTransport {
    channels: ChannelMap,
    fallback: mpsc::UnboundedSender<ClientEvent>,
}

impl DataChannelTransport {
    pub fn new(channels: ChannelMap, fallback: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self { channels, fallback }
    }

    pub async fn send(
        &self,
        session_id: &str,
        kind: EmitKind,
        widget_id: &str,
        payload: &[u8],
    ) -> Result<(), SendError> {
        let channel = self.channels.read().get(session_id).cloned();
        if let Some(channel) = channel {
            if channel.ready_state() == RTCDataChannelState::Open {
                // The widget-id length bound is a constraint of the
                // binary framing only; a payload that does not frame
                // still goes out over the JSON path.
                match encode_frame(kind, widget_id, payload) {
                    Ok(frame) => match channel.send(&frame).await {
                        Ok(_) => return Ok(()),
                        Err(err) => {
                            // Path selection stays silent to the caller.
                            debug!(
                                target: "transport",
                                session_id,
                                error = %err,
                                "data channel send failed; using control channel"
                            );
                        }
                    },
                    Err(err) => {
                        debug!(
                            target: "transport",
                            session_id,
                            error = %err,
                            "payload does not frame; using control channel"
                        );
                    }
                }
            }
        }
        self.send_fallback(session_id, kind, widget_id, payload)
    }

    fn send_fallback(
        &self,
        session_id: &str,
        kind: EmitKind,
        widget_id: &str,
        payload: &[u8],
    ) -> Result<(), SendError> {
        let event = match kind {
            EmitKind::Image => ClientEvent::EmitImage {
                session_id: session_id.to_string(),
                widget_id: widget_id.to_string(),
                image: BASE64.encode(payload),
            },
            EmitKind::Text => ClientEvent::EmitText {
                session_id: session_id.to_string(),
                widget_id: widget_id.to_string(),
                text: String::from_utf8_lossy(payload).into_owned(),
            },
        };
        self.fallback
            .send(event)
            .map_err(|_| SendError::ControlChannelClosed)
    }
}
