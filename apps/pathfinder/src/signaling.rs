//! Per-session negotiation of the dedicated telemetry channel.
//!
//! The operator side creates the offer and the data channel; the agent
//! answers and trickles its own candidates back. Remote candidates can
//! arrive before the offer (or before the remote description has been
//! applied); those are buffered in arrival order and flushed exactly
//! once, which is the contract [`CandidateGate`] exists to keep.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::agent::AgentEvent;
use crate::protocol::{CandidateInit, ChannelMessage, SessionDescription};
use crate::transport::ChannelMap;
use crate::widgets::WidgetStore;

const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("expected an offer, got {0:?}")]
    NotAnOffer(String),
    #[error("answer was not stored as local description")]
    MissingLocalDescription,
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Idle,
    OfferReceived,
    AnswerSent,
    Connected,
    Closed,
}

/// FIFO buffer between candidate arrival and candidate application.
/// Closed until the remote description is applied: everything queues.
/// Released exactly once: the queued batch drains in arrival order.
/// Open afterwards: candidates pass straight through.
#[derive(Debug, Default)]
pub struct CandidateGate {
    open: bool,
    pending: VecDeque<CandidateInit>,
}

impl CandidateGate {
    /// `Some` means apply now, `None` means the candidate was queued.
    pub fn admit(&mut self, candidate: CandidateInit) -> Option<CandidateInit> {
        if self.open {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Open the gate and hand back the queued batch, oldest first.
    pub fn release(&mut self) -> Vec<CandidateInit> {
        self.open = true;
        self.pending.drain(..).collect()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn queued(&self) -> usize {
        self.pending.len()
    }
}

struct SignalingSession {
    state: SignalState,
    pc: Option<Arc<RTCPeerConnection>>,
    gate: CandidateGate,
}

impl SignalingSession {
    fn idle() -> Self {
        Self {
            state: SignalState::Idle,
            pc: None,
            gate: CandidateGate::default(),
        }
    }
}

/// All signaling sessions, owned by the agent loop. Peer-connection
/// callbacks never touch this state directly; they post events back
/// through the agent queue.
pub struct SignalingRegistry {
    sessions: HashMap<String, SignalingSession>,
    events: mpsc::UnboundedSender<AgentEvent>,
    widgets: Arc<WidgetStore>,
    channels: ChannelMap,
}

impl SignalingRegistry {
    pub fn new(
        events: mpsc::UnboundedSender<AgentEvent>,
        widgets: Arc<WidgetStore>,
        channels: ChannelMap,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            events,
            widgets,
            channels,
        }
    }

    /// Answer an incoming offer. A session already negotiating under
    /// this id is closed and replaced, never reused; candidates queued
    /// before any offer arrived carry over into the fresh negotiation.
    pub async fn handle_offer(
        &mut self,
        session_id: &str,
        description: SessionDescription,
    ) -> Option<SessionDescription> {
        // Validate before tearing anything down so a malformed offer
        // leaves the existing session untouched.
        let offer = match parse_offer(&description) {
            Ok(offer) => offer,
            Err(err) => {
                warn!(target: "signaling", session_id, error = %err, "dropping bad offer");
                return None;
            }
        };

        let gate = match self.sessions.remove(session_id) {
            // Only queued candidates so far: they belong to this offer.
            Some(previous) if previous.pc.is_none() => previous.gate,
            Some(previous) => {
                debug!(target: "signaling", session_id, "replacing signaling session");
                close_session(&self.channels, session_id, previous).await;
                CandidateGate::default()
            }
            None => CandidateGate::default(),
        };

        match self.negotiate(session_id, offer, gate).await {
            Ok((session, answer)) => {
                self.sessions.insert(session_id.to_string(), session);
                Some(answer)
            }
            Err(err) => {
                warn!(target: "signaling", session_id, error = %err, "negotiation failed");
                None
            }
        }
    }

    /// Route one remote candidate. `None` is the remote's
    /// end-of-candidates marker and is ignored.
    pub async fn handle_candidate(&mut self, session_id: &str, candidate: Option<CandidateInit>) {
        let Some(candidate) = candidate else {
            debug!(target: "signaling", session_id, "remote candidate gathering complete");
            return;
        };

        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(SignalingSession::idle);

        match session.gate.admit(candidate) {
            None => {
                debug!(target: "signaling", session_id, "queued early candidate");
            }
            Some(candidate) => {
                if let Some(pc) = session.pc.clone() {
                    apply_candidate(&pc, session_id, candidate).await;
                }
            }
        }
    }

    /// The operator's data channel reached the agent: `AnswerSent`
    /// becomes `Connected`.
    pub fn channel_open(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            if session.state == SignalState::AnswerSent {
                debug!(target: "signaling", session_id, "dedicated channel connected");
                session.state = SignalState::Connected;
            }
        }
    }

    /// Terminal: release the connection handle and forget the session.
    pub async fn channel_closed(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.remove(session_id) {
            close_session(&self.channels, session_id, session).await;
        }
    }

    async fn negotiate(
        &mut self,
        session_id: &str,
        offer: RTCSessionDescription,
        gate: CandidateGate,
    ) -> Result<(SignalingSession, SessionDescription), SignalingError> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![STUN_SERVER.to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        debug!(target: "signaling", session_id, "offer received");
        self.install_callbacks(session_id, &pc);

        let mut session = SignalingSession {
            state: SignalState::OfferReceived,
            pc: Some(pc.clone()),
            gate,
        };

        pc.set_remote_description(offer).await?;

        // Remote description is in: flush the queued batch, in arrival
        // order, exactly once. Individual failures are expected from
        // unreliable candidates and never abort the session.
        for candidate in session.gate.release() {
            apply_candidate(&pc, session_id, candidate).await;
        }

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        let local = pc
            .local_description()
            .await
            .ok_or(SignalingError::MissingLocalDescription)?;

        session.state = SignalState::AnswerSent;
        debug!(target: "signaling", session_id, "answer sent");
        Ok((
            session,
            SessionDescription {
                kind: local.sdp_type.to_string(),
                sdp: local.sdp,
            },
        ))
    }

    fn install_callbacks(&self, session_id: &str, pc: &Arc<RTCPeerConnection>) {
        let events = self.events.clone();
        let candidate_session = session_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            let session_id = candidate_session.clone();
            Box::pin(async move {
                let candidate = candidate.and_then(|c| match c.to_json() {
                    Ok(json) => Some(CandidateInit {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                    }),
                    Err(err) => {
                        warn!(target: "signaling", %session_id, error = %err, "unserializable local candidate");
                        None
                    }
                });
                let _ = events.send(AgentEvent::LocalCandidate {
                    session_id,
                    candidate,
                });
            })
        }));

        let events = self.events.clone();
        let state_session = session_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            let session_id = state_session.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        let _ = events.send(AgentEvent::ChannelClosed { session_id });
                    }
                    _ => {}
                }
            })
        }));

        let events = self.events.clone();
        let widgets = Arc::clone(&self.widgets);
        let channels = Arc::clone(&self.channels);
        let dc_session = session_id.to_string();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = events.clone();
            let widgets = Arc::clone(&widgets);
            let channels = Arc::clone(&channels);
            let session_id = dc_session.clone();
            Box::pin(async move {
                debug!(target: "signaling", %session_id, label = dc.label(), "data channel announced");
                channels.write().insert(session_id.clone(), dc.clone());

                let open_events = events.clone();
                let open_session = session_id.clone();
                dc.on_open(Box::new(move || {
                    let events = open_events.clone();
                    let session_id = open_session.clone();
                    Box::pin(async move {
                        let _ = events.send(AgentEvent::ChannelOpen { session_id });
                    })
                }));

                let close_events = events.clone();
                let session_for_close = session_id.clone();
                dc.on_close(Box::new(move || {
                    let events = close_events.clone();
                    let session_id = session_for_close.clone();
                    Box::pin(async move {
                        let _ = events.send(AgentEvent::ChannelClosed { session_id });
                    })
                }));

                let message_widgets = widgets;
                let message_session = session_id;
                dc.on_message(Box::new(move |message: DataChannelMessage| {
                    let widgets = Arc::clone(&message_widgets);
                    let session_id = message_session.clone();
                    Box::pin(async move {
                        if !message.is_string {
                            debug!(target: "signaling", %session_id, "ignoring binary channel frame");
                            return;
                        }
                        match serde_json::from_slice::<ChannelMessage>(&message.data) {
                            Ok(ChannelMessage::WidgetUpdate { widget_id, value }) => {
                                widgets.set(&widget_id, value);
                            }
                            Err(err) => {
                                debug!(target: "signaling", %session_id, error = %err, "unrecognized channel frame");
                            }
                        }
                    })
                }));
            })
        }));
    }

    #[cfg(test)]
    fn session_state(&self, session_id: &str) -> Option<SignalState> {
        self.sessions.get(session_id).map(|s| s.state)
    }

    #[cfg(test)]
    fn queued_candidates(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|s| s.gate.queued())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

fn parse_offer(description: &SessionDescription) -> Result<RTCSessionDescription, SignalingError> {
    if description.kind != "offer" {
        return Err(SignalingError::NotAnOffer(description.kind.clone()));
    }
    Ok(RTCSessionDescription::offer(description.sdp.clone())?)
}

async fn apply_candidate(pc: &Arc<RTCPeerConnection>, session_id: &str, candidate: CandidateInit) {
    let init = RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    };
    if let Err(err) = pc.add_ice_candidate(init).await {
        warn!(target: "signaling", session_id, error = %err, "dropping unusable candidate");
    }
}

async fn close_session(channels: &ChannelMap, session_id: &str, session: SignalingSession) {
    channels.write().remove(session_id);
    if let Some(pc) = session.pc {
        if let Err(err) = pc.close().await {
            debug!(target: "signaling", session_id, error = %err, "peer connection close failed");
        }
    }
}
