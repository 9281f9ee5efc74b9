//! The agent loop: one task owns every signaling and transport state
//! transition. Workers, data-channel callbacks and the control channel
//! all talk to it through a single FIFO event queue, so per-session
//! telemetry reaches the wire in emission order and nobody else ever
//! mutates session state.

use std::sync::Arc;

use pathfinder_hw::Hardware;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::protocol::{CandidateInit, ClientEvent, EmitKind, ServerCommand};
use crate::script::ScriptRunner;
use crate::session::{SessionRegistry, StopTimeouts};
use crate::signaling::SignalingRegistry;
use crate::transport::{new_channel_map, DataChannelTransport};
use crate::widgets::WidgetStore;

/// Everything the loop reacts to, in arrival order.
#[derive(Debug)]
pub enum AgentEvent {
    /// Inbound command from the control server.
    Command(ServerCommand),
    /// Output from a running script's worker thread.
    Telemetry(Telemetry),
    /// A dedicated channel finished opening for the session.
    ChannelOpen { session_id: String },
    /// The dedicated channel (or its peer connection) went away.
    ChannelClosed { session_id: String },
    /// Locally gathered candidate to trickle out; `None` terminates.
    LocalCandidate {
        session_id: String,
        candidate: Option<CandidateInit>,
    },
}

#[derive(Debug)]
pub struct Telemetry {
    pub session_id: String,
    pub kind: TelemetryKind,
}

#[derive(Debug)]
pub enum TelemetryKind {
    Stdout(String),
    Stderr(String),
    /// Terminal notification; exactly one per started execution.
    Finished,
    Emit {
        kind: EmitKind,
        widget_id: String,
        payload: Vec<u8>,
    },
}

pub struct Agent {
    registry: SessionRegistry,
    signaling: SignalingRegistry,
    transport: DataChannelTransport,
    widgets: Arc<WidgetStore>,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    events: mpsc::UnboundedReceiver<AgentEvent>,
}

impl Agent {
    /// Wire up the loop. `outbound` feeds the control channel writer;
    /// the returned sender is the queue everything else posts into.
    pub fn new(
        runner: Arc<dyn ScriptRunner>,
        hardware: Arc<dyn Hardware>,
        outbound: mpsc::UnboundedSender<ClientEvent>,
    ) -> (Self, mpsc::UnboundedSender<AgentEvent>) {
        Self::with_timeouts(runner, hardware, outbound, StopTimeouts::default())
    }

    pub fn with_timeouts(
        runner: Arc<dyn ScriptRunner>,
        hardware: Arc<dyn Hardware>,
        outbound: mpsc::UnboundedSender<ClientEvent>,
        timeouts: StopTimeouts,
    ) -> (Self, mpsc::UnboundedSender<AgentEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let widgets = Arc::new(WidgetStore::new());
        let channels = new_channel_map();
        let registry = SessionRegistry::with_timeouts(
            runner,
            hardware,
            Arc::clone(&widgets),
            events_tx.clone(),
            timeouts,
        );
        let signaling = SignalingRegistry::new(
            events_tx.clone(),
            Arc::clone(&widgets),
            Arc::clone(&channels),
        );
        let transport = DataChannelTransport::new(channels, outbound.clone());
        (
            Self {
                registry,
                signaling,
                transport,
                widgets,
                outbound,
                events: events_rx,
            },
            events_tx,
        )
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle(event).await;
        }
    }

    async fn handle(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Command(command) => self.handle_command(command).await,
            AgentEvent::Telemetry(telemetry) => self.handle_telemetry(telemetry).await,
            AgentEvent::ChannelOpen { session_id } => self.signaling.channel_open(&session_id),
            AgentEvent::ChannelClosed { session_id } => {
                self.signaling.channel_closed(&session_id).await;
            }
            AgentEvent::LocalCandidate {
                session_id,
                candidate,
            } => {
                let _ = self.outbound.send(ClientEvent::SignalCandidate {
                    session_id,
                    candidate,
                });
            }
        }
    }

    async fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::RobotRegistered {
                success,
                message,
                error,
            } => {
                if success {
                    info!(
                        target: "control",
                        message = message.as_deref().unwrap_or(""),
                        "robot registered"
                    );
                } else {
                    warn!(
                        target: "control",
                        error = error.as_deref().unwrap_or("unknown"),
                        "robot registration rejected"
                    );
                }
            }
            ServerCommand::ExecuteCode {
                session_id,
                source_text,
            } => {
                self.registry.start_execution(&session_id, source_text).await;
            }
            ServerCommand::StopExecution { session_id } => {
                self.registry.stop_execution(&session_id).await;
            }
            ServerCommand::WidgetUpdate { widget_id, value } => {
                self.widgets.set(&widget_id, value);
            }
            ServerCommand::SignalOffer {
                session_id,
                description,
            } => {
                if let Some(answer) = self.signaling.handle_offer(&session_id, description).await {
                    let _ = self.outbound.send(ClientEvent::SignalAnswer {
                        session_id,
                        description: answer,
                    });
                }
            }
            ServerCommand::SignalCandidate {
                session_id,
                candidate,
            } => {
                self.signaling.handle_candidate(&session_id, candidate).await;
            }
        }
    }

    async fn handle_telemetry(&mut self, telemetry: Telemetry) {
        let Telemetry { session_id, kind } = telemetry;
        match kind {
            TelemetryKind::Stdout(text) => {
                let _ = self.outbound.send(ClientEvent::Stdout { session_id, text });
            }
            TelemetryKind::Stderr(text) => {
                let _ = self.outbound.send(ClientEvent::Stderr { session_id, text });
            }
            TelemetryKind::Finished => {
                let _ = self.outbound.send(ClientEvent::Finished {
                    session_id: session_id.clone(),
                });
                self.registry.reap(&session_id);
            }
            TelemetryKind::Emit {
                kind,
                widget_id,
                payload,
            } => {
                if let Err(err) = self
                    .transport
                    .send(&session_id, kind, &widget_id, &payload)
                    .await
                {
                    warn!(target: "agent", session_id, error = %err, "telemetry dropped");
                }
            }
        }
    }
}
