//! Persistent websocket link to the control server.
//!
//! Connection loss is never fatal: the client reconnects at a fixed
//! interval forever, re-announcing itself with `robot_connected` on
//! every successful attempt. While connected it pumps the outbound
//! event queue up, dispatches inbound commands to the agent loop, and
//! heartbeats at a fixed period. Outbound events raised while offline
//! stay queued until the next connection.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::agent::AgentEvent;
use crate::config::Config;
use crate::protocol::{ClientEvent, ServerCommand};

pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
enum LinkError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("server closed the connection")]
    Closed,
}

pub struct ControlChannelClient {
    config: Config,
    events: mpsc::UnboundedSender<AgentEvent>,
    outbound: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ControlChannelClient {
    pub fn new(
        config: Config,
        events: mpsc::UnboundedSender<AgentEvent>,
        outbound: mpsc::UnboundedReceiver<ClientEvent>,
    ) -> Self {
        Self {
            config,
            events,
            outbound,
        }
    }

    /// Connect-dispatch-reconnect, forever. Returns only once the agent
    /// loop has gone away and there is nobody left to serve.
    pub async fn run(mut self) {
        let url = self.config.control_url();
        loop {
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    info!(target: "control", %url, "control channel connected");
                    match self.serve(stream).await {
                        Ok(()) => {
                            info!(target: "control", "agent loop stopped; shutting down");
                            return;
                        }
                        Err(err) => {
                            warn!(target: "control", error = %err, "control channel lost");
                        }
                    }
                }
                Err(err) => {
                    warn!(target: "control", %url, error = %err, "connect failed");
                }
            }
            tokio::time::sleep(RECONNECT_INTERVAL).await;
        }
    }

    /// One connected stretch. `Ok(())` means the outbound queue closed
    /// (agent gone); any `Err` means reconnect.
    async fn serve(
        &mut self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> Result<(), LinkError> {
        let (mut writer, mut reader) = stream.split();

        send_event(
            &mut writer,
            &ClientEvent::RobotConnected {
                id: self.config.robot_id.clone(),
                name: self.config.robot_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        )
        .await?;

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                event = self.outbound.recv() => match event {
                    Some(event) => send_event(&mut writer, &event).await?,
                    None => return Ok(()),
                },
                _ = heartbeat.tick() => {
                    send_event(
                        &mut writer,
                        &ClientEvent::Heartbeat { id: self.config.robot_id.clone() },
                    )
                    .await?;
                }
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => dispatch(&self.events, text.as_str()),
                    Some(Ok(Message::Binary(data))) => {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            dispatch(&self.events, text);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(LinkError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                },
            }
        }
    }
}

fn dispatch(events: &mpsc::UnboundedSender<AgentEvent>, text: &str) {
    match serde_json::from_str::<ServerCommand>(text) {
        Ok(command) => {
            let _ = events.send(AgentEvent::Command(command));
        }
        Err(err) => {
            debug!(target: "control", error = %err, "unrecognized server message");
        }
    }
}

async fn send_event<S>(writer: &mut S, event: &ClientEvent) -> Result<(), LinkError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    match serde_json::to_string(event) {
        Ok(json) => writer.send(Message::Text(json)).await.map_err(Into::into),
        Err(err) => {
            debug!(target: "control", error = %err, "unserializable outbound event");
            Ok(())
        }
    }
}
