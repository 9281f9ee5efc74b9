//! The seam between the agent and whatever interprets operator scripts.
//!
//! The concrete interpreter/sandbox is an external collaborator; the
//! agent hands it source text, a [`CapabilitySet`] and a [`CancelToken`]
//! and expects a result back. Every capability call is gated on the
//! token so a stopped script goes quiet even while its worker is still
//! winding down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pathfinder_hw::{Hardware, HardwareError};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::agent::{AgentEvent, Telemetry, TelemetryKind};
use crate::protocol::EmitKind;
use crate::widgets::{WidgetStore, WidgetValue};

/// One-shot cancellation flag shared between the registry and a worker.
/// Monotonic: once fired it stays fired for the lifetime of the
/// execution it belongs to.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("no script runner is configured on this agent")]
    RunnerUnavailable,
    #[error("script failed: {0}")]
    Runtime(String),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

/// Executes one script on the calling thread. Implementations are
/// expected to poll the token at every blocking boundary; `interrupt`
/// is the best-effort hard stop for runners that support it and is
/// explicitly allowed to do nothing.
pub trait ScriptRunner: Send + Sync {
    fn run(
        &self,
        source_text: &str,
        capabilities: CapabilitySet,
        cancel: CancelToken,
    ) -> Result<(), ScriptError>;

    /// Try to interrupt the worker currently running `session_id`.
    /// Returns whether an interrupt was actually delivered.
    fn interrupt(&self, _session_id: &str) -> bool {
        false
    }
}

/// Placeholder wired by the binary until a real interpreter is
/// attached: every execution fails onto the session's stderr.
#[derive(Debug, Default)]
pub struct UnavailableRunner;

impl ScriptRunner for UnavailableRunner {
    fn run(
        &self,
        _source_text: &str,
        _capabilities: CapabilitySet,
        _cancel: CancelToken,
    ) -> Result<(), ScriptError> {
        Err(ScriptError::RunnerUnavailable)
    }
}

/// The functions a running script may call, bound to one session.
/// Emission routes through the agent loop (and from there over the best
/// available channel); widget reads come from the shared store. All of
/// it is a no-op once the session's cancel flag is set.
#[derive(Clone)]
pub struct CapabilitySet {
    session_id: String,
    cancel: CancelToken,
    events: mpsc::UnboundedSender<AgentEvent>,
    widgets: Arc<WidgetStore>,
    hardware: Arc<dyn Hardware>,
}

impl CapabilitySet {
    pub fn new(
        session_id: String,
        cancel: CancelToken,
        events: mpsc::UnboundedSender<AgentEvent>,
        widgets: Arc<WidgetStore>,
        hardware: Arc<dyn Hardware>,
    ) -> Self {
        Self {
            session_id,
            cancel,
            events,
            widgets,
            hardware,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Uniform cooperative-stop wrapper: runs `call` only while the
    /// session is still live.
    fn guarded<T>(&self, call: impl FnOnce(&Self) -> T) -> Option<T> {
        if self.cancel.is_cancelled() {
            None
        } else {
            Some(call(self))
        }
    }

    fn telemetry(&self, kind: TelemetryKind) {
        let _ = self.events.send(AgentEvent::Telemetry(Telemetry {
            session_id: self.session_id.clone(),
            kind,
        }));
    }

    /// Script-visible `print`: one stdout line to the operator.
    pub fn print(&self, text: &str) {
        self.guarded(|caps| {
            caps.telemetry(TelemetryKind::Stdout(text.to_string()));
        });
    }

    pub fn emit_text(&self, widget_id: &str, text: &str) {
        self.guarded(|caps| {
            caps.telemetry(TelemetryKind::Emit {
                kind: EmitKind::Text,
                widget_id: widget_id.to_string(),
                payload: text.as_bytes().to_vec(),
            });
        });
    }

    pub fn emit_image(&self, widget_id: &str, jpeg: Vec<u8>) {
        self.guarded(|caps| {
            caps.telemetry(TelemetryKind::Emit {
                kind: EmitKind::Image,
                widget_id: widget_id.to_string(),
                payload: jpeg,
            });
        });
    }

    /// Last value the operator wrote to `widget_id`, if any.
    pub fn widget(&self, widget_id: &str) -> Option<WidgetValue> {
        self.guarded(|caps| caps.widgets.get(widget_id)).flatten()
    }

    pub fn hardware(&self) -> &Arc<dyn Hardware> {
        &self.hardware
    }
}
