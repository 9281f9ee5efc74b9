//! Session registry and execution engine.
//!
//! One worker thread per session id, at most. Starting a session that
//! already has a live worker preempts it; stopping is cooperative
//! first (cancel flag), forced second (runner interrupt), and abandons
//! the worker third. The registry itself is never blocked for longer
//! than the two bounded grace periods.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pathfinder_hw::Hardware;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::agent::{AgentEvent, Telemetry, TelemetryKind};
use crate::script::{CancelToken, CapabilitySet, ScriptRunner};
use crate::widgets::WidgetStore;

/// Grace periods for the stop sequence: `cooperative` after the cancel
/// flag fires, `forced` after the interrupt attempt.
#[derive(Debug, Clone, Copy)]
pub struct StopTimeouts {
    pub cooperative: Duration,
    pub forced: Duration,
}

impl Default for StopTimeouts {
    fn default() -> Self {
        Self {
            cooperative: Duration::from_secs(1),
            forced: Duration::from_secs(1),
        }
    }
}

struct ExecutionHandle {
    cancel: CancelToken,
    done: watch::Receiver<bool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ExecutionHandle {
    fn is_done(&self) -> bool {
        *self.done.borrow()
    }
}

/// Owns every live execution. All mutation happens from the agent loop,
/// so insert/remove/lookup are serialized by ownership and a reader can
/// never observe a half-updated entry.
pub struct SessionRegistry {
    sessions: HashMap<String, ExecutionHandle>,
    runner: Arc<dyn ScriptRunner>,
    hardware: Arc<dyn Hardware>,
    widgets: Arc<WidgetStore>,
    events: mpsc::UnboundedSender<AgentEvent>,
    timeouts: StopTimeouts,
}

impl SessionRegistry {
    pub fn new(
        runner: Arc<dyn ScriptRunner>,
        hardware: Arc<dyn Hardware>,
        widgets: Arc<WidgetStore>,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        Self::with_timeouts(runner, hardware, widgets, events, StopTimeouts::default())
    }

    pub fn with_timeouts(
        runner: Arc<dyn ScriptRunner>,
        hardware: Arc<dyn Hardware>,
        widgets: Arc<WidgetStore>,
        events: mpsc::UnboundedSender<AgentEvent>,
        timeouts: StopTimeouts,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            runner,
            hardware,
            widgets,
            events,
            timeouts,
        }
    }

    /// Spawn a worker for `session_id`, preempting any worker already
    /// registered under that id. A preempted worker that refuses to die
    /// within the grace periods is logged and abandoned; registration
    /// of the new worker always goes through.
    pub async fn start_execution(&mut self, session_id: &str, source_text: String) {
        if let Some(previous) = self.sessions.remove(session_id) {
            debug!(target: "session", session_id, "preempting running execution");
            self.retire(session_id, previous).await;
        }

        let cancel = CancelToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let capabilities = CapabilitySet::new(
            session_id.to_string(),
            cancel.clone(),
            self.events.clone(),
            Arc::clone(&self.widgets),
            Arc::clone(&self.hardware),
        );
        let runner = Arc::clone(&self.runner);
        let events = self.events.clone();
        let worker_cancel = cancel.clone();
        let worker_session = session_id.to_string();

        let spawned = std::thread::Builder::new()
            .name(format!("exec-{session_id}"))
            .spawn(move || {
                let result = runner.run(&source_text, capabilities, worker_cancel.clone());
                if let Err(err) = result {
                    // A stopped script is expected to bail out; only a
                    // live one gets its failure reported.
                    if !worker_cancel.is_cancelled() {
                        for line in err.to_string().lines() {
                            let _ = events.send(AgentEvent::Telemetry(Telemetry {
                                session_id: worker_session.clone(),
                                kind: TelemetryKind::Stderr(line.to_string()),
                            }));
                        }
                    }
                }
                // The done flag must be visible before the terminal
                // notification is queued: reap runs when the agent loop
                // sees the notification and only removes entries whose
                // flag is already set.
                let _ = done_tx.send(true);
                // Exactly one terminal notification per started
                // execution, whatever the outcome was.
                let _ = events.send(AgentEvent::Telemetry(Telemetry {
                    session_id: worker_session.clone(),
                    kind: TelemetryKind::Finished,
                }));
            });

        match spawned {
            Ok(thread) => {
                self.sessions.insert(
                    session_id.to_string(),
                    ExecutionHandle {
                        cancel,
                        done: done_rx,
                        thread: Some(thread),
                    },
                );
            }
            Err(err) => {
                warn!(target: "session", session_id, error = %err, "failed to spawn worker");
                let _ = self.events.send(AgentEvent::Telemetry(Telemetry {
                    session_id: session_id.to_string(),
                    kind: TelemetryKind::Stderr(format!("failed to start execution: {err}")),
                }));
            }
        }
    }

    /// Stop the worker for `session_id` if there is one; otherwise tell
    /// the operator that nothing was running.
    pub async fn stop_execution(&mut self, session_id: &str) {
        match self.sessions.remove(session_id) {
            Some(handle) => self.retire(session_id, handle).await,
            None => {
                let _ = self.events.send(AgentEvent::Telemetry(Telemetry {
                    session_id: session_id.to_string(),
                    kind: TelemetryKind::Stderr("no execution is running for this session".into()),
                }));
            }
        }
    }

    /// Drop the registry entry for a worker that reported completion.
    /// Guarded on the done flag so a terminal notification from a
    /// preempted worker cannot evict its replacement.
    pub fn reap(&mut self, session_id: &str) {
        let finished = self
            .sessions
            .get(session_id)
            .map(|handle| handle.is_done())
            .unwrap_or(false);
        if finished {
            if let Some(mut handle) = self.sessions.remove(session_id) {
                if let Some(thread) = handle.thread.take() {
                    let _ = thread.join();
                }
            }
        }
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|handle| !handle.is_done())
            .unwrap_or(false)
    }

    pub fn live_workers(&self) -> usize {
        self.sessions
            .values()
            .filter(|handle| !handle.is_done())
            .count()
    }

    #[cfg(test)]
    fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Cancel, then interrupt, then abandon. The entry is already out
    /// of the map when this runs; the worker at worst leaks.
    async fn retire(&self, session_id: &str, mut handle: ExecutionHandle) {
        handle.cancel.fire();
        if Self::join_within(&mut handle, self.timeouts.cooperative).await {
            return;
        }

        if self.runner.interrupt(session_id) {
            debug!(target: "session", session_id, "delivered runner interrupt");
        }
        if Self::join_within(&mut handle, self.timeouts.forced).await {
            return;
        }

        warn!(
            target: "session",
            session_id,
            "worker ignored cancellation and interrupt; abandoning thread"
        );
    }

    async fn join_within(handle: &mut ExecutionHandle, limit: Duration) -> bool {
        let observed =
            tokio::time::timeout(limit, handle.done.wait_for(|done| *done)).await;
        match observed {
            Ok(Ok(_)) => {
                if let Some(thread) = handle.thread.take() {
                    let _ = thread.join();
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptError;
    use pathfinder_hw::DisabledHardware;

    struct SleepyRunner;

    impl ScriptRunner for SleepyRunner {
        fn run(
            &self,
            _source_text: &str,
            caps: CapabilitySet,
            cancel: CancelToken,
        ) -> Result<(), ScriptError> {
            for i in 0..50 {
                if cancel.is_cancelled() {
                    break;
                }
                caps.print(&format!("tick {i}"));
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(())
        }
    }

    fn registry_fixture(
        runner: Arc<dyn ScriptRunner>,
    ) -> (SessionRegistry, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(
            runner,
            DisabledHardware::shared(),
            Arc::new(WidgetStore::new()),
            tx,
        );
        (registry, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<Telemetry> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::Telemetry(telemetry) = event {
                out.push(telemetry);
            }
        }
        out
    }

    #[tokio::test]
    async fn stop_without_worker_reports_nothing_running() {
        let (mut registry, mut rx) = registry_fixture(Arc::new(SleepyRunner));
        registry.stop_execution("ghost").await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].kind, TelemetryKind::Stderr(_)));
        assert_eq!(events[0].session_id, "ghost");
    }

    #[tokio::test]
    async fn preemption_keeps_a_single_live_worker() {
        let (mut registry, mut rx) = registry_fixture(Arc::new(SleepyRunner));
        registry.start_execution("s1", "first".into()).await;
        registry.start_execution("s1", "second".into()).await;
        assert!(registry.live_workers() <= 1);

        registry.stop_execution("s1").await;
        assert_eq!(registry.live_workers(), 0);

        let finished = drain(&mut rx)
            .into_iter()
            .filter(|t| matches!(t.kind, TelemetryKind::Finished))
            .count();
        // one per execution that was actually started
        assert_eq!(finished, 2);
    }

    struct InstantRunner;

    impl ScriptRunner for InstantRunner {
        fn run(
            &self,
            _source_text: &str,
            _caps: CapabilitySet,
            _cancel: CancelToken,
        ) -> Result<(), ScriptError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn reap_removes_the_entry_once_the_terminal_event_arrives() {
        let (mut registry, mut rx) = registry_fixture(Arc::new(InstantRunner));
        registry.start_execution("s1", "noop".into()).await;

        // The terminal notification is queued after the done flag is
        // set, so by the time it is observed the entry is reapable.
        loop {
            match rx.recv().await.expect("worker telemetry") {
                AgentEvent::Telemetry(Telemetry {
                    kind: TelemetryKind::Finished,
                    ..
                }) => break,
                _ => {}
            }
        }
        registry.reap("s1");
        assert_eq!(registry.tracked_sessions(), 0, "finished entry was retained");
    }

    #[tokio::test]
    async fn reap_ignores_a_live_replacement() {
        let (mut registry, _rx) = registry_fixture(Arc::new(SleepyRunner));
        registry.start_execution("s1", "code".into()).await;
        assert!(registry.is_running("s1"));
        // terminal notification for a *previous* worker must not evict
        // the live one
        registry.reap("s1");
        assert!(registry.is_running("s1"));
        registry.stop_execution("s1").await;
    }
}
