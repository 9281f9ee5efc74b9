//! End-to-end execution behavior through the agent loop: operator
//! commands in, control-channel events out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pathfinder::agent::{Agent, AgentEvent};
use pathfinder::protocol::{ClientEvent, ServerCommand};
use pathfinder::script::{CancelToken, CapabilitySet, ScriptError, ScriptRunner};
use pathfinder::session::StopTimeouts;
use pathfinder_hw::DisabledHardware;
use tokio::sync::mpsc;
use tokio::time::timeout;

const QUIET: Duration = Duration::from_millis(700);

fn fast_timeouts() -> StopTimeouts {
    StopTimeouts {
        cooperative: Duration::from_millis(500),
        forced: Duration::from_millis(500),
    }
}

fn spawn_agent(
    runner: Arc<dyn ScriptRunner>,
) -> (
    mpsc::UnboundedSender<AgentEvent>,
    mpsc::UnboundedReceiver<ClientEvent>,
) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (agent, events_tx) = Agent::with_timeouts(
        runner,
        DisabledHardware::shared(),
        outbound_tx,
        fast_timeouts(),
    );
    tokio::spawn(agent.run());
    (events_tx, outbound_rx)
}

async fn collect_until_quiet(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = timeout(QUIET, rx.recv()).await {
        events.push(event);
    }
    events
}

/// "loop 10 times, print i, sleep 200 ms"
struct TickerRunner;

impl ScriptRunner for TickerRunner {
    fn run(
        &self,
        _source_text: &str,
        caps: CapabilitySet,
        cancel: CancelToken,
    ) -> Result<(), ScriptError> {
        for i in 0..10 {
            if cancel.is_cancelled() {
                break;
            }
            caps.print(&format!("{i}"));
            std::thread::sleep(Duration::from_millis(200));
        }
        Ok(())
    }
}

#[tokio::test]
async fn stop_truncates_output_and_finishes_exactly_once() {
    let (events, mut outbound) = spawn_agent(Arc::new(TickerRunner));

    events
        .send(AgentEvent::Command(ServerCommand::ExecuteCode {
            session_id: "s1".into(),
            source_text: "loop 10 times, print i, sleep 200ms".into(),
        }))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    events
        .send(AgentEvent::Command(ServerCommand::StopExecution {
            session_id: "s1".into(),
        }))
        .unwrap();

    let collected = collect_until_quiet(&mut outbound).await;

    let stdout_lines = collected
        .iter()
        .filter(|e| matches!(e, ClientEvent::Stdout { session_id, .. } if session_id == "s1"))
        .count();
    assert!(stdout_lines >= 1, "script never got to print");
    assert!(stdout_lines < 10, "stop did not truncate output");

    let finished_at: Vec<usize> = collected
        .iter()
        .enumerate()
        .filter_map(|(idx, e)| {
            matches!(e, ClientEvent::Finished { session_id } if session_id == "s1").then_some(idx)
        })
        .collect();
    assert_eq!(finished_at.len(), 1, "expected exactly one finished event");
    // nothing for s1 after the terminal notification
    assert_eq!(finished_at[0], collected.len() - 1, "events after finished: {collected:?}");
}

struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
}

struct GaugedRunner(Arc<Gauge>);

impl ScriptRunner for GaugedRunner {
    fn run(
        &self,
        _source_text: &str,
        _caps: CapabilitySet,
        cancel: CancelToken,
    ) -> Result<(), ScriptError> {
        self.0.started.fetch_add(1, Ordering::SeqCst);
        let live = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.peak.fetch_max(live, Ordering::SeqCst);
        for _ in 0..20 {
            if cancel.is_cancelled() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn reexecution_preempts_and_never_overlaps_workers() {
    let gauge = Arc::new(Gauge {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        started: AtomicUsize::new(0),
    });
    let (events, mut outbound) = spawn_agent(Arc::new(GaugedRunner(Arc::clone(&gauge))));

    for source in ["first", "second"] {
        events
            .send(AgentEvent::Command(ServerCommand::ExecuteCode {
                session_id: "s1".into(),
                source_text: source.into(),
            }))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    events
        .send(AgentEvent::Command(ServerCommand::StopExecution {
            session_id: "s1".into(),
        }))
        .unwrap();

    let collected = collect_until_quiet(&mut outbound).await;

    assert_eq!(gauge.started.load(Ordering::SeqCst), 2);
    assert_eq!(
        gauge.peak.load(Ordering::SeqCst),
        1,
        "two workers were alive for one session id"
    );

    let finished = collected
        .iter()
        .filter(|e| matches!(e, ClientEvent::Finished { session_id } if session_id == "s1"))
        .count();
    assert_eq!(finished, 2, "one finished per started execution");
}

#[tokio::test]
async fn stop_without_execution_reports_nothing_running() {
    let (events, mut outbound) = spawn_agent(Arc::new(TickerRunner));

    events
        .send(AgentEvent::Command(ServerCommand::StopExecution {
            session_id: "ghost".into(),
        }))
        .unwrap();

    let collected = collect_until_quiet(&mut outbound).await;
    assert!(collected.iter().any(
        |e| matches!(e, ClientEvent::Stderr { session_id, .. } if session_id == "ghost")
    ));
    assert!(!collected
        .iter()
        .any(|e| matches!(e, ClientEvent::Finished { .. })));
}

struct FailingRunner;

impl ScriptRunner for FailingRunner {
    fn run(
        &self,
        _source_text: &str,
        _caps: CapabilitySet,
        _cancel: CancelToken,
    ) -> Result<(), ScriptError> {
        Err(ScriptError::Runtime("division by zero\nat line 3".into()))
    }
}

#[tokio::test]
async fn script_failure_reaches_stderr_then_finishes() {
    let (events, mut outbound) = spawn_agent(Arc::new(FailingRunner));

    events
        .send(AgentEvent::Command(ServerCommand::ExecuteCode {
            session_id: "s9".into(),
            source_text: "explode".into(),
        }))
        .unwrap();

    let collected = collect_until_quiet(&mut outbound).await;
    let stderr_lines: Vec<&ClientEvent> = collected
        .iter()
        .filter(|e| matches!(e, ClientEvent::Stderr { .. }))
        .collect();
    assert!(
        stderr_lines.len() >= 2,
        "multi-line failure should arrive line by line: {collected:?}"
    );
    assert!(matches!(
        collected.last(),
        Some(ClientEvent::Finished { session_id }) if session_id == "s9"
    ));
}
