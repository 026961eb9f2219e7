//! Per-node lifecycle and the run-wide status record.
//!
//! One mutex guards everything; workers write, the dashboard reads snapshots.
//! In machine mode every update is also written as one JSON line.

use crate::transport::NodeRole;
use chrono::{
    DateTime,
    Utc,
};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    io::Write,
    sync::{
        Arc,
        Mutex,
        PoisonError,
    },
};
use strum::{
    Display,
    EnumIter,
    EnumString,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, EnumIter, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Pending,
    PreparingRemoteDir,
    PushingBinary,
    PushingConfig,
    Collecting,
    AwaitingTransfer,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    /// Short text for people watching the run.
    pub fn ux(self) -> &'static str {
        match self {
            Phase::Pending => "waiting to start",
            Phase::PreparingRemoteDir => "creating remote directory",
            Phase::PushingBinary => "copying collector",
            Phase::PushingConfig => "copying configuration",
            Phase::Collecting => "collecting",
            Phase::AwaitingTransfer => "waiting for a transfer slot",
            Phase::Transferring => "transferring",
            Phase::Completed => "done",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NodeResult {
    Pending,
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub name: String,
    pub role: NodeRole,
    pub phase: Phase,
    pub phase_started_at: DateTime<Utc>,
    pub phase_ended_at: Option<DateTime<Utc>>,
    pub result: NodeResult,
    pub error_message: Option<String>,
    pub remote_pid_file: Option<String>,
    /// Set once the node answered a remote command.
    pub contacted: bool,
}

impl NodeState {
    fn new(name: &str, role: NodeRole) -> Self {
        Self {
            name: name.to_string(),
            role,
            phase: Phase::Pending,
            phase_started_at: Utc::now(),
            phase_ended_at: None,
            result: NodeResult::Pending,
            error_message: None,
            remote_pid_file: None,
            contacted: false,
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum TransitionError {
    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("{node} already finished as {from}, ignoring {to}")]
    Terminal { node: String, from: Phase, to: Phase },

    #[error("{node} cannot move back from {from} to {to}")]
    Backwards { node: String, from: Phase, to: Phase },
}

/// Checks a phase change against the lifecycle ordering.
pub fn check_transition(node: &str, from: Phase, to: Phase) -> Result<(), TransitionError> {
    if from.is_terminal() {
        return Err(TransitionError::Terminal {
            node: node.to_string(),
            from,
            to,
        });
    }
    if to == Phase::Failed || to == Phase::Cancelled || to > from {
        return Ok(());
    }
    Err(TransitionError::Backwards {
        node: node.to_string(),
        from,
        to,
    })
}

#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub nodes: BTreeMap<String, NodeState>,
    pub started_at: Option<DateTime<Utc>>,
    pub runtime_secs: u64,
    pub tarball_dir: Option<String>,
    pub result: Option<String>,
    pub output_files: Vec<String>,
    pub warnings: Vec<String>,
    pub transfers_attempted: usize,
    pub transfers_done: usize,
}

impl StatusSnapshot {
    pub fn coordinators(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.values().filter(|n| n.role == NodeRole::Coordinator)
    }

    pub fn executors(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.values().filter(|n| n.role == NodeRole::Executor)
    }

    pub fn failed(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.values().filter(|n| n.result == NodeResult::Failure)
    }

    pub fn count_in(&self, phase: Phase) -> usize {
        self.nodes.values().filter(|n| n.phase == phase).count()
    }
}

#[derive(Serialize)]
struct MachineLine<'a> {
    node: &'a str,
    status: Phase,
    status_ux: &'a str,
    result: NodeResult,
    end_process: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

#[derive(Clone, derive_more::Debug)]
pub struct StatusModel {
    inner: Arc<Mutex<StatusSnapshot>>,
    #[debug(skip)]
    machine: Option<Sink>,
}

impl StatusModel {
    /// Status kept for the dashboard only.
    pub fn human() -> Self {
        Self {
            inner: Default::default(),
            machine: None,
        }
    }

    /// Status that also streams JSON lines to stdout.
    pub fn machine() -> Self {
        Self::machine_to(Box::new(std::io::stdout()))
    }

    pub fn machine_to(out: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Default::default(),
            machine: Some(Arc::new(Mutex::new(out))),
        }
    }

    pub fn is_machine(&self) -> bool {
        self.machine.is_some()
    }

    fn emit(&self, value: &impl Serialize) {
        let Some(sink) = &self.machine else {
            return;
        };
        match serde_json::to_string(value) {
            Ok(line) => {
                let mut out = sink.lock().unwrap_or_else(PoisonError::into_inner);
                let _ = writeln!(out, "{line}");
                let _ = out.flush();
            },
            Err(err) => debug!("status line not serialized: {err}"),
        }
    }

    pub fn start(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).started_at = Some(Utc::now());
    }

    pub fn add_node(&self, name: &str, role: NodeRole) {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .entry(name.to_string())
            .or_insert_with(|| NodeState::new(name, role));
    }

    pub fn set_remote_pid_file(&self, name: &str, pid_file: &str) {
        if let Some(node) = self.inner.lock().unwrap_or_else(PoisonError::into_inner).nodes.get_mut(name) {
            node.remote_pid_file = Some(pid_file.to_string());
        }
    }

    /// Moves `name` to `phase`; `error` is kept when the phase is `failed`.
    pub fn update_node(&self, name: &str, phase: Phase, error: Option<String>) -> Result<(), TransitionError> {
        let line = {
            let mut status = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let node = status
                .nodes
                .get_mut(name)
                .ok_or_else(|| TransitionError::UnknownNode(name.to_string()))?;
            if node.phase == phase {
                return Ok(());
            }
            check_transition(name, node.phase, phase)?;
            let from = node.phase;
            let now = Utc::now();
            node.phase = phase;
            node.phase_started_at = now;
            node.phase_ended_at = phase.is_terminal().then_some(now);
            node.contacted |= (Phase::PushingBinary..=Phase::Completed).contains(&phase);
            node.result = match phase {
                Phase::Completed => NodeResult::Success,
                Phase::Failed | Phase::Cancelled => NodeResult::Failure,
                _ => NodeResult::Pending,
            };
            node.error_message = match phase {
                Phase::Failed => Some(error.unwrap_or_else(|| "unknown error".to_string())),
                Phase::Cancelled => Some("cancelled".to_string()),
                _ => None,
            };
            let result = node.result;
            let message = node.error_message.clone();
            if phase == Phase::Transferring {
                status.transfers_attempted += 1;
            }
            if phase == Phase::Completed && from == Phase::Transferring {
                status.transfers_done += 1;
            }
            (result, message)
        };
        debug!(node = name, %phase, "node status");
        self.emit(&MachineLine {
            node: name,
            status: phase,
            status_ux: phase.ux(),
            result: line.0,
            end_process: phase.is_terminal(),
            error: line.1.as_deref(),
        });
        Ok(())
    }

    pub fn update_runtime(&self) {
        let mut status = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(started) = status.started_at {
            status.runtime_secs = (Utc::now() - started).num_seconds().max(0) as u64;
        }
    }

    pub fn update_tarball_dir(&self, dir: &str) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).tarball_dir = Some(dir.to_string());
    }

    pub fn update_result(&self, result: &str, output_files: Vec<String>) {
        {
            let mut status = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            status.result = Some(result.to_string());
            status.output_files = output_files.clone();
        }
        self.emit(&serde_json::json!({ "result": result, "output": output_files }));
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).warnings.push(message.clone());
        self.emit(&serde_json::json!({ "warning": message }));
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).warnings.push(message.clone());
        self.emit(&serde_json::json!({ "error": message }));
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn node(&self, name: &str) -> Option<NodeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).nodes.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn phase_names() {
        assert_eq!(Phase::PreparingRemoteDir.to_string(), "preparing-remote-dir");
        assert_eq!("awaiting-transfer".parse::<Phase>().unwrap(), Phase::AwaitingTransfer);
        assert!(Phase::Collecting < Phase::Transferring);
    }

    #[test]
    fn transitions_are_monotonic() {
        let status = StatusModel::human();
        status.add_node("c1", NodeRole::Coordinator);
        status.update_node("c1", Phase::PreparingRemoteDir, None).unwrap();
        status.update_node("c1", Phase::Collecting, None).unwrap();
        assert_eq!(
            status.update_node("c1", Phase::PushingBinary, None),
            Err(TransitionError::Backwards {
                node: "c1".into(),
                from: Phase::Collecting,
                to: Phase::PushingBinary
            })
        );
        status.update_node("c1", Phase::Failed, Some("boom".into())).unwrap();
        assert!(matches!(
            status.update_node("c1", Phase::Completed, None),
            Err(TransitionError::Terminal { .. })
        ));

        let node = status.node("c1").unwrap();
        assert_eq!(node.result, NodeResult::Failure);
        assert_eq!(node.error_message.as_deref(), Some("boom"));
        assert!(node.phase_ended_at.is_some());
        assert!(status.update_node("nope", Phase::Failed, None).is_err());
    }

    #[test]
    fn panicked_holder_does_not_wedge_the_model() {
        let status = StatusModel::human();
        status.add_node("c1", NodeRole::Coordinator);
        let inner = Arc::clone(&status.inner);
        let holder = std::thread::spawn(move || {
            let _guard = inner.lock().unwrap();
            panic!("worker died holding the status lock");
        });
        assert!(holder.join().is_err());
        assert!(status.inner.is_poisoned());

        status.update_node("c1", Phase::Collecting, None).unwrap();
        status.warn("still reporting");
        let snapshot = status.snapshot();
        assert_eq!(snapshot.nodes["c1"].phase, Phase::Collecting);
        assert_eq!(snapshot.warnings, vec!["still reporting".to_string()]);
    }

    #[test]
    fn result_is_success_only_when_completed() {
        let status = StatusModel::human();
        status.add_node("e1", NodeRole::Executor);
        for phase in [Phase::Collecting, Phase::AwaitingTransfer, Phase::Transferring] {
            status.update_node("e1", phase, None).unwrap();
            assert_eq!(status.node("e1").unwrap().result, NodeResult::Pending);
        }
        status.update_node("e1", Phase::Completed, None).unwrap();
        let snapshot = status.snapshot();
        assert_eq!(snapshot.nodes["e1"].result, NodeResult::Success);
        assert_eq!((snapshot.transfers_attempted, snapshot.transfers_done), (1, 1));
        assert_eq!(snapshot.executors().count(), 1);
    }

    #[test]
    fn machine_mode_writes_json_lines() {
        let capture = Capture::default();
        let status = StatusModel::machine_to(Box::new(capture.clone()));
        status.add_node("c1", NodeRole::Coordinator);
        status.update_node("c1", Phase::Collecting, None).unwrap();
        status.update_node("c1", Phase::Cancelled, None).unwrap();
        status.warn("disk is getting full");

        let text = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["node"], "c1");
        assert_eq!(lines[0]["status"], "collecting");
        assert_eq!(lines[0]["result"], "pending");
        assert_eq!(lines[0]["end_process"], false);
        assert_eq!(lines[1]["status"], "cancelled");
        assert_eq!(lines[1]["result"], "failure");
        assert_eq!(lines[1]["end_process"], true);
        assert_eq!(lines[2]["warning"], "disk is getting full");
    }
}
