/// Models module
/// Channel namespace and payload types shared between the host and the UI.
/// Everything that crosses the bridge is serializable.
use serde::{Deserialize, Serialize};
use std::fmt;

/// A command as the UI hands it over: an arbitrary JSON object, written to
/// the worker verbatim.
pub type OutboundCommand = serde_json::Map<String, serde_json::Value>;

/// Name of the only channel the UI can send on.
pub const OUTBOUND_CHANNEL: &str = "to-worker";

/// Logical channels the router delivers on. Closed set: the UI cannot create
/// new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// One framed line of worker stdout
    WorkerMessage,
    /// One line of worker stderr (host-side diagnostics only)
    WorkerStderr,
    WorkerStarted,
    WorkerCrashed,
    WorkerExited,
    /// The webview finished loading
    HostReady,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::WorkerMessage,
        Channel::WorkerStderr,
        Channel::WorkerStarted,
        Channel::WorkerCrashed,
        Channel::WorkerExited,
        Channel::HostReady,
    ];

    /// Event name used on the wire
    pub fn name(self) -> &'static str {
        match self {
            Channel::WorkerMessage => "worker-message",
            Channel::WorkerStderr => "worker-stderr",
            Channel::WorkerStarted => "worker-started",
            Channel::WorkerCrashed => "worker-crashed",
            Channel::WorkerExited => "worker-exited",
            Channel::HostReady => "host-ready",
        }
    }

    pub fn from_name(name: &str) -> Option<Channel> {
        Channel::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Whether the webview may subscribe to this channel.
    pub fn is_ui_visible(self) -> bool {
        !matches!(self, Channel::WorkerStderr)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a listener receives.
///
/// Untagged so a worker line reaches the webview as a plain string, the way
/// the UI pages already parse it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Started(StartedReport),
    Exited(ExitReport),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedReport {
    pub pid: u32,
    pub executable: String,
}

/// Why the worker is no longer running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExitReason {
    /// Exited on its own with status 0
    Completed,
    /// Exited on its own with a non-zero status or a signal
    Crashed,
    /// Stopped by the host
    Terminated,
    /// Never got off the ground
    SpawnFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitReport {
    /// `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub reason: ExitReason,
}

impl ExitReport {
    /// Exit code reported when the worker could not be spawned at all.
    pub const SPAWN_FAILURE_CODE: i32 = -1;

    pub fn spawn_failed() -> Self {
        Self {
            code: Some(Self::SPAWN_FAILURE_CODE),
            reason: ExitReason::SpawnFailed,
        }
    }

    /// Classify a status the worker produced on its own.
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        let reason = if status.success() {
            ExitReason::Completed
        } else {
            ExitReason::Crashed
        };
        Self {
            code: status.code(),
            reason,
        }
    }

    pub fn is_crash(&self) -> bool {
        matches!(self.reason, ExitReason::Crashed | ExitReason::SpawnFailed)
    }
}

/// Snapshot of the supervisor state machine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum WorkerStatus {
    NotStarted,
    Running { pid: u32 },
    Exited(ExitReport),
}

impl WorkerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkerStatus::Running { .. })
    }
}

/// Handle the UI uses to cancel a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
