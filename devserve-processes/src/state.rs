use chrono::{DateTime, Utc};
use devserve_core::OwnerId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Lifecycle state of an owner's dev server.
///
/// `Stopped` is never stored: an owner without a record is stopped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ServerStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Error(_) => "error",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: &ServerStatus) -> bool {
        use ServerStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Error(_), Starting)
                | (Starting, Running)
                | (Starting, Error(_))
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Error(_), Stopped)
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Error(message) if !message.is_empty() => write!(f, "error: {}", message),
            other => f.write_str(other.as_str()),
        }
    }
}

// The error message travels in its own event, so on the wire the status is
// just the state name.
impl Serialize for ServerStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ServerStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "stopped" => Ok(ServerStatus::Stopped),
            "starting" => Ok(ServerStatus::Starting),
            "running" => Ok(ServerStatus::Running),
            "stopping" => Ok(ServerStatus::Stopping),
            "error" => Ok(ServerStatus::Error(String::new())),
            other => Err(D::Error::custom(format!("unknown server status: {}", other))),
        }
    }
}

/// Public view of a dev server record. The process handle never leaves the
/// supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub owner: OwnerId,
    /// `None` while the port is still being resolved, or after it was released
    pub port: Option<u16>,
    pub status: ServerStatus,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl ServerInfo {
    pub(crate) fn starting(owner: &OwnerId) -> Self {
        Self {
            owner: owner.clone(),
            port: None,
            status: ServerStatus::Starting,
            pid: None,
            started_at: Utc::now(),
            error_message: None,
        }
    }
}

/// What `start` should do given the owner's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAction {
    /// A server is running or coming up; hand back its info.
    ReturnExisting,
    /// A stop is in flight; wait for it, then start fresh.
    AwaitStop,
    /// Create a new `Starting` record in place of whatever is there.
    Spawn,
}

/// What `stop` should do given the owner's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    Noop,
    /// Another caller is stopping this owner; wait for its completion signal.
    AwaitCompletion,
    /// The record holds no process (spawn failed); remove it.
    Discard,
    /// Move to `Stopping` and terminate the process.
    Terminate,
}

pub fn start_action(current: Option<&ServerStatus>) -> StartAction {
    match current {
        Some(ServerStatus::Running) | Some(ServerStatus::Starting) => StartAction::ReturnExisting,
        Some(ServerStatus::Stopping) => StartAction::AwaitStop,
        None | Some(ServerStatus::Stopped) | Some(ServerStatus::Error(_)) => StartAction::Spawn,
    }
}

pub fn stop_action(current: Option<&ServerStatus>) -> StopAction {
    match current {
        None | Some(ServerStatus::Stopped) => StopAction::Noop,
        Some(ServerStatus::Stopping) => StopAction::AwaitCompletion,
        Some(ServerStatus::Error(_)) => StopAction::Discard,
        Some(ServerStatus::Starting) | Some(ServerStatus::Running) => StopAction::Terminate,
    }
}
