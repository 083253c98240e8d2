use crate::state::{ServerInfo, ServerStatus};

/// Event flowing from a dev server to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// One line of process output
    Output { line: String, is_stderr: bool },
    /// Lifecycle change
    Status {
        status: ServerStatus,
        port: Option<u16>,
        pid: Option<u32>,
    },
    /// Advisory failure; never terminates a subscription
    Error { message: String },
}

impl LogEvent {
    pub fn output(line: impl Into<String>, is_stderr: bool) -> Self {
        LogEvent::Output {
            line: line.into(),
            is_stderr,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        LogEvent::Error {
            message: message.into(),
        }
    }

    pub fn status(info: &ServerInfo) -> Self {
        LogEvent::Status {
            status: info.status.clone(),
            port: info.port,
            pid: info.pid,
        }
    }

    pub fn stopped() -> Self {
        LogEvent::Status {
            status: ServerStatus::Stopped,
            port: None,
            pid: None,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self, LogEvent::Output { .. })
    }
}
