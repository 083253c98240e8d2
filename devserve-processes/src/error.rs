use devserve_core::{OwnerId, PortError};
use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum SupervisorError {
    #[error("No available ports for the dev server of {owner}")]
    PortExhausted {
        owner: OwnerId,
        #[source]
        source: PortError,
    },

    #[error("Port {port} is already allocated to another project ({holder})")]
    PortConflict { port: u16, holder: OwnerId },

    #[error("Invalid dev server command `{command}`: {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("Failed to start dev server for {owner}: {source}")]
    SpawnFailed {
        owner: OwnerId,
        #[source]
        source: std::io::Error,
    },

    #[error("Dev server for {owner} was stopped before it finished starting")]
    StartAborted { owner: OwnerId },

    #[error("Error stopping dev server for {owner}: {message}")]
    StopFailed { owner: OwnerId, message: String },
}

impl SupervisorError {
    pub(crate) fn from_port_error(owner: &OwnerId, err: PortError) -> Self {
        match err {
            PortError::Conflict { port, holder } => SupervisorError::PortConflict { port, holder },
            source @ PortError::NoPortsAvailable { .. } => SupervisorError::PortExhausted {
                owner: owner.clone(),
                source,
            },
        }
    }
}

/// Failures of the steps that run before a dev server is spawned.
#[derive(Error, Diagnostic, Debug)]
pub enum LaunchError {
    #[error("Invalid project id `{owner}`: {reason}")]
    InvalidOwner { owner: OwnerId, reason: &'static str },

    #[error("Failed to prepare project directory {path}: {source}")]
    ProjectRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` is not installed or not on PATH")]
    CommandUnavailable { program: String },

    #[error("{manifest} not found in {root}")]
    ManifestMissing { manifest: String, root: PathBuf },

    #[error("Failed to install dependencies for {owner}: {message}")]
    InstallFailed { owner: OwnerId, message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Supervisor(#[from] SupervisorError),
}
