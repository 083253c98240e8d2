//! Per-project dev server supervision.
//!
//! A [`Supervisor`] owns at most one dev server process per owner and drives
//! it through `Starting → Running → Stopping → Stopped`. Output of each
//! process is pumped line by line into a [`Broadcaster`], which keeps a short
//! replay buffer so late subscribers see recent output before live events.
//! [`LogChannel`] frames a subscription as JSON messages and [`Launcher`]
//! prepares a project (root, program, dependencies) before starting it.

pub mod broadcast;
pub mod channel;
pub mod command;
pub mod error;
pub mod event;
pub mod launch;
pub mod pump;
pub mod state;
pub mod supervisor;
pub mod termination;

pub use broadcast::{Broadcaster, Delivery, DeliveryError, DropReason, Subscriber, SubscriberId};
pub use channel::{ChannelError, ClientMessage, LogChannel, ServerMessage};
pub use error::{LaunchError, SupervisorError};
pub use event::LogEvent;
pub use launch::{
    CommandInstaller, CommandProbe, DependencyInstaller, LaunchOptions, Launcher, ProjectRoots,
    SkipInstall, StorageRoots, WhichProbe,
};
pub use pump::OutputPump;
pub use state::{ServerInfo, ServerStatus};
pub use supervisor::{StartRequest, Supervisor};
pub use termination::StopOutcome;
