//! Core types shared by the devserve crates.
//!
//! - [`OwnerId`] keys every piece of per-project state
//! - [`DevServeConfig`] carries the tunables for ports, timeouts and storage
//! - [`PortAllocator`] leases non-colliding ports to owners

pub mod config;
pub mod owner;
pub mod ports;

pub use config::{ConfigError, DevServeConfig, InstallConfig};
pub use owner::OwnerId;
pub use ports::{PortAllocator, PortError, PortProbe, TcpConnectProbe};
