//! Port leasing for dev servers.
//!
//! Each owner holds at most one lease and each port belongs to at most one
//! owner. New leases are found by scanning upward from a base port, skipping
//! leased ports and probing the rest. The probe is best-effort: a port that
//! refuses a connection is assumed free, and an unrelated process may still
//! bind it before the dev server does.

use async_trait::async_trait;
use miette::Diagnostic;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::DevServeConfig;
use crate::owner::OwnerId;

/// Default host for availability probes (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// First port handed out when no base is configured.
pub const DEFAULT_BASE_PORT: u16 = 3001;

/// Maximum number of ports to try before giving up.
pub const MAX_ATTEMPTS: u16 = 100;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("No available ports starting from {base} after {attempts} attempts")]
    NoPortsAvailable { base: u16, attempts: u16 },

    #[error("Port {port} is already allocated to {holder}")]
    Conflict { port: u16, holder: OwnerId },
}

/// Live availability check for a single port.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_available(&self, host: &str, port: u16) -> bool;
}

/// Probe that attempts a TCP connection; anything but an accepted connection
/// counts as available.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl PortProbe for TcpConnectProbe {
    async fn is_available(&self, host: &str, port: u16) -> bool {
        let addr = format!("{}:{}", host, port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => false,
            Ok(Err(_)) | Err(_) => true,
        }
    }
}

/// Leases ports to owners within `[base, base + max_attempts)`.
///
/// Allocation suspends while probing, so concurrent `allocate` calls are
/// serialized by an async gate. Lease bookkeeping itself sits behind a
/// synchronous mutex that is never held across a probe, which keeps
/// `claim`/`release` callable from non-async code.
pub struct PortAllocator {
    host: String,
    base: u16,
    max_attempts: u16,
    probe: Box<dyn PortProbe>,
    /// port -> owner
    leases: Mutex<HashMap<u16, OwnerId>>,
    allocation_gate: tokio::sync::Mutex<()>,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            base,
            max_attempts: MAX_ATTEMPTS,
            probe: Box::new(TcpConnectProbe::default()),
            leases: Mutex::new(HashMap::new()),
            allocation_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(config: &DevServeConfig) -> Self {
        Self::new(config.base_port)
            .with_host(config.host.clone())
            .with_max_attempts(config.max_port_attempts)
            .with_probe(TcpConnectProbe::new(config.probe_timeout))
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_probe(mut self, probe: impl PortProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u16, OwnerId>> {
        self.leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lease a port to `owner`.
    ///
    /// Returns the owner's existing lease unchanged if it has one, so retried
    /// starts never orphan a port. Otherwise scans for a free port.
    pub async fn allocate(&self, owner: &OwnerId) -> Result<u16, PortError> {
        let _gate = self.allocation_gate.lock().await;

        if let Some(port) = self.lease_of(owner) {
            return Ok(port);
        }

        for offset in 0..self.max_attempts {
            let Some(port) = self.base.checked_add(offset) else {
                // Port space exhausted (base + offset > 65535)
                break;
            };

            if self.owner_of(port).is_some() {
                continue;
            }

            if !self.probe.is_available(&self.host, port).await {
                debug!("Port {} is in use, trying next", port);
                continue;
            }

            // `claim` may have run while the probe was suspended
            let mut leases = self.lock();
            if let Some(existing) = find_lease(&leases, owner) {
                return Ok(existing);
            }
            if leases.contains_key(&port) {
                continue;
            }
            leases.insert(port, owner.clone());
            debug!("Allocated port {} to {}", port, owner);
            return Ok(port);
        }

        Err(PortError::NoPortsAvailable {
            base: self.base,
            attempts: self.max_attempts,
        })
    }

    /// Lease a specific port to `owner`.
    ///
    /// Succeeds when the port is free or already leased to `owner`. Any other
    /// lease the owner held is dropped, keeping one lease per owner.
    pub fn claim(&self, owner: &OwnerId, port: u16) -> Result<(), PortError> {
        let mut leases = self.lock();
        match leases.get(&port) {
            Some(holder) if holder == owner => Ok(()),
            Some(holder) => Err(PortError::Conflict {
                port,
                holder: holder.clone(),
            }),
            None => {
                leases.retain(|_, holder| holder != owner);
                leases.insert(port, owner.clone());
                debug!("Claimed port {} for {}", port, owner);
                Ok(())
            }
        }
    }

    /// Remove the lease on `port`, whoever holds it. Idempotent.
    pub fn release(&self, port: u16) -> Option<OwnerId> {
        let released = self.lock().remove(&port);
        if let Some(ref owner) = released {
            debug!("Released port {} held by {}", port, owner);
        }
        released
    }

    /// Remove the lease on `port` only if `owner` still holds it.
    pub fn release_owned(&self, owner: &OwnerId, port: u16) -> bool {
        let mut leases = self.lock();
        if leases.get(&port) == Some(owner) {
            leases.remove(&port);
            debug!("Released port {} held by {}", port, owner);
            true
        } else {
            false
        }
    }

    pub fn lease_of(&self, owner: &OwnerId) -> Option<u16> {
        find_lease(&self.lock(), owner)
    }

    pub fn owner_of(&self, port: u16) -> Option<OwnerId> {
        self.lock().get(&port).cloned()
    }

    /// All current leases, ordered by port.
    pub fn leases(&self) -> Vec<(u16, OwnerId)> {
        let mut leases: Vec<_> = self
            .lock()
            .iter()
            .map(|(port, owner)| (*port, owner.clone()))
            .collect();
        leases.sort();
        leases
    }
}

fn find_lease(leases: &HashMap<u16, OwnerId>, owner: &OwnerId) -> Option<u16> {
    leases
        .iter()
        .find_map(|(port, holder)| (holder == owner).then_some(*port))
}
