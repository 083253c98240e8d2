use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use devserve_core::{DevServeConfig, OwnerId, PortAllocator};
use nix::sys::signal::Signal;
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::command::build_command;
use crate::error::SupervisorError;
use crate::event::LogEvent;
use crate::pump::OutputPump;
use crate::state::{ServerInfo, ServerStatus, StartAction, StopAction, start_action, stop_action};
use crate::termination::{signal_group, terminate};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STOPPING_WAIT: Duration = Duration::from_secs(5);

/// How long a stop waits for buffered output before abandoning the readers.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// What to launch for an owner.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub command: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    /// Explicit port; leased to the owner if free
    pub port: Option<u16>,
}

impl StartRequest {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

struct ServerRecord {
    info: ServerInfo,
    generation: u64,
    child: Option<Child>,
    pump: Option<OutputPump>,
    /// Flipped to `true` once this record's stop has completed
    stopped: watch::Sender<bool>,
}

enum StopPlan {
    Noop,
    AwaitCompletion {
        generation: u64,
        done: watch::Receiver<bool>,
    },
    Discard {
        record: ServerRecord,
        seq: u64,
    },
    Terminate {
        generation: u64,
        seq: u64,
        info: ServerInfo,
        child: Option<Child>,
        pump: Option<OutputPump>,
    },
}

/// Owns every dev server process, one per owner.
///
/// Each operation decides what to do and records the intermediate state
/// (`Starting`, `Stopping`) under the record lock before its first `.await`,
/// so a concurrent call on the same owner sees that state and backs off.
pub struct Supervisor {
    records: Mutex<HashMap<OwnerId, ServerRecord>>,
    ports: Arc<PortAllocator>,
    broadcaster: Arc<Broadcaster>,
    stop_timeout: Duration,
    stopping_wait: Duration,
    next_generation: AtomicU64,
    /// Stamps status changes in the order they hit the records
    next_status_seq: AtomicU64,
}

/// Move `info` to `next`, checking the lifecycle in debug builds.
fn transition(info: &mut ServerInfo, next: ServerStatus) {
    debug_assert!(
        info.status.can_transition_to(&next),
        "invalid transition {} -> {}",
        info.status,
        next
    );
    info.status = next;
}

impl Supervisor {
    pub fn new(ports: Arc<PortAllocator>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ports,
            broadcaster,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            stopping_wait: DEFAULT_STOPPING_WAIT,
            next_generation: AtomicU64::new(1),
            next_status_seq: AtomicU64::new(1),
        }
    }

    pub fn from_config(
        ports: Arc<PortAllocator>,
        broadcaster: Arc<Broadcaster>,
        config: &DevServeConfig,
    ) -> Self {
        Self::new(ports, broadcaster)
            .with_stop_timeout(config.stop_timeout)
            .with_stopping_wait(config.stopping_wait)
    }

    /// Grace period between SIGTERM and SIGKILL.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// How long `stop` waits on another caller's stop before forcing cleanup.
    pub fn with_stopping_wait(mut self, wait: Duration) -> Self {
        self.stopping_wait = wait;
        self
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OwnerId, ServerRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stamp for a status change. Take it under the record lock, in the same
    /// critical section as the change itself.
    fn next_seq(&self) -> u64 {
        self.next_status_seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn publish(&self, info: &ServerInfo, seq: u64) {
        self.broadcaster
            .append_status(&info.owner, LogEvent::status(info), seq)
            .await;
    }

    async fn publish_stopped(&self, owner: &OwnerId, seq: u64) {
        self.broadcaster
            .append_status(owner, LogEvent::stopped(), seq)
            .await;
    }

    /// Release `port` unless the owner's current record is using it.
    ///
    /// A newer start for the same owner may have been handed the same lease.
    fn release_unless_in_use(
        &self,
        records: &HashMap<OwnerId, ServerRecord>,
        owner: &OwnerId,
        port: u16,
    ) {
        let in_use = records
            .get(owner)
            .is_some_and(|record| record.info.port == Some(port));
        if !in_use {
            self.ports.release_owned(owner, port);
        }
    }

    /// Remove the record of `generation` and release its port.
    ///
    /// Returns the stamp of the resulting `Stopped` status, or `None` if the
    /// record had already been replaced or removed.
    fn remove_record(&self, owner: &OwnerId, generation: u64) -> Option<u64> {
        let mut records = self.lock();
        let current = records
            .get(owner)
            .is_some_and(|record| record.generation == generation);
        if !current {
            return None;
        }
        let record = records.remove(owner)?;
        if let Some(port) = record.info.port {
            self.release_unless_in_use(&records, owner, port);
        }
        let _ = record.stopped.send(true);
        Some(self.next_seq())
    }

    /// The record of `generation` if it is still coming up. A concurrent stop
    /// moves it to `Stopping` or removes it.
    fn starting_record<'a>(
        records: &'a mut HashMap<OwnerId, ServerRecord>,
        owner: &OwnerId,
        generation: u64,
    ) -> Option<&'a mut ServerRecord> {
        records.get_mut(owner).filter(|record| {
            record.generation == generation && record.info.status == ServerStatus::Starting
        })
    }

    /// Start a dev server for `owner`, or return the one already running or
    /// coming up.
    pub async fn start(
        &self,
        owner: &OwnerId,
        request: StartRequest,
    ) -> Result<ServerInfo, SupervisorError> {
        let (generation, info, seq) = loop {
            let begun = {
                let mut records = self.lock();
                let existing = records.get(owner).map(|record| record.info.clone());
                match (start_action(existing.as_ref().map(|info| &info.status)), existing) {
                    (StartAction::ReturnExisting, Some(info)) => {
                        debug!("Dev server for {} is already {}", owner, info.status);
                        return Ok(info);
                    }
                    (StartAction::AwaitStop, Some(_)) => None,
                    _ => {
                        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                        let info = ServerInfo::starting(owner);
                        let (stopped, _) = watch::channel(false);
                        records.insert(
                            owner.clone(),
                            ServerRecord {
                                info: info.clone(),
                                generation,
                                child: None,
                                pump: None,
                                stopped,
                            },
                        );
                        Some((generation, info, self.next_seq()))
                    }
                }
            };

            match begun {
                Some(begun) => break begun,
                None => {
                    debug!("Dev server for {} is stopping, waiting before start", owner);
                    // Failures were already reported to the stopping caller
                    let _ = self.stop(owner).await;
                }
            }
        };

        info!("Starting dev server for {}", owner);
        self.publish(&info, seq).await;

        let port = match self.resolve_port(owner, request.port).await {
            Ok(port) => port,
            Err(err) => {
                warn!("Could not lease a port for {}: {}", owner, err);
                if let Some(seq) = self.remove_record(owner, generation) {
                    self.broadcaster
                        .append(owner, LogEvent::error(err.to_string()))
                        .await;
                    self.publish_stopped(owner, seq).await;
                }
                return Err(err);
            }
        };

        // Record the port, re-asserting the lease a late cleanup may have freed
        let recorded = {
            let mut records = self.lock();
            let current = Self::starting_record(&mut records, owner, generation).is_some();
            if !current {
                self.release_unless_in_use(&records, owner, port);
                Err(None)
            } else if let Err(err) = self.ports.claim(owner, port) {
                Err(Some(err))
            } else {
                if let Some(record) = records.get_mut(owner) {
                    record.info.port = Some(port);
                }
                Ok(())
            }
        };
        match recorded {
            Ok(()) => {}
            Err(None) => {
                return Err(SupervisorError::StartAborted {
                    owner: owner.clone(),
                });
            }
            Err(Some(err)) => {
                let err = SupervisorError::from_port_error(owner, err);
                if let Some(seq) = self.remove_record(owner, generation) {
                    self.broadcaster
                        .append(owner, LogEvent::error(err.to_string()))
                        .await;
                    self.publish_stopped(owner, seq).await;
                }
                return Err(err);
            }
        }

        let spawned = build_command(&request.command, &request.cwd, &request.env, port).and_then(
            |mut cmd| {
                cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
                    owner: owner.clone(),
                    source,
                })
            },
        );

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => return Err(self.fail_start(owner, generation, err).await),
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stored = {
            let mut records = self.lock();
            match Self::starting_record(&mut records, owner, generation) {
                Some(record) => {
                    transition(&mut record.info, ServerStatus::Running);
                    record.info.pid = pid;
                    record.child = Some(child);
                    Ok((record.info.clone(), self.next_seq()))
                }
                None => Err(child),
            }
        };

        let (info, seq) = match stored {
            Ok(stored) => stored,
            Err(mut child) => {
                // Stop began while spawning; the stop saw no child to kill
                debug!("Start of {} was aborted, terminating new process", owner);
                if let Err(errno) = terminate(&mut child, self.stop_timeout).await {
                    warn!("Failed to terminate aborted dev server for {}: {}", owner, errno);
                }
                self.release_unless_in_use(&self.lock(), owner, port);
                return Err(SupervisorError::StartAborted {
                    owner: owner.clone(),
                });
            }
        };

        info!(
            "Dev server for {} running on port {} (pid {:?})",
            owner, port, pid
        );
        self.publish(&info, seq).await;

        let pump = OutputPump::new(owner, stdout, stderr, &self.broadcaster);
        let leftover = {
            let mut records = self.lock();
            match records.get_mut(owner) {
                Some(record) if record.generation == generation => {
                    record.pump = Some(pump);
                    None
                }
                _ => Some(pump),
            }
        };
        if let Some(pump) = leftover {
            // Process is already being stopped; readers end at EOF
            pump.drain(DRAIN_TIMEOUT).await;
        }

        Ok(info)
    }

    async fn resolve_port(
        &self,
        owner: &OwnerId,
        requested: Option<u16>,
    ) -> Result<u16, SupervisorError> {
        let leased = match requested {
            Some(port) => self.ports.claim(owner, port).map(|()| port),
            None => self.ports.allocate(owner).await,
        };
        leased.map_err(|err| SupervisorError::from_port_error(owner, err))
    }

    /// Move the record to `Error`, release its port and report `err`.
    async fn fail_start(
        &self,
        owner: &OwnerId,
        generation: u64,
        err: SupervisorError,
    ) -> SupervisorError {
        let message = err.to_string();
        warn!("{}", message);

        let info = {
            let mut records = self.lock();
            // A stop in flight removes the record and its lease itself
            let released = Self::starting_record(&mut records, owner, generation).map(|record| {
                transition(&mut record.info, ServerStatus::Error(message.clone()));
                record.info.error_message = Some(message.clone());
                let port = record.info.port.take();
                (record.info.clone(), port)
            });
            match released {
                Some((info, port)) => {
                    if let Some(port) = port {
                        self.ports.release_owned(owner, port);
                    }
                    Some((info, self.next_seq()))
                }
                None => None,
            }
        };

        if let Some((info, seq)) = info {
            self.broadcaster
                .append(owner, LogEvent::error(message))
                .await;
            self.publish(&info, seq).await;
        }
        err
    }

    /// Stop the owner's dev server.
    ///
    /// Always leaves the owner without a record and without a port lease.
    /// `StopFailed` means the process group could not be signalled; the
    /// record was still removed.
    pub async fn stop(&self, owner: &OwnerId) -> Result<(), SupervisorError> {
        let plan = {
            let mut records = self.lock();
            match stop_action(records.get(owner).map(|r| &r.info.status)) {
                StopAction::Noop => StopPlan::Noop,
                StopAction::AwaitCompletion => match records.get(owner) {
                    Some(record) => StopPlan::AwaitCompletion {
                        generation: record.generation,
                        done: record.stopped.subscribe(),
                    },
                    None => StopPlan::Noop,
                },
                StopAction::Discard => match records.remove(owner) {
                    Some(record) => StopPlan::Discard {
                        record,
                        seq: self.next_seq(),
                    },
                    None => StopPlan::Noop,
                },
                StopAction::Terminate => match records.get_mut(owner) {
                    Some(record) => {
                        transition(&mut record.info, ServerStatus::Stopping);
                        StopPlan::Terminate {
                            generation: record.generation,
                            seq: self.next_seq(),
                            info: record.info.clone(),
                            child: record.child.take(),
                            pump: record.pump.take(),
                        }
                    }
                    None => StopPlan::Noop,
                },
            }
        };

        match plan {
            StopPlan::Noop => Ok(()),
            StopPlan::AwaitCompletion {
                generation,
                mut done,
            } => {
                let completed = tokio::time::timeout(self.stopping_wait, async {
                    // A dropped sender means the record is gone as well
                    let _ = done.wait_for(|stopped| *stopped).await;
                })
                .await
                .is_ok();
                if !completed {
                    warn!(
                        "Dev server for {} still stopping after {:?}, forcing cleanup",
                        owner, self.stopping_wait
                    );
                    if let Some(seq) = self.remove_record(owner, generation) {
                        self.publish_stopped(owner, seq).await;
                    }
                }
                Ok(())
            }
            StopPlan::Discard { record, seq } => {
                debug!("Discarding failed dev server record for {}", owner);
                if let Some(port) = record.info.port {
                    self.release_unless_in_use(&self.lock(), owner, port);
                }
                let _ = record.stopped.send(true);
                self.publish_stopped(owner, seq).await;
                Ok(())
            }
            StopPlan::Terminate {
                generation,
                seq,
                info,
                child,
                pump,
            } => {
                info!("Stopping dev server for {}", owner);
                self.publish(&info, seq).await;

                let mut failure = None;
                if let Some(mut child) = child {
                    match terminate(&mut child, self.stop_timeout).await {
                        Ok(outcome) => debug!("Dev server for {} stopped: {:?}", owner, outcome),
                        Err(errno) => {
                            failure = Some(format!("failed to signal process group: {errno}"));
                        }
                    }
                }
                if let Some(pump) = pump {
                    pump.drain(DRAIN_TIMEOUT).await;
                }

                if let Some(message) = &failure {
                    warn!("Error stopping dev server for {}: {}", owner, message);
                    self.broadcaster
                        .append(owner, LogEvent::error(message.clone()))
                        .await;
                    let errored = ServerInfo {
                        status: ServerStatus::Error(message.clone()),
                        error_message: Some(message.clone()),
                        ..info
                    };
                    self.publish(&errored, self.next_seq()).await;
                }

                if let Some(seq) = self.remove_record(owner, generation) {
                    self.publish_stopped(owner, seq).await;
                }

                match failure {
                    Some(message) => Err(SupervisorError::StopFailed {
                        owner: owner.clone(),
                        message,
                    }),
                    None => Ok(()),
                }
            }
        }
    }

    /// Stop every tracked dev server concurrently.
    ///
    /// Returns the owners whose stop reported a failure.
    pub async fn stop_all(&self) -> Vec<(OwnerId, SupervisorError)> {
        let owners = self.owners();
        if owners.is_empty() {
            return Vec::new();
        }
        info!("Stopping {} dev server(s)", owners.len());

        let results = futures::future::join_all(owners.into_iter().map(|owner| async move {
            let result = self.stop(&owner).await;
            (owner, result)
        }))
        .await;

        // Continue even if one fails
        results
            .into_iter()
            .filter_map(|(owner, result)| match result {
                Ok(()) => None,
                Err(err) => {
                    warn!("Failed to stop dev server for {}: {}", owner, err);
                    Some((owner, err))
                }
            })
            .collect()
    }

    pub fn status(&self, owner: &OwnerId) -> ServerStatus {
        self.lock()
            .get(owner)
            .map(|record| record.info.status.clone())
            .unwrap_or_default()
    }

    pub fn info(&self, owner: &OwnerId) -> Option<ServerInfo> {
        self.lock().get(owner).map(|record| record.info.clone())
    }

    pub fn is_running(&self, owner: &OwnerId) -> bool {
        self.status(owner) == ServerStatus::Running
    }

    /// Owners with a record, in order.
    pub fn owners(&self) -> Vec<OwnerId> {
        let mut owners: Vec<_> = self.lock().keys().cloned().collect();
        owners.sort();
        owners
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let records = self
            .records
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (owner, record) in records.iter() {
            if let Some(pid) = record.child.as_ref().and_then(Child::id) {
                debug!("Killing dev server for {} on shutdown", owner);
                let _ = signal_group(pid, Signal::SIGKILL);
            }
        }
    }
}
