//! Shared test utilities for devserve-processes integration tests.

// Each test file compiles separately, so not all helpers are used in each binary
#![allow(dead_code)]

use async_trait::async_trait;
use devserve_core::{OwnerId, PortAllocator, PortProbe};
use devserve_processes::{Broadcaster, LogEvent, ServerStatus, StartRequest, Supervisor};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_TEST_BASE: u16 = 4001;

/// Port probe that reports every port as free
pub struct FreeProbe;

#[async_trait]
impl PortProbe for FreeProbe {
    async fn is_available(&self, _host: &str, _port: u16) -> bool {
        true
    }
}

/// Port probe that takes a while before reporting a port free
pub struct SlowProbe(pub Duration);

#[async_trait]
impl PortProbe for SlowProbe {
    async fn is_available(&self, _host: &str, _port: u16) -> bool {
        tokio::time::sleep(self.0).await;
        true
    }
}

/// Test context that manages temp directories and the supervisor under test
pub struct TestContext {
    pub temp_dir: TempDir,
    pub project_dir: PathBuf,
    pub broadcaster: Arc<Broadcaster>,
    pub supervisor: Arc<Supervisor>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_ports(PortAllocator::new(DEFAULT_TEST_BASE).with_probe(FreeProbe))
    }

    pub fn with_base(base: u16) -> Self {
        Self::with_ports(PortAllocator::new(base).with_probe(FreeProbe))
    }

    pub fn with_ports(ports: PortAllocator) -> Self {
        Self::build(ports, |supervisor| supervisor)
    }

    /// Build a context, adjusting the supervisor before it is shared
    pub fn build(ports: PortAllocator, configure: impl FnOnce(Supervisor) -> Supervisor) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let project_dir = temp_dir.path().join("project");
        std::fs::create_dir_all(&project_dir).expect("Failed to create project dir");
        let broadcaster = Arc::new(Broadcaster::default());
        let supervisor = configure(Supervisor::new(Arc::new(ports), broadcaster.clone()));
        Self {
            temp_dir,
            project_dir,
            broadcaster,
            supervisor: Arc::new(supervisor),
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A start request running `command` in the project directory
    pub fn request(&self, command: &str) -> StartRequest {
        StartRequest::new(command, &self.project_dir)
    }
}

pub fn owner(id: &str) -> OwnerId {
    OwnerId::from(id)
}

/// Whether a process with this pid exists (zombies included)
pub fn process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

// ============================================================================
// Wait Helpers
// ============================================================================

/// Wait for a condition with exponential backoff
pub async fn wait_for_condition<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    let mut delay = Duration::from_millis(10);
    let max_delay = Duration::from_millis(500);

    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
    false
}

/// Receive events until one matches `done` (inclusive) or the startup timeout
/// expires.
pub async fn recv_until<F>(rx: &mut mpsc::Receiver<LogEvent>, mut done: F) -> Vec<LogEvent>
where
    F: FnMut(&LogEvent) -> bool,
{
    let mut events = Vec::new();
    let _ = tokio::time::timeout(STARTUP_TIMEOUT, async {
        while let Some(event) = rx.recv().await {
            let finished = done(&event);
            events.push(event);
            if finished {
                break;
            }
        }
    })
    .await;
    events
}

pub fn is_status(event: &LogEvent, expected: &ServerStatus) -> bool {
    matches!(event, LogEvent::Status { status, .. } if status == expected)
}

pub fn is_output(event: &LogEvent, expected: &str) -> bool {
    matches!(event, LogEvent::Output { line, .. } if line == expected)
}

/// The status values among `events`, in order
pub fn statuses(events: &[LogEvent]) -> Vec<ServerStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            LogEvent::Status { status, .. } => Some(status.clone()),
            _ => None,
        })
        .collect()
}
