//! Everything that has to happen before a dev server can be spawned.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use devserve_core::{DevServeConfig, InstallConfig, OwnerId};
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::command::{piped_command, program_name, split_command};
use crate::error::{LaunchError, SupervisorError};
use crate::event::LogEvent;
use crate::pump::OutputPump;
use crate::state::{ServerInfo, ServerStatus};
use crate::supervisor::{StartRequest, Supervisor};
use crate::termination::terminate;

const INSTALL_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const INSTALL_KILL_GRACE: Duration = Duration::from_secs(5);

/// Resolves the working directory of an owner's project.
#[async_trait]
pub trait ProjectRoots: Send + Sync {
    async fn project_root(&self, owner: &OwnerId) -> Result<PathBuf, LaunchError>;
}

/// Projects stored as `<projects_dir>/<owner>`.
#[derive(Debug, Clone)]
pub struct StorageRoots {
    projects_dir: PathBuf,
}

impl StorageRoots {
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
        }
    }

    pub fn from_config(config: &DevServeConfig) -> Self {
        Self::new(config.projects_dir())
    }
}

fn validate_owner(owner: &OwnerId) -> Result<(), LaunchError> {
    let id = owner.as_str();
    let reason = if id.is_empty() {
        "must not be empty"
    } else if id.contains('/') || id.contains('\\') {
        "must not contain path separators"
    } else if id == "." || id.contains("..") {
        "must not reference a parent or current directory"
    } else {
        return Ok(());
    };
    Err(LaunchError::InvalidOwner {
        owner: owner.clone(),
        reason,
    })
}

#[async_trait]
impl ProjectRoots for StorageRoots {
    async fn project_root(&self, owner: &OwnerId) -> Result<PathBuf, LaunchError> {
        validate_owner(owner)?;
        let path = self.projects_dir.join(owner.as_str());
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| LaunchError::ProjectRoot {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

/// Whether a program can be executed.
#[async_trait]
pub trait CommandProbe: Send + Sync {
    async fn is_available(&self, program: &str) -> bool;
}

/// Looks programs up on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhichProbe;

#[async_trait]
impl CommandProbe for WhichProbe {
    async fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Makes sure a project's dependencies are present before its server starts.
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn ensure_installed(
        &self,
        owner: &OwnerId,
        root: &Path,
        broadcaster: &Arc<Broadcaster>,
    ) -> Result<(), LaunchError>;
}

/// Installer for projects that need no install step.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipInstall;

#[async_trait]
impl DependencyInstaller for SkipInstall {
    async fn ensure_installed(
        &self,
        _owner: &OwnerId,
        _root: &Path,
        _broadcaster: &Arc<Broadcaster>,
    ) -> Result<(), LaunchError> {
        Ok(())
    }
}

/// Runs an install command unless its marker already exists.
///
/// Install output is streamed to the owner's subscribers like server output.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    config: InstallConfig,
}

impl CommandInstaller {
    pub fn new(config: InstallConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DependencyInstaller for CommandInstaller {
    async fn ensure_installed(
        &self,
        owner: &OwnerId,
        root: &Path,
        broadcaster: &Arc<Broadcaster>,
    ) -> Result<(), LaunchError> {
        let marker = root.join(&self.config.marker);
        if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            debug!("{} exists, skipping install for {}", marker.display(), owner);
            return Ok(());
        }

        let manifest = root.join(&self.config.manifest);
        if !tokio::fs::try_exists(&manifest).await.unwrap_or(false) {
            return Err(LaunchError::ManifestMissing {
                manifest: self.config.manifest.clone(),
                root: root.to_path_buf(),
            });
        }

        let argv = split_command(&self.config.command)?;
        let command = &self.config.command;
        info!("Installing dependencies for {} with `{}`", owner, command);

        let mut child = piped_command(&argv, root)
            .spawn()
            .map_err(|e| LaunchError::InstallFailed {
                owner: owner.clone(),
                message: format!("failed to run `{command}`: {e}"),
            })?;
        let pump = OutputPump::attach(owner, &mut child, broadcaster);

        let message = match tokio::time::timeout(self.config.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                pump.drain(INSTALL_DRAIN_TIMEOUT).await;
                debug!("Dependencies installed for {}", owner);
                return Ok(());
            }
            Ok(Ok(status)) => {
                pump.drain(INSTALL_DRAIN_TIMEOUT).await;
                format!("`{command}` exited with {status}")
            }
            Ok(Err(e)) => {
                pump.abort();
                format!("failed to wait for `{command}`: {e}")
            }
            Err(_) => {
                if let Err(errno) = terminate(&mut child, INSTALL_KILL_GRACE).await {
                    warn!("Failed to terminate install for {}: {}", owner, errno);
                }
                pump.drain(INSTALL_DRAIN_TIMEOUT).await;
                format!(
                    "`{command}` did not finish within {:?}",
                    self.config.timeout
                )
            }
        };

        Err(LaunchError::InstallFailed {
            owner: owner.clone(),
            message,
        })
    }
}

/// Per-launch overrides.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Defaults to the launcher's dev command
    pub command: Option<String>,
    pub env: HashMap<String, String>,
    pub port: Option<u16>,
}

type PrepareGates = HashMap<OwnerId, Arc<tokio::sync::Mutex<()>>>;

/// Prepares an owner's project and starts its dev server.
///
/// Launches for the same owner are prepared one at a time, so the install
/// step never runs twice in one project directory.
pub struct Launcher {
    supervisor: Arc<Supervisor>,
    roots: Box<dyn ProjectRoots>,
    probe: Box<dyn CommandProbe>,
    installer: Box<dyn DependencyInstaller>,
    default_command: String,
    preparing: Mutex<PrepareGates>,
}

impl Launcher {
    pub fn new(supervisor: Arc<Supervisor>, roots: impl ProjectRoots + 'static) -> Self {
        Self {
            supervisor,
            roots: Box::new(roots),
            probe: Box::new(WhichProbe),
            installer: Box::new(SkipInstall),
            default_command: DevServeConfig::default().dev_command,
            preparing: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(supervisor: Arc<Supervisor>, config: &DevServeConfig) -> Self {
        Self::new(supervisor, StorageRoots::from_config(config))
            .with_installer(CommandInstaller::new(config.install.clone()))
            .with_default_command(config.dev_command.clone())
    }

    pub fn with_probe(mut self, probe: impl CommandProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_installer(mut self, installer: impl DependencyInstaller + 'static) -> Self {
        self.installer = Box::new(installer);
        self
    }

    pub fn with_default_command(mut self, command: impl Into<String>) -> Self {
        self.default_command = command.into();
        self
    }

    fn lock_gates(&self) -> std::sync::MutexGuard<'_, PrepareGates> {
        self.preparing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate_for(&self, owner: &OwnerId) -> Arc<tokio::sync::Mutex<()>> {
        self.lock_gates().entry(owner.clone()).or_default().clone()
    }

    /// Forget the owner's gate once no other launch holds or awaits it.
    fn release_gate(&self, owner: &OwnerId, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut gates = self.lock_gates();
        if Arc::strong_count(gate) == 2
            && gates.get(owner).is_some_and(|current| Arc::ptr_eq(current, gate))
        {
            gates.remove(owner);
        }
    }

    /// The owner's server if it is running or coming up.
    fn active(&self, owner: &OwnerId) -> Option<ServerInfo> {
        self.supervisor
            .info(owner)
            .filter(|info| matches!(info.status, ServerStatus::Running | ServerStatus::Starting))
    }

    /// Start the owner's dev server, preparing its project first.
    ///
    /// A server that is already running or starting is returned as is,
    /// without touching the project.
    pub async fn launch(
        &self,
        owner: &OwnerId,
        options: LaunchOptions,
    ) -> Result<ServerInfo, LaunchError> {
        if let Some(info) = self.active(owner) {
            return Ok(info);
        }

        let gate = self.gate_for(owner);
        let launched = {
            let _preparing = gate.lock().await;
            // A launch that held the gate before us may have started the server
            match self.active(owner) {
                Some(info) => Ok(info),
                None => self.prepare_and_start(owner, options).await,
            }
        };
        self.release_gate(owner, &gate);
        launched
    }

    async fn prepare_and_start(
        &self,
        owner: &OwnerId,
        options: LaunchOptions,
    ) -> Result<ServerInfo, LaunchError> {
        let request = match self.prepare(owner, options).await {
            Ok(request) => request,
            Err(err) => {
                warn!("Failed to prepare {}: {}", owner, err);
                self.supervisor
                    .broadcaster()
                    .append(owner, LogEvent::error(err.to_string()))
                    .await;
                return Err(err);
            }
        };

        // The supervisor reports its own failures to subscribers
        Ok(self.supervisor.start(owner, request).await?)
    }

    async fn prepare(
        &self,
        owner: &OwnerId,
        options: LaunchOptions,
    ) -> Result<StartRequest, LaunchError> {
        let root = self.roots.project_root(owner).await?;

        let command = options
            .command
            .unwrap_or_else(|| self.default_command.clone());
        let program = program_name(&command).ok_or_else(|| SupervisorError::InvalidCommand {
            command: command.clone(),
            reason: "command is empty".to_string(),
        })?;
        if !self.probe.is_available(&program).await {
            return Err(LaunchError::CommandUnavailable { program });
        }

        self.installer
            .ensure_installed(owner, &root, self.supervisor.broadcaster())
            .await?;

        Ok(StartRequest {
            command,
            cwd: root,
            env: options.env,
            port: options.port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn owner() -> OwnerId {
        OwnerId::from("p1")
    }

    fn installer(command: &str, timeout: Duration) -> CommandInstaller {
        CommandInstaller::new(InstallConfig {
            command: command.to_string(),
            timeout,
            ..Default::default()
        })
    }

    fn project_with_manifest() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        dir
    }

    struct Missing;

    struct AlwaysFree;

    #[async_trait]
    impl devserve_core::PortProbe for AlwaysFree {
        async fn is_available(&self, _host: &str, _port: u16) -> bool {
            true
        }
    }

    /// Installer that counts its runs and takes a while to finish
    struct CountingInstaller(Arc<AtomicUsize>);

    #[async_trait]
    impl DependencyInstaller for CountingInstaller {
        async fn ensure_installed(
            &self,
            _owner: &OwnerId,
            _root: &Path,
            _broadcaster: &Arc<Broadcaster>,
        ) -> Result<(), LaunchError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    #[async_trait]
    impl CommandProbe for Missing {
        async fn is_available(&self, _program: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_storage_roots_creates_project_dir() {
        let storage = TempDir::new().unwrap();
        let roots = StorageRoots::new(storage.path().join("projects"));

        let root = roots.project_root(&owner()).await.unwrap();

        assert_eq!(root, storage.path().join("projects").join("p1"));
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn test_storage_roots_rejects_escaping_owners() {
        let storage = TempDir::new().unwrap();
        let roots = StorageRoots::new(storage.path());

        for id in ["", ".", "..", "../etc", "a/b", r"a\b"] {
            let err = roots.project_root(&OwnerId::from(id)).await.unwrap_err();
            assert!(
                matches!(err, LaunchError::InvalidOwner { .. }),
                "{id:?} was accepted"
            );
        }
    }

    #[tokio::test]
    async fn test_install_skipped_when_marker_exists() {
        let project = TempDir::new().unwrap();
        std::fs::create_dir(project.path().join("node_modules")).unwrap();
        let broadcaster = Arc::new(Broadcaster::default());

        // Would fail if it ran
        installer("false", Duration::from_secs(5))
            .ensure_installed(&owner(), project.path(), &broadcaster)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_install_requires_manifest() {
        let project = TempDir::new().unwrap();
        let broadcaster = Arc::new(Broadcaster::default());

        let err = installer("true", Duration::from_secs(5))
            .ensure_installed(&owner(), project.path(), &broadcaster)
            .await
            .unwrap_err();

        assert!(matches!(err, LaunchError::ManifestMissing { .. }));
    }

    #[tokio::test]
    async fn test_install_output_is_streamed() {
        let project = project_with_manifest();
        let broadcaster = Arc::new(Broadcaster::default());

        installer("sh -c 'echo added 3 packages'", Duration::from_secs(10))
            .ensure_installed(&owner(), project.path(), &broadcaster)
            .await
            .unwrap();

        assert_eq!(
            broadcaster.history(&owner()).await,
            vec![LogEvent::output("added 3 packages", false)]
        );
    }

    #[tokio::test]
    async fn test_failed_install_reports_exit_status() {
        let project = project_with_manifest();
        let broadcaster = Arc::new(Broadcaster::default());

        let err = installer("sh -c 'echo ERESOLVE >&2; exit 3'", Duration::from_secs(10))
            .ensure_installed(&owner(), project.path(), &broadcaster)
            .await
            .unwrap_err();

        match err {
            LaunchError::InstallFailed { message, .. } => assert!(message.contains('3'), "{message}"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            broadcaster.history(&owner()).await,
            vec![LogEvent::output("ERESOLVE", true)]
        );
    }

    #[tokio::test]
    async fn test_install_timeout() {
        let project = project_with_manifest();
        let broadcaster = Arc::new(Broadcaster::default());

        let err = installer("sleep 30", Duration::from_millis(200))
            .ensure_installed(&owner(), project.path(), &broadcaster)
            .await
            .unwrap_err();

        assert!(matches!(err, LaunchError::InstallFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_reported_to_subscribers() {
        let storage = TempDir::new().unwrap();
        let broadcaster = Arc::new(Broadcaster::default());
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(devserve_core::PortAllocator::new(47400)),
            broadcaster.clone(),
        ));
        let launcher = Launcher::new(supervisor.clone(), StorageRoots::new(storage.path()))
            .with_probe(Missing);
        let (_id, mut rx) = broadcaster.subscribe_channel(&owner()).await;

        let err = launcher
            .launch(&owner(), LaunchOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LaunchError::CommandUnavailable { ref program } if program == "npm"
        ));
        assert_eq!(rx.recv().await, Some(LogEvent::stopped()));
        assert_eq!(rx.recv().await, Some(LogEvent::error(err.to_string())));
        assert_eq!(supervisor.status(&owner()), ServerStatus::Stopped);
        assert!(supervisor.ports().leases().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_launches_install_once() {
        let storage = TempDir::new().unwrap();
        let ports = devserve_core::PortAllocator::new(47500).with_probe(AlwaysFree);
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(ports),
            Arc::new(Broadcaster::default()),
        ));
        let installs = Arc::new(AtomicUsize::new(0));
        let launcher = Launcher::new(supervisor.clone(), StorageRoots::new(storage.path()))
            .with_installer(CountingInstaller(installs.clone()))
            .with_default_command("sleep 100");

        let (owner_a, owner_b) = (owner(), owner());
        let (first, second) = tokio::join!(
            launcher.launch(&owner_a, LaunchOptions::default()),
            launcher.launch(&owner_b, LaunchOptions::default()),
        );
        let first = first.unwrap();
        let second = second.unwrap();

        assert_eq!(installs.load(Ordering::SeqCst), 1);
        assert_eq!(first.status, ServerStatus::Running);
        assert_eq!(first.pid, second.pid);
        assert!(launcher.lock_gates().is_empty());

        supervisor.stop(&owner()).await.unwrap();
    }
}
