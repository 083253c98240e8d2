//! Graceful-then-forced termination of a dev server's process group.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::Child;
use tracing::{debug, warn};

/// Upper bound on waiting for exit after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How a process ended when asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the grace period after SIGTERM
    Graceful,
    /// Ignored SIGTERM for the whole grace period and was killed
    GracefulStopTimeout,
    /// Had already exited before any signal was delivered
    ProcessAlreadyGone,
}

/// Send `signal` to the process group led by `pid`.
pub fn signal_group(pid: u32, signal: Signal) -> nix::Result<()> {
    killpg(Pid::from_raw(pid as i32), signal)
}

/// Terminate `child` and its process group.
///
/// Sends SIGTERM, waits up to `grace`, then escalates to SIGKILL. A missing
/// process is not an error. Errors are only returned when a signal could not
/// be delivered for another reason; the caller must still clean up.
pub async fn terminate(child: &mut Child, grace: Duration) -> Result<StopOutcome, Errno> {
    let Some(pid) = child.id() else {
        // Already reaped
        return Ok(StopOutcome::ProcessAlreadyGone);
    };

    match signal_group(pid, Signal::SIGTERM) {
        Ok(()) => {
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return Ok(StopOutcome::Graceful);
            }
            warn!(
                "Process group {} did not exit within {:?}, sending SIGKILL",
                pid, grace
            );
            force_kill(child, pid).await?;
            Ok(StopOutcome::GracefulStopTimeout)
        }
        Err(Errno::ESRCH) => {
            debug!("Process group {} already gone", pid);
            force_kill(child, pid).await?;
            Ok(StopOutcome::ProcessAlreadyGone)
        }
        Err(e) => {
            // Still make sure the direct child goes away
            let _ = child.start_kill();
            let _ = tokio::time::timeout(KILL_WAIT, child.wait()).await;
            Err(e)
        }
    }
}

async fn force_kill(child: &mut Child, pid: u32) -> Result<(), Errno> {
    let result = match signal_group(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    };
    // The leader may have left its group; kill it directly as well
    let _ = child.start_kill();
    if tokio::time::timeout(KILL_WAIT, child.wait()).await.is_err() {
        warn!("Process {} did not exit after SIGKILL", pid);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::piped_command;
    use std::path::Path;

    fn spawn(script: &str) -> Child {
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        piped_command(&argv, Path::new("/")).spawn().unwrap()
    }

    #[tokio::test]
    async fn test_graceful_termination() {
        let mut child = spawn("sleep 100");
        let outcome = terminate(&mut child, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_escalates_when_sigterm_ignored() {
        let mut child = spawn("trap '' TERM; sleep 100 & wait");
        // Give the shell a moment to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = terminate(&mut child, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::GracefulStopTimeout);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_already_exited_process() {
        let mut child = spawn("exit 0");
        child.wait().await.unwrap();

        let outcome = terminate(&mut child, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, StopOutcome::ProcessAlreadyGone);
    }
}
