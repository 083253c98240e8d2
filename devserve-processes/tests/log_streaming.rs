//! Output streaming integration tests: pump, broadcaster and launcher together.

mod common;

use common::*;
use devserve_processes::{
    LaunchOptions, Launcher, LogEvent, ServerStatus, SkipInstall, StorageRoots,
};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// stdout and stderr lines arrive tagged after the running status
#[tokio::test(flavor = "multi_thread")]
async fn test_output_is_streamed_after_running() {
    timeout(TEST_TIMEOUT, async {
        let ctx = TestContext::new();
        let p1 = owner("p1");
        let (_id, mut rx) = ctx.broadcaster.subscribe_channel(&p1).await;

        ctx.supervisor
            .start(
                &p1,
                ctx.request("sh -c 'echo compiled; echo warn >&2; sleep 100'"),
            )
            .await
            .expect("Failed to start");

        let mut seen_out = false;
        let mut seen_err = false;
        let events = recv_until(&mut rx, |event| {
            seen_out |= is_output(event, "compiled");
            seen_err |= is_output(event, "warn");
            seen_out && seen_err
        })
        .await;

        assert!(events.contains(&LogEvent::output("compiled", false)));
        assert!(events.contains(&LogEvent::output("warn", true)));
        assert_eq!(
            statuses(&events),
            vec![
                ServerStatus::Stopped,
                ServerStatus::Starting,
                ServerStatus::Running
            ]
        );
        let running_at = events
            .iter()
            .position(|event| is_status(event, &ServerStatus::Running))
            .unwrap();
        let first_output = events.iter().position(LogEvent::is_output).unwrap();
        assert!(running_at < first_output);

        ctx.supervisor.stop(&p1).await.expect("Failed to stop");
    })
    .await
    .expect("Test timed out");
}

/// A late subscriber gets the retained output before live lines
#[tokio::test(flavor = "multi_thread")]
async fn test_late_subscriber_replay() {
    timeout(TEST_TIMEOUT, async {
        let ctx = TestContext::new();
        let p1 = owner("p1");

        ctx.supervisor
            .start(
                &p1,
                ctx.request("sh -c 'for i in 1 2 3; do echo line $i; done; sleep 100'"),
            )
            .await
            .expect("Failed to start");

        let broadcaster = ctx.broadcaster.clone();
        let check_owner = p1.clone();
        assert!(
            wait_for_condition(
                || {
                    let broadcaster = broadcaster.clone();
                    let check_owner = check_owner.clone();
                    async move { broadcaster.history(&check_owner).await.len() == 3 }
                },
                STARTUP_TIMEOUT,
            )
            .await,
            "Output should be retained"
        );

        let (_id, mut rx) = ctx.broadcaster.subscribe_channel(&p1).await;
        let events = recv_until(&mut rx, |event| is_output(event, "line 3")).await;

        let info = ctx.supervisor.info(&p1).unwrap();
        assert_eq!(
            events,
            vec![
                LogEvent::status(&info),
                LogEvent::output("line 1", false),
                LogEvent::output("line 2", false),
                LogEvent::output("line 3", false),
            ]
        );

        ctx.supervisor.stop(&p1).await.expect("Failed to stop");
    })
    .await
    .expect("Test timed out");
}

/// One subscription observes a full stop and restart
#[tokio::test(flavor = "multi_thread")]
async fn test_subscriber_survives_restart() {
    timeout(TEST_TIMEOUT, async {
        let ctx = TestContext::new();
        let p1 = owner("p1");
        let (_id, mut rx) = ctx.broadcaster.subscribe_channel(&p1).await;

        ctx.supervisor
            .start(&p1, ctx.request("sh -c 'echo first; sleep 100'"))
            .await
            .expect("Failed to start");
        recv_until(&mut rx, |event| is_output(event, "first")).await;

        ctx.supervisor.stop(&p1).await.expect("Failed to stop");
        assert!(
            ctx.broadcaster.history(&p1).await.is_empty(),
            "History is cleared on stop"
        );

        ctx.supervisor
            .start(&p1, ctx.request("sh -c 'echo second; sleep 100'"))
            .await
            .expect("Failed to restart");
        let events = recv_until(&mut rx, |event| is_output(event, "second")).await;

        assert_eq!(
            statuses(&events),
            vec![
                ServerStatus::Stopping,
                ServerStatus::Stopped,
                ServerStatus::Starting,
                ServerStatus::Running
            ]
        );
        assert_eq!(ctx.broadcaster.subscriber_count(&p1).await, 1);

        ctx.supervisor.stop(&p1).await.expect("Failed to stop");
    })
    .await
    .expect("Test timed out");
}

/// The launcher prepares the project root and starts the server there
#[tokio::test(flavor = "multi_thread")]
async fn test_launcher_starts_in_project_root() {
    timeout(TEST_TIMEOUT, async {
        let ctx = TestContext::new();
        let p1 = owner("p1");
        let projects = ctx.temp_path().join("projects");
        let launcher = Launcher::new(ctx.supervisor.clone(), StorageRoots::new(&projects))
            .with_installer(SkipInstall)
            .with_default_command("sh -c 'pwd; sleep 100'");
        let (_id, mut rx) = ctx.broadcaster.subscribe_channel(&p1).await;

        let info = launcher
            .launch(&p1, LaunchOptions::default())
            .await
            .expect("Failed to launch");
        assert_eq!(info.status, ServerStatus::Running);

        let root = projects.join("p1");
        assert!(root.is_dir());
        let events = recv_until(&mut rx, LogEvent::is_output).await;
        let expected = root.canonicalize().unwrap();
        assert!(
            events.iter().any(|event| match event {
                LogEvent::Output { line, .. } =>
                    std::path::Path::new(line).canonicalize().ok().as_ref() == Some(&expected),
                _ => false,
            }),
            "{events:?}"
        );

        // Launching again hands back the running server
        let again = launcher
            .launch(&p1, LaunchOptions::default())
            .await
            .expect("Failed to launch again");
        assert_eq!(again.pid, info.pid);

        ctx.supervisor.stop(&p1).await.expect("Failed to stop");
    })
    .await
    .expect("Test timed out");
}
