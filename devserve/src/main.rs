mod cli;
mod log;
mod stdio;

use clap::Parser;
use cli::{Cli, Commands, RunArgs};
use devserve_core::{DevServeConfig, OwnerId, PortAllocator};
use devserve_processes::{Broadcaster, LaunchOptions, Launcher, LogChannel, SkipInstall, Supervisor};
use futures::StreamExt;
use miette::{IntoDiagnostic, Result, WrapErr, bail};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FLUSH_GRACE: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    log::init_tracing(log::Level::from_flags(cli.verbose, cli.quiet), cli.log_format);

    let config = cli.load_config()?;
    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Config => {
            let json = serde_json::to_string_pretty(&config).into_diagnostic()?;
            println!("{json}");
            Ok(())
        }
    }
}

/// Cancel `token` on the first SIGTERM or SIGINT.
fn watch_signals(token: CancellationToken) -> Result<()> {
    use signal_hook::consts::signal::*;
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGTERM, SIGINT])
        .into_diagnostic()
        .wrap_err("Failed to install signal handlers")?;
    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            debug!("Received signal {}", signal);
            token.cancel();
        }
    });
    Ok(())
}

async fn run(config: DevServeConfig, args: RunArgs) -> Result<()> {
    let owner = OwnerId::new(args.owner);

    let ports = Arc::new(PortAllocator::from_config(&config));
    let broadcaster = Arc::new(Broadcaster::from_config(&config));
    let supervisor = Arc::new(Supervisor::from_config(
        ports,
        broadcaster.clone(),
        &config,
    ));
    let mut launcher = Launcher::from_config(supervisor.clone(), &config);
    if args.skip_install {
        launcher = launcher.with_installer(SkipInstall);
    }

    let shutdown = CancellationToken::new();
    watch_signals(shutdown.clone())?;

    let mut session = tokio::spawn(
        LogChannel::new(broadcaster.clone(), owner.clone())
            .run(stdio::stdin_frames(), stdio::stdout_frames()),
    );

    let options = LaunchOptions {
        command: args.command,
        env: args.env.into_iter().collect(),
        port: args.port,
    };
    let launched = tokio::select! {
        result = launcher.launch(&owner, options) => Some(result),
        _ = shutdown.cancelled() => None,
    };

    match launched {
        Some(Ok(info)) => {
            info!(
                "Dev server for {} is {} on port {:?}",
                owner, info.status, info.port
            );
            shutdown.cancelled().await;
            info!("Received shutdown signal, stopping dev servers");
        }
        Some(Err(err)) => {
            supervisor.stop_all().await;
            session.abort();
            return Err(err).wrap_err_with(|| format!("Failed to launch dev server for {owner}"));
        }
        None => info!("Interrupted while launching {}", owner),
    }

    let failures = supervisor.stop_all().await;

    // Let the final status events reach stdout
    match tokio::time::timeout(FLUSH_GRACE, &mut session).await {
        Ok(Ok(Err(err))) => warn!("Log session ended with an error: {}", err),
        _ => session.abort(),
    }

    if !failures.is_empty() {
        bail!("{} dev server(s) did not stop cleanly", failures.len());
    }
    Ok(())
}
