use clap::{Args, Parser, Subcommand, crate_version};
use devserve_core::DevServeConfig;
use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    /// A verbose structured log format (default).
    #[default]
    Full,
    /// A pretty human-readable log format used for debugging.
    Pretty,
    /// A JSON log format used for machine consumption.
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "devserve",
    version = crate_version!(),
    about = "Run per-project dev servers and stream their output as JSON lines"
)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable additional debug logs.")]
    pub verbose: bool,

    #[arg(
        short,
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Silence all logs"
    )]
    pub quiet: bool,

    #[arg(
        long,
        global = true,
        env = "DEVSERVE_LOG_FORMAT",
        value_enum,
        default_value_t,
        help = "Format of diagnostic logs written to stderr."
    )]
    pub log_format: LogFormat,

    #[arg(
        long,
        global = true,
        env = "DEVSERVE_CONFIG",
        help = "JSON configuration file. Unset fields keep their defaults."
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "STORAGE_BASE_DIR",
        help = "Directory holding the projects/ tree."
    )]
    pub storage_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "First port tried when leasing a port.")]
    pub base_port: Option<u16>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Launch a project's dev server and stream its events until interrupted.")]
    Run(RunArgs),

    #[command(about = "Print the effective configuration as JSON.")]
    Config,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long, help = "Project id owning the dev server.")]
    pub owner: String,

    #[arg(long, help = "Command line to run instead of the configured dev command.")]
    pub command: Option<String>,

    #[arg(long, help = "Explicit port to lease instead of scanning for one.")]
    pub port: Option<u16>,

    #[arg(long, help = "Do not install dependencies before starting.")]
    pub skip_install: bool,

    #[arg(
        short = 'e',
        long = "env",
        value_name = "KEY=VALUE",
        value_parser = parse_env,
        help = "Extra environment variable for the dev server. May be repeated."
    )]
    pub env: Vec<(String, String)>,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

impl Cli {
    /// The configuration file (if any) with command line overrides applied.
    pub fn load_config(&self) -> miette::Result<DevServeConfig> {
        let mut config = match &self.config {
            Some(path) => DevServeConfig::load(path)?,
            None => DevServeConfig::default(),
        };
        if let Some(dir) = &self.storage_dir {
            config.storage_dir = dir.clone();
        }
        if let Some(port) = self.base_port {
            config.base_port = port;
        }
        Ok(config)
    }
}
