use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sidecar")]
#[command(about = "Local supervisor for the agent backend and the workspace content server", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Log output format (logs go to stderr)
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "SIDECAR_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Supervise the configured services, reading commands from stdin
    Run(RunArgs),

    /// Report whether something is bound to a loopback port
    Probe(PortArgs),

    /// Force-kill every process listening on a loopback port
    KillPort(PortArgs),
}

#[derive(Parser)]
pub struct RunArgs {
    /// Config file path (defaults to discovering sidecar.json)
    #[arg(short, long, env = "SIDECAR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Workspace directory served by the content server at startup
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Display name of the startup workspace (defaults to the directory name)
    #[arg(long, requires = "workspace")]
    pub name: Option<String>,
}

#[derive(Parser)]
pub struct PortArgs {
    /// Port on 127.0.0.1
    pub port: u16,
}
