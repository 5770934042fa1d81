use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

pub const BUILD_VERSION: &str = env!("FLEETOP_BUILD_VERSION");
const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about-with-newline}
USAGE:
  {usage}

COMMANDS:
{subcommands}

OPTIONS:
{options}
{after-help}
";
const HELP_AFTER: &str = "\
Quick Command Map
  Runtime:
    status, logs/log
  Lifecycle:
    start, stop, restart/rs, update
  Config:
    validate
  Platform:
    daemon run, daemon stop

Every lifecycle command addresses a managed service by default;
pass --daemon to address an OS service unit instead.

Examples
  fleetop status
  fleetop rs api
  fleetop update wifi-connect --daemon
  fleetop log api --lines 200
";

#[derive(Debug, Parser)]
#[command(
    name = "fleetop",
    version = BUILD_VERSION,
    about = "On-device supervisor for fleet services",
    help_template = HELP_TEMPLATE,
    after_help = HELP_AFTER
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct Target {
    pub name: String,
    /// Address the OS service unit registry.
    #[arg(long, default_value_t = false)]
    pub daemon: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show the health report, optionally for one entity.
    Status { name: Option<String> },
    Start(Target),
    Stop(Target),
    #[command(alias = "rs")]
    Restart(Target),
    /// Pull new code and restart when the head moved.
    Update(Target),
    #[command(alias = "log")]
    Logs {
        name: String,
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
    /// Check a manifest without contacting the daemon.
    Validate { path: Option<PathBuf> },
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    Run,
    Stop,
}
