mod common;
mod control;
mod daemon_stop;
mod logs;
mod status;
mod validate;

use anyhow::Result;

use crate::cli::{Commands, DaemonCommand};
use crate::config::AppConfig;
use crate::ipc::IpcRequest;

pub async fn run(command: Commands, config: &AppConfig) -> Result<()> {
    let needs_daemon = !matches!(
        command,
        Commands::Validate { .. } | Commands::Daemon { .. }
    );

    if needs_daemon {
        crate::daemon::ensure_daemon_running(config).await?;
    }

    match command {
        Commands::Status { name } => status::run(config, name).await,
        Commands::Start(target) => {
            control::run(
                config,
                IpcRequest::Start {
                    name: target.name,
                    daemon: target.daemon,
                },
            )
            .await
        }
        Commands::Stop(target) => {
            control::run(
                config,
                IpcRequest::Stop {
                    name: target.name,
                    daemon: target.daemon,
                },
            )
            .await
        }
        Commands::Restart(target) => {
            control::run(
                config,
                IpcRequest::Restart {
                    name: target.name,
                    daemon: target.daemon,
                },
            )
            .await
        }
        Commands::Update(target) => {
            control::run(
                config,
                IpcRequest::Update {
                    name: target.name,
                    daemon: target.daemon,
                },
            )
            .await
        }
        Commands::Logs { name, lines } => logs::run(config, name, lines).await,
        Commands::Validate { path } => {
            validate::run(path.as_deref().unwrap_or(&config.manifest_path))
        }
        Commands::Daemon {
            command: DaemonCommand::Run,
        } => crate::daemon::run_foreground(config.clone()).await,
        Commands::Daemon {
            command: DaemonCommand::Stop,
        } => daemon_stop::run(config).await,
    }
}
