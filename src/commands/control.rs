use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};

use super::common::expect_ok;

/// Sends a start/stop/restart/update request and prints the outcome.
pub(crate) async fn run(config: &AppConfig, request: IpcRequest) -> Result<()> {
    let response = send_request(&config.daemon_addr, &request).await?;
    let response = expect_ok(response)?;
    println!("{}", response.message);
    Ok(())
}
