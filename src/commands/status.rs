use anyhow::{Context, Result};

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};

use super::common::{expect_ok, snapshot_table};

pub(crate) async fn run(config: &AppConfig, target: Option<String>) -> Result<()> {
    let response = send_request(&config.daemon_addr, &IpcRequest::Status { target }).await?;
    let response = expect_ok(response)?;
    let health = response
        .health
        .context("daemon returned no health report for status command")?;

    println!("Version:     {}", health.meta.version);
    println!("Online:      {}", health.meta.online);
    println!("Kicked Off:  {}", health.meta.kicked_off);
    println!();

    let mut rows = snapshot_table("service", &health.data.services);
    rows.extend(
        snapshot_table("daemon", &health.data.daemons)
            .into_iter()
            .skip(1),
    );
    for row in rows {
        println!("{row}");
    }

    Ok(())
}
