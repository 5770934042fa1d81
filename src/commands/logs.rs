use anyhow::{Context, Result};

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};
use crate::logging::{read_last_lines, ProcessLogs};

use super::common::expect_ok;

pub(crate) async fn run(config: &AppConfig, name: String, lines: usize) -> Result<()> {
    let response = send_request(&config.daemon_addr, &IpcRequest::Logs { name }).await?;
    let response = expect_ok(response)?;
    let logs = response
        .logs
        .context("daemon returned no log paths for logs command")?;

    for line in render_logs(&logs, lines)? {
        println!("{line}");
    }
    Ok(())
}

fn render_logs(logs: &ProcessLogs, lines: usize) -> Result<Vec<String>> {
    let mut rendered = Vec::new();
    for path in [logs.stdout.as_path(), logs.stderr.as_path()] {
        rendered.push(format!("==> {} <==", path.display()));
        rendered.extend(read_last_lines(path, lines)?);
    }
    Ok(rendered)
}
