use anyhow::Result;

use crate::ipc::IpcResponse;
use crate::store::EntitySnapshot;

pub(crate) fn expect_ok(response: IpcResponse) -> Result<IpcResponse> {
    if response.ok {
        Ok(response)
    } else {
        anyhow::bail!(response.message)
    }
}

pub(crate) fn snapshot_table(kind: &str, entries: &[EntitySnapshot]) -> Vec<String> {
    let mut rows = vec![format!(
        "{:<8} {:<24} {:<10} {:<8} {:<12} {}",
        "KIND", "NAME", "STATUS", "PID", "VERSION", "REPO"
    )];
    for entry in entries {
        let repo = entry
            .repo
            .as_ref()
            .map_or_else(|| "-".to_string(), |repo| repo.path.display().to_string());
        let version = if entry.version.is_empty() {
            "-"
        } else {
            entry.version.as_str()
        };
        let pid = entry
            .pid
            .map_or_else(|| "-".to_string(), |pid| pid.to_string());
        rows.push(format!(
            "{:<8} {:<24} {:<10} {:<8} {:<12} {}",
            kind, entry.name, entry.status, pid, version, repo
        ));
    }
    rows
}
