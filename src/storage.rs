use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::warn;

use crate::supervisor::HealthReport;

/// Reads the last persisted status report. A missing or empty file yields
/// `None`; a corrupt one is moved aside.
pub fn load_status(path: &Path) -> Result<Option<HealthReport>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read status file {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(None);
    }

    match serde_json::from_str::<HealthReport>(&content) {
        Ok(report) => Ok(Some(report)),
        Err(error) => {
            let backup = corrupted_backup_path(path);
            if let Err(rename_err) = fs::rename(path, &backup) {
                warn!(
                    "failed to move corrupted status file {} -> {}: {rename_err}",
                    path.display(),
                    backup.display()
                );
            } else {
                warn!(
                    "status file {} is corrupted ({error}), moved to {}",
                    path.display(),
                    backup.display()
                );
            }
            Ok(None)
        }
    }
}

/// Writes the report through a temporary file so readers never observe a
/// partial document.
pub fn save_status(path: &Path, report: &HealthReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let payload = serde_json::to_vec_pretty(report)?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload)
        .with_context(|| format!("failed to write temporary status {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace status file {}", path.display()))?;
    Ok(())
}

fn corrupted_backup_path(path: &Path) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    path.with_extension(format!("corrupt-{suffix}.json"))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{load_status, save_status};
    use crate::process::ProcessStatus;
    use crate::store::EntitySnapshot;
    use crate::supervisor::{HealthData, HealthMeta, HealthReport};

    fn report(version: &str) -> HealthReport {
        HealthReport {
            data: HealthData {
                services: vec![EntitySnapshot {
                    name: "api".to_string(),
                    version: version.to_string(),
                    status: ProcessStatus::Running,
                    pid: Some(4242),
                    repo_version: version.to_string(),
                    repo: None,
                }],
                daemons: Vec::new(),
            },
            meta: HealthMeta {
                version: "0.3.0".to_string(),
                online: true,
                kicked_off: true,
            },
        }
    }

    #[test]
    fn save_overwrites_previous_report() {
        let dir = temp_dir("status-overwrite");
        let path = dir.join("status.json");

        save_status(&path, &report("abc123")).expect("first save");
        save_status(&path, &report("def456")).expect("second save");
        let loaded = load_status(&path)
            .expect("load")
            .expect("report present");

        assert_eq!(loaded, report("def456"));
        assert!(!path.with_extension("tmp").exists());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_or_empty_file_has_no_report() {
        let dir = temp_dir("status-empty");
        let path = dir.join("status.json");
        assert!(load_status(&path).expect("missing file").is_none());

        fs::create_dir_all(&dir).expect("create dir");
        fs::write(&path, "  \n").expect("write empty");
        assert!(load_status(&path).expect("empty file").is_none());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let dir = temp_dir("status-corrupt");
        fs::create_dir_all(&dir).expect("create dir");
        let path = dir.join("status.json");
        fs::write(&path, "{ not valid json ]").expect("write corrupt file");

        assert!(load_status(&path).expect("recovers").is_none());
        assert!(!path.exists(), "corrupted file should have been renamed");
        let backup_found = fs::read_dir(&dir)
            .expect("read dir")
            .filter_map(Result::ok)
            .any(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(backup_found, "expected renamed corrupt backup");

        let _ = fs::remove_dir_all(dir);
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        std::env::temp_dir().join(format!("fleetop-{prefix}-{nonce}"))
    }
}
