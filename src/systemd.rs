use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::errors::{OperatorError, OperatorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Running,
    Stopped,
    Error,
}

/// Maps `systemctl is-active` output onto a unit status.
pub fn parse_unit_status(output: &str) -> OperatorResult<UnitStatus> {
    match output.trim() {
        "active" | "activating" | "reloading" => Ok(UnitStatus::Running),
        "inactive" | "deactivating" | "unknown" => Ok(UnitStatus::Stopped),
        "failed" => Ok(UnitStatus::Error),
        other => Err(OperatorError::UnknownUnitStatus(other.to_string())),
    }
}

/// OS service manager operations used by service units.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn exists(&self, name: &str) -> OperatorResult<bool>;
    async fn status(&self, name: &str) -> OperatorResult<UnitStatus>;
    async fn start(&self, name: &str) -> OperatorResult<()>;
    async fn stop(&self, name: &str) -> OperatorResult<()>;
    async fn restart(&self, name: &str) -> OperatorResult<()>;
}

/// `systemctl` backed service manager.
#[derive(Debug, Clone)]
pub struct Systemctl {
    sudo: bool,
}

impl Systemctl {
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }

    /// Control commands go through `sudo` unless already running as root.
    pub fn for_current_user() -> Self {
        Self::new(!running_as_root())
    }

    fn uses_sudo(&self) -> bool {
        self.sudo
    }

    async fn query(&self, args: &[&str]) -> OperatorResult<std::process::Output> {
        Command::new("systemctl")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| OperatorError::ServiceManager(format!("failed to run systemctl: {err}")))
    }

    async fn control(&self, op: &str, name: &str) -> OperatorResult<()> {
        let mut command = if self.uses_sudo() {
            let mut command = Command::new("sudo");
            command.arg("systemctl");
            command
        } else {
            Command::new("systemctl")
        };
        info!("systemctl {} {}", op, name);
        let output = command
            .args([op, name])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| OperatorError::ServiceManager(format!("failed to run systemctl: {err}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(OperatorError::ServiceManager(format!(
                "systemctl {op} {name} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

fn unit_missing(stdout: &str, stderr: &str) -> bool {
    stdout.contains("Loaded: not-found") || stderr.contains("could not be found")
}

#[async_trait]
impl ServiceManager for Systemctl {
    async fn exists(&self, name: &str) -> OperatorResult<bool> {
        // `systemctl status` exits non-zero for stopped units, so only the
        // text tells a missing unit apart.
        let output = self.query(&["status", name]).await?;
        Ok(!unit_missing(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    async fn status(&self, name: &str) -> OperatorResult<UnitStatus> {
        let output = self.query(&["is-active", name]).await?;
        if output.status.success() {
            return Ok(UnitStatus::Running);
        }
        parse_unit_status(&String::from_utf8_lossy(&output.stdout))
    }

    async fn start(&self, name: &str) -> OperatorResult<()> {
        self.control("start", name).await
    }

    async fn stop(&self, name: &str) -> OperatorResult<()> {
        self.control("stop", name).await
    }

    async fn restart(&self, name: &str) -> OperatorResult<()> {
        self.control("restart", name).await
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{ServiceManager, UnitStatus};
    use crate::errors::{OperatorError, OperatorResult};

    /// In-memory service manager recording every control call.
    #[derive(Default)]
    pub struct FakeServiceManager {
        units: Mutex<HashMap<String, UnitStatus>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeServiceManager {
        pub fn with_unit(name: &str, status: UnitStatus) -> Self {
            let manager = Self::default();
            manager
                .units
                .lock()
                .expect("units lock")
                .insert(name.to_string(), status);
            manager
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }

        fn set(&self, op: &str, name: &str, status: UnitStatus) -> OperatorResult<()> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(format!("{op} {name}"));
            let mut units = self.units.lock().expect("units lock");
            match units.get_mut(name) {
                Some(current) => {
                    *current = status;
                    Ok(())
                }
                None => Err(OperatorError::ServiceUnitNotFound(name.to_string())),
            }
        }
    }

    #[async_trait]
    impl ServiceManager for FakeServiceManager {
        async fn exists(&self, name: &str) -> OperatorResult<bool> {
            Ok(self.units.lock().expect("units lock").contains_key(name))
        }

        async fn status(&self, name: &str) -> OperatorResult<UnitStatus> {
            self.units
                .lock()
                .expect("units lock")
                .get(name)
                .copied()
                .ok_or_else(|| OperatorError::ServiceUnitNotFound(name.to_string()))
        }

        async fn start(&self, name: &str) -> OperatorResult<()> {
            self.set("start", name, UnitStatus::Running)
        }

        async fn stop(&self, name: &str) -> OperatorResult<()> {
            self.set("stop", name, UnitStatus::Stopped)
        }

        async fn restart(&self, name: &str) -> OperatorResult<()> {
            self.set("restart", name, UnitStatus::Running)
        }
    }
}
