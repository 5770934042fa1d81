use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::{OperatorError, OperatorResult};
use crate::process::ProcessStatus;
use crate::store::{EntitySnapshot, Store, Supervised};
use crate::systemd::{ServiceManager, UnitStatus};
use crate::updater::Updater;

/// Long-running program owned by the OS service manager. The supervisor
/// only tracks whether its code is being updated.
pub struct ServiceUnit {
    name: String,
    manager: Arc<dyn ServiceManager>,
    updater: Arc<dyn Updater>,
    lock: Mutex<()>,
    updating: AtomicBool,
}

impl ServiceUnit {
    /// Fails when the service manager does not know the unit.
    pub async fn new(
        name: impl Into<String>,
        manager: Arc<dyn ServiceManager>,
        updater: Arc<dyn Updater>,
    ) -> OperatorResult<Self> {
        let name = name.into();
        if !manager.exists(&name).await? {
            return Err(OperatorError::ServiceUnitNotFound(name));
        }
        Ok(Self {
            name,
            manager,
            updater,
            lock: Mutex::new(()),
            updating: AtomicBool::new(false),
        })
    }

    pub async fn status(&self) -> OperatorResult<ProcessStatus> {
        if self.updating.load(Ordering::SeqCst) {
            return Ok(ProcessStatus::Updating);
        }
        Ok(match self.manager.status(&self.name).await? {
            UnitStatus::Running => ProcessStatus::Running,
            UnitStatus::Stopped => ProcessStatus::Stopped,
            UnitStatus::Error => ProcessStatus::Error,
        })
    }

    /// Pulls new code; reports whether the head moved.
    pub async fn update_code(&self) -> OperatorResult<bool> {
        let _guard = self.lock.lock().await;
        let old = self.updater.current_head();
        self.updating.store(true, Ordering::SeqCst);
        let result = self.updater.update().await;
        self.updating.store(false, Ordering::SeqCst);
        let new = result?;
        Ok(new != old)
    }
}

#[async_trait]
impl Supervised for ServiceUnit {
    const KIND: &'static str = "daemon";

    fn name(&self) -> &str {
        &self.name
    }

    async fn bootstrap(&self, update: bool) -> OperatorResult<()> {
        let _guard = self.lock.lock().await;
        self.updater.bootstrap(update).await?;
        Ok(())
    }

    async fn start(&self, _store: &Store<Self>) -> OperatorResult<()> {
        self.manager.start(&self.name).await
    }

    async fn stop(&self, _store: &Store<Self>) -> OperatorResult<()> {
        self.manager.stop(&self.name).await
    }

    async fn restart(&self, _store: &Store<Self>) -> OperatorResult<()> {
        self.manager.restart(&self.name).await
    }

    async fn update(&self, _store: &Store<Self>) -> OperatorResult<bool> {
        let updated = self.update_code().await?;
        if updated {
            info!("daemon {} updated to {}; restarting", self.name, self.updater.current_head());
            self.manager.restart(&self.name).await?;
        } else {
            debug!("daemon {} has no new code", self.name);
        }
        Ok(updated)
    }

    async fn snapshot(&self) -> EntitySnapshot {
        let status = match self.status().await {
            Ok(status) => status,
            Err(err) => {
                debug!("status of daemon {} unavailable: {}", self.name, err);
                ProcessStatus::Error
            }
        };
        let head = self.updater.current_head();
        EntitySnapshot {
            name: self.name.clone(),
            version: head.clone(),
            status,
            pid: None,
            repo_version: head,
            repo: self.updater.snapshot(),
        }
    }
}
