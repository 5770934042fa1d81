use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::errors::{OperatorError, OperatorResult};
use crate::notify::{notify_with_retry, ExitNotifier, RetryPolicy};
use crate::process::{ProcessExit, ProcessHandle, ProcessStatus};
use crate::store::{EntitySnapshot, Store, Supervised};
use crate::updater::Updater;

/// A process bound to the repository its code comes from.
///
/// Restarting never reuses a handle: the service is rebuilt around a fresh
/// clone of its handle and saved back into the store under the same name.
/// All generations of one service share the same lock, so updates,
/// bootstraps and (re)starts of a name never interleave.
pub struct ManagedService {
    name: String,
    handle: Arc<ProcessHandle>,
    updater: Arc<dyn Updater>,
    lock: Arc<Mutex<()>>,
    notifier: Arc<dyn ExitNotifier>,
    retry: RetryPolicy,
}

impl ManagedService {
    pub fn new(
        name: impl Into<String>,
        handle: ProcessHandle,
        updater: Arc<dyn Updater>,
        notifier: Arc<dyn ExitNotifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            handle: Arc::new(handle),
            updater,
            lock: Arc::new(Mutex::new(())),
            notifier,
            retry,
        }
    }

    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.handle
    }

    pub fn status(&self) -> ProcessStatus {
        self.handle.status()
    }

    pub fn version(&self) -> String {
        self.handle.version()
    }

    fn next_generation(&self, handle: ProcessHandle) -> Arc<Self> {
        Arc::new(Self {
            name: self.name.clone(),
            handle: Arc::new(handle),
            updater: Arc::clone(&self.updater),
            lock: Arc::clone(&self.lock),
            notifier: Arc::clone(&self.notifier),
            retry: self.retry,
        })
    }

    /// Newer generation registered under this name, if `self` was replaced
    /// while the caller waited for the lock.
    async fn replacement(&self, store: &Store<Self>) -> Option<Arc<Self>> {
        store
            .find(&self.name)
            .await
            .filter(|latest| !Arc::ptr_eq(&latest.handle, &self.handle))
    }

    /// Starts the exit observer, then the process.
    async fn launch(&self) -> OperatorResult<()> {
        if let Some(exits) = self.handle.take_exit_receiver() {
            tokio::spawn(observe_exit(
                self.name.clone(),
                exits,
                Arc::clone(&self.notifier),
                self.retry,
            ));
        }
        self.handle.start().await?;
        Ok(())
    }

    async fn swap_in(&self, store: &Store<Self>, handle: ProcessHandle) -> OperatorResult<()> {
        let next = self.next_generation(handle);
        store.save(Arc::clone(&next)).await;
        next.launch().await
    }

    async fn start_locked(&self, store: &Store<Self>) -> OperatorResult<()> {
        if self.handle.status().is_terminal() {
            debug!("service {} is {}; starting a fresh handle", self.name, self.handle.status());
            return self.swap_in(store, self.handle.clone_fresh()).await;
        }
        self.launch().await
    }

    async fn restart_locked(&self, store: &Store<Self>) -> OperatorResult<()> {
        stop_tolerant(&self.handle).await?;
        info!("restarting service {}", self.name);
        self.swap_in(store, self.handle.clone_fresh()).await
    }

    async fn update_locked(&self, store: &Store<Self>) -> OperatorResult<bool> {
        let previous = self.handle.mark_updating();

        let head = match self.updater.update().await {
            Ok(head) => head,
            Err(err) => {
                warn!("update of service {} failed: {}", self.name, err);
                self.revert_updating(previous);
                return Err(err);
            }
        };

        let current = self.handle.version();
        if head == current {
            debug!("service {} already at {}", self.name, current);
            self.revert_updating(previous);
            return Ok(false);
        }

        if self.handle.status() == ProcessStatus::Stopped {
            // Stopped while fetching: keep it down, the next start picks up
            // the new head.
            info!("service {} updated to {} while stopped", self.name, head);
            self.handle.set_version(head);
            return Ok(true);
        }

        info!(
            "service {} updated from {} to {}; restarting",
            self.name, current, head
        );
        if let Err(err) = stop_tolerant(&self.handle).await {
            self.revert_updating(previous);
            return Err(err);
        }
        self.swap_in(store, self.handle.clone_with_version(head))
            .await?;
        Ok(true)
    }

    fn revert_updating(&self, previous: Option<ProcessStatus>) {
        if let Some(previous) = previous {
            self.handle.restore_status(ProcessStatus::Updating, previous);
        }
    }
}

async fn stop_tolerant(handle: &ProcessHandle) -> OperatorResult<()> {
    match handle.stop().await {
        Ok(()) | Err(OperatorError::AlreadyStopped) => Ok(()),
        Err(err) => Err(err),
    }
}

async fn observe_exit(
    name: String,
    mut exits: mpsc::Receiver<ProcessExit>,
    notifier: Arc<dyn ExitNotifier>,
    retry: RetryPolicy,
) {
    let Some(exit) = exits.recv().await else {
        return;
    };
    if exit.stop_requested || exit.success {
        debug!("service {} exited ({}); nothing to report", name, exit);
        return;
    }
    warn!("service {} crashed with {}", name, exit);
    notify_with_retry(notifier.as_ref(), &name, retry).await;
}

#[async_trait]
impl Supervised for ManagedService {
    const KIND: &'static str = "service";

    fn name(&self) -> &str {
        &self.name
    }

    async fn bootstrap(&self, update: bool) -> OperatorResult<()> {
        let _guard = self.lock.lock().await;
        let head = self.updater.bootstrap(update).await?;
        self.handle.set_version(head);
        Ok(())
    }

    async fn start(&self, store: &Store<Self>) -> OperatorResult<()> {
        let _guard = self.lock.lock().await;
        match self.replacement(store).await {
            Some(latest) => latest.start_locked(store).await,
            None => self.start_locked(store).await,
        }
    }

    async fn stop(&self, store: &Store<Self>) -> OperatorResult<()> {
        // Lock-free so a stop is not held up behind a long fetch.
        match self.replacement(store).await {
            Some(latest) => latest.handle.stop().await,
            None => self.handle.stop().await,
        }
    }

    async fn restart(&self, store: &Store<Self>) -> OperatorResult<()> {
        let _guard = self.lock.lock().await;
        match self.replacement(store).await {
            Some(latest) => latest.restart_locked(store).await,
            None => self.restart_locked(store).await,
        }
    }

    async fn update(&self, store: &Store<Self>) -> OperatorResult<bool> {
        let _guard = self.lock.lock().await;
        match self.replacement(store).await {
            Some(latest) => latest.update_locked(store).await,
            None => self.update_locked(store).await,
        }
    }

    async fn snapshot(&self) -> EntitySnapshot {
        let handle = self.handle();
        let status = handle.status();
        EntitySnapshot {
            name: self.name.clone(),
            version: handle.version(),
            status,
            pid: handle.pid().filter(|_| status == ProcessStatus::Running),
            repo_version: self.updater.current_head(),
            repo: self.updater.snapshot(),
        }
    }
}
