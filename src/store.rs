use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::{OperatorError, OperatorResult};
use crate::process::ProcessStatus;
use crate::updater::RepoSnapshot;

/// Status document entry for one supervised entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub name: String,
    pub version: String,
    pub status: ProcessStatus,
    /// OS pid while a managed process is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub repo_version: String,
    #[serde(default)]
    pub repo: Option<RepoSnapshot>,
}

/// Entity that can live in a [`Store`]: a managed service or a service unit.
///
/// Operations that need to swap in a new generation of the entity receive
/// the owning store.
#[async_trait]
pub trait Supervised: Sized + Send + Sync + 'static {
    const KIND: &'static str;

    fn name(&self) -> &str;

    async fn bootstrap(&self, update: bool) -> OperatorResult<()>;
    async fn start(&self, store: &Store<Self>) -> OperatorResult<()>;
    async fn stop(&self, store: &Store<Self>) -> OperatorResult<()>;
    async fn restart(&self, store: &Store<Self>) -> OperatorResult<()>;
    async fn update(&self, store: &Store<Self>) -> OperatorResult<bool>;
    async fn snapshot(&self) -> EntitySnapshot;
}

/// Named registry of supervised entities.
///
/// The map lock only guards the map itself. Bulk operations copy the
/// entries out and release it before touching any entity, so a concurrent
/// `save` from an update never waits on a bulk pass. Per-name ordering is
/// the entity's job.
pub struct Store<E> {
    entries: RwLock<BTreeMap<String, Arc<E>>>,
}

impl<E> Default for Store<E> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<E: Supervised> Store<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn find(&self, name: &str) -> Option<Arc<E>> {
        self.entries.read().await.get(name).cloned()
    }

    /// Inserts or replaces the entry under the entity's name, returning the
    /// previous one.
    pub async fn save(&self, entity: Arc<E>) -> Option<Arc<E>> {
        let name = entity.name().to_string();
        self.entries.write().await.insert(name, entity)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn entries(&self) -> Vec<Arc<E>> {
        self.entries.read().await.values().cloned().collect()
    }

    async fn resolve(&self, name: &str) -> OperatorResult<Arc<E>> {
        self.find(name)
            .await
            .ok_or_else(|| OperatorError::not_found(E::KIND, name))
    }

    pub async fn start_by_name(&self, name: &str) -> OperatorResult<()> {
        self.resolve(name).await?.start(self).await
    }

    pub async fn stop_by_name(&self, name: &str) -> OperatorResult<()> {
        self.resolve(name).await?.stop(self).await
    }

    pub async fn restart_by_name(&self, name: &str) -> OperatorResult<()> {
        self.resolve(name).await?.restart(self).await
    }

    /// Pulls new code for `name` and restarts it when something changed.
    /// `Ok(false)` means there was nothing new.
    pub async fn update_by_name(&self, name: &str) -> OperatorResult<bool> {
        self.resolve(name).await?.update(self).await
    }

    pub async fn bootstrap(&self, update: bool) -> OperatorResult<()> {
        for entity in self.entries().await {
            debug!("bootstrapping {} {}", E::KIND, entity.name());
            entity.bootstrap(update).await?;
        }
        Ok(())
    }

    pub async fn start(&self) -> OperatorResult<()> {
        for entity in self.entries().await {
            entity.start(self).await?;
        }
        Ok(())
    }

    /// Stops every entry. Entries that are already stopped are skipped.
    pub async fn stop(&self) -> OperatorResult<()> {
        for entity in self.entries().await {
            match entity.stop(self).await {
                Ok(()) | Err(OperatorError::AlreadyStopped) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<EntitySnapshot> {
        let mut snapshots = Vec::new();
        for entity in self.entries().await {
            snapshots.push(entity.snapshot().await);
        }
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{EntitySnapshot, Store, Supervised};
    use crate::errors::{OperatorError, OperatorResult};
    use crate::process::ProcessStatus;

    #[derive(Default)]
    struct Widget {
        name: String,
        generation: usize,
        fail_start: bool,
        started: AtomicUsize,
        stopped: AtomicBool,
    }

    impl Widget {
        fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl Supervised for Widget {
        const KIND: &'static str = "widget";

        fn name(&self) -> &str {
            &self.name
        }

        async fn bootstrap(&self, _update: bool) -> OperatorResult<()> {
            Ok(())
        }

        async fn start(&self, _store: &Store<Self>) -> OperatorResult<()> {
            if self.fail_start {
                return Err(OperatorError::InvalidCommand(self.name.clone()));
            }
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self, _store: &Store<Self>) -> OperatorResult<()> {
            if self.stopped.swap(true, Ordering::SeqCst) {
                return Err(OperatorError::AlreadyStopped);
            }
            Ok(())
        }

        async fn restart(&self, store: &Store<Self>) -> OperatorResult<()> {
            store
                .save(Arc::new(Self {
                    name: self.name.clone(),
                    generation: self.generation + 1,
                    ..Self::default()
                }))
                .await;
            Ok(())
        }

        async fn update(&self, _store: &Store<Self>) -> OperatorResult<bool> {
            Ok(false)
        }

        async fn snapshot(&self) -> EntitySnapshot {
            EntitySnapshot {
                name: self.name.clone(),
                version: self.generation.to_string(),
                status: ProcessStatus::Idle,
                pid: None,
                repo_version: String::new(),
                repo: None,
            }
        }
    }

    #[tokio::test]
    async fn missing_names_are_not_found_everywhere() {
        let store = Store::<Widget>::new();
        store.save(Widget::named("api")).await;

        assert!(store.find("missing").await.is_none());
        let results = [
            store.start_by_name("missing").await.err(),
            store.stop_by_name("missing").await.err(),
            store.restart_by_name("missing").await.err(),
            store.update_by_name("missing").await.err(),
        ];
        for err in results {
            let err = err.expect("operation on missing name must fail");
            assert!(err.is_not_found());
            assert_eq!(err.to_string(), "widget: \"missing\" not found");
        }
        assert_eq!(store.len().await, 1);
        assert!(store.find("api").await.is_some());
    }

    #[tokio::test]
    async fn save_replaces_entry_under_same_name() {
        let store = Store::<Widget>::new();
        let first = Widget::named("api");
        assert!(store.save(Arc::clone(&first)).await.is_none());

        store.restart_by_name("api").await.expect("restart");

        let current = store.find("api").await.expect("entry present");
        assert_eq!(current.generation, 1);
        assert!(!Arc::ptr_eq(&current, &first));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn bulk_start_stops_at_first_error() {
        let store = Store::<Widget>::new();
        let alpha = Widget::named("alpha");
        let broken = Arc::new(Widget {
            name: "beta".to_string(),
            fail_start: true,
            ..Widget::default()
        });
        let gamma = Widget::named("gamma");
        for entry in [&alpha, &broken, &gamma] {
            store.save(Arc::clone(entry)).await;
        }

        let err = store.start().await.expect_err("beta fails to start");
        assert!(matches!(err, OperatorError::InvalidCommand(name) if name == "beta"));
        assert_eq!(alpha.started.load(Ordering::SeqCst), 1);
        assert_eq!(gamma.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bulk_stop_skips_already_stopped_entries() {
        let store = Store::<Widget>::new();
        let alpha = Widget::named("alpha");
        store.save(Arc::clone(&alpha)).await;
        store.save(Widget::named("beta")).await;
        store.stop_by_name("alpha").await.expect("first stop");

        store.stop().await.expect("bulk stop tolerates stopped entries");
        assert!(matches!(
            store.stop_by_name("beta").await,
            Err(OperatorError::AlreadyStopped)
        ));
    }

    #[tokio::test]
    async fn snapshot_lists_entries_in_name_order() {
        let store = Store::<Widget>::new();
        store.save(Widget::named("zeta")).await;
        store.save(Widget::named("alpha")).await;

        let names: Vec<String> = store
            .snapshot()
            .await
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
