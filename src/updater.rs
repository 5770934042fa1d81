use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::OperatorResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSnapshot {
    pub path: PathBuf,
    pub remote: String,
    pub version: String,
}

/// Source of a supervised entity's code and version label.
#[async_trait]
pub trait Updater: Send + Sync {
    /// Makes the code available locally, optionally pulling new revisions.
    /// Returns the resulting head.
    async fn bootstrap(&self, want_update: bool) -> OperatorResult<String>;

    /// Pulls the latest revision. Returns the head after the call, which
    /// equals the previous head when nothing changed.
    async fn update(&self) -> OperatorResult<String>;

    fn current_head(&self) -> String;

    fn snapshot(&self) -> Option<RepoSnapshot> {
        None
    }
}

/// Updater for entities without a backing repository: the version never
/// moves.
#[derive(Debug, Default)]
pub struct NoopUpdater {
    version: Mutex<String>,
}

impl NoopUpdater {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: Mutex::new(version.into()),
        }
    }
}

#[async_trait]
impl Updater for NoopUpdater {
    async fn bootstrap(&self, _want_update: bool) -> OperatorResult<String> {
        Ok(self.current_head())
    }

    async fn update(&self) -> OperatorResult<String> {
        Ok(self.current_head())
    }

    fn current_head(&self) -> String {
        self.version
            .lock()
            .map(|version| version.clone())
            .unwrap_or_default()
    }
}
