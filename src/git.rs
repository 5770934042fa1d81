use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::{OperatorError, OperatorResult};
use crate::updater::{RepoSnapshot, Updater};

pub const DEFAULT_UPSTREAM: &str = "origin/development";

/// Remote tracking ref in `remote/branch` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    remote: String,
    branch: String,
}

impl Upstream {
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }
}

impl FromStr for Upstream {
    type Err = OperatorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().split_once('/') {
            Some((remote, branch)) if !remote.is_empty() && !branch.is_empty() => Ok(Self {
                remote: remote.to_string(),
                branch: branch.to_string(),
            }),
            _ => Err(OperatorError::WrongUpstream(value.to_string())),
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.remote, self.branch)
    }
}

/// Side effect run after every successful clone or reset.
#[async_trait]
pub trait PostReceiveHook: Send + Sync {
    fn name(&self) -> String;

    async fn run(&self, repo: &Repo) -> OperatorResult<()>;
}

/// Hook that runs an external command inside the checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHook {
    program: String,
    args: Vec<String>,
}

impl CommandHook {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn yarn_install() -> Self {
        Self::new("yarn", vec!["install".to_string(), "--production".to_string()])
    }

    pub fn npm_prune() -> Self {
        if cfg!(target_os = "linux") {
            Self::new("sudo", vec!["npm".to_string(), "prune".to_string()])
        } else {
            Self::new("npm", vec!["prune".to_string()])
        }
    }

    /// Resolves a preset name used in manifests.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "yarn-install" => Some(Self::yarn_install()),
            "npm-prune" => Some(Self::npm_prune()),
            _ => None,
        }
    }
}

#[async_trait]
impl PostReceiveHook for CommandHook {
    fn name(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    async fn run(&self, repo: &Repo) -> OperatorResult<()> {
        info!("running hook '{}' in {}", self.name(), repo.path().display());
        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(repo.path())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| OperatorError::Hook {
                hook: self.name(),
                message: err.to_string(),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(OperatorError::Hook {
                hook: self.name(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Local git checkout tracking one upstream branch.
pub struct Repo {
    path: PathBuf,
    remote: String,
    upstream: Upstream,
    head: Mutex<String>,
    hooks: Vec<Arc<dyn PostReceiveHook>>,
}

impl fmt::Debug for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repo")
            .field("path", &self.path)
            .field("remote", &self.remote)
            .field("upstream", &self.upstream)
            .field("head", &self.current_head())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl Repo {
    /// A relative `path` is anchored at the current working directory.
    pub fn new(path: impl Into<PathBuf>, remote: impl Into<String>, upstream: Upstream) -> Self {
        Self {
            path: absolute_path(path.into()),
            remote: remote.into(),
            upstream,
            head: Mutex::new(String::new()),
            hooks: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn add_post_receive_hooks<I>(&mut self, hooks: I)
    where
        I: IntoIterator<Item = Arc<dyn PostReceiveHook>>,
    {
        self.hooks.extend(hooks);
    }

    pub fn is_cloned(&self) -> bool {
        self.path.join(".git").exists()
    }

    fn set_head(&self, head: String) {
        if let Ok(mut current) = self.head.lock() {
            *current = head;
        }
    }

    async fn clone_checkout(&self) -> OperatorResult<String> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;

        info!(
            "cloning {} ({}) into {}",
            self.remote,
            self.upstream.branch(),
            self.path.display()
        );
        // Run from the working directory so a relative remote resolves the
        // same way it does for the operator itself.
        let path = self.path.to_string_lossy();
        run_git(
            Path::new("."),
            &[
                "clone",
                "--single-branch",
                "--branch",
                self.upstream.branch(),
                self.remote.as_str(),
                &*path,
            ],
        )
        .await?;

        let head = self.read_head().await?;
        self.set_head(head.clone());
        if let Err(err) = self.run_hooks().await {
            warn!(
                "post-receive hooks failed after cloning {}; removing checkout",
                self.path.display()
            );
            let _ = tokio::fs::remove_dir_all(&self.path).await;
            self.set_head(String::new());
            return Err(err);
        }
        Ok(head)
    }

    async fn read_head(&self) -> OperatorResult<String> {
        run_git(&self.path, &["rev-parse", "--short", "HEAD"]).await
    }

    async fn run_hooks(&self) -> OperatorResult<()> {
        for hook in &self.hooks {
            hook.run(self).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Updater for Repo {
    async fn bootstrap(&self, want_update: bool) -> OperatorResult<String> {
        if !self.is_cloned() {
            return self.clone_checkout().await;
        }

        let head = self.read_head().await?;
        self.set_head(head.clone());
        if want_update {
            return self.update().await;
        }
        Ok(head)
    }

    async fn update(&self) -> OperatorResult<String> {
        let previous = match self.current_head() {
            head if head.is_empty() => self.read_head().await?,
            head => head,
        };
        let upstream = self.upstream.to_string();

        debug!("fetching {} for {}", self.upstream.remote(), self.path.display());
        run_git(&self.path, &["fetch", self.upstream.remote()]).await?;
        let remote_head = run_git(&self.path, &["rev-parse", "--short", upstream.as_str()]).await?;
        if remote_head == previous {
            debug!("{} already at {}", self.path.display(), previous);
            self.set_head(previous.clone());
            return Ok(previous);
        }

        info!(
            "updating {} from {} to {}",
            self.path.display(),
            previous,
            remote_head
        );
        run_git(&self.path, &["reset", "--hard", upstream.as_str()]).await?;
        let head = self.read_head().await?;
        self.set_head(head.clone());

        if let Err(err) = self.run_hooks().await {
            warn!(
                "post-receive hooks failed at {}; rolling {} back to {}",
                head,
                self.path.display(),
                previous
            );
            run_git(&self.path, &["reset", "--hard", previous.as_str()]).await?;
            self.set_head(previous);
            return Err(err);
        }

        Ok(head)
    }

    fn current_head(&self) -> String {
        self.head
            .lock()
            .map(|head| head.clone())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Option<RepoSnapshot> {
        Some(RepoSnapshot {
            path: self.path.clone(),
            remote: self.remote.clone(),
            version: self.current_head(),
        })
    }
}

fn absolute_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

async fn run_git(cwd: &Path, args: &[&str]) -> OperatorResult<String> {
    let command = args.first().copied().unwrap_or_default().to_string();
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| OperatorError::Git {
            command: command.clone(),
            message: err.to_string(),
        })?;

    if !output.status.success() {
        return Err(OperatorError::Git {
            command,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
