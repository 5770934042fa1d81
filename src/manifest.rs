use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::AppConfig;
use crate::git::{CommandHook, PostReceiveHook, Repo, Upstream, DEFAULT_UPSTREAM};
use crate::logging::process_logs;
use crate::process::{parse_command_line, OutputTarget, ProcessSpec};

/// Declarative description of what the operator supervises.
///
/// ```toml
/// [[services]]
/// name = "api"
/// command = "node index.js"
///
/// [services.repo]
/// path = "/opt/fleet/api"
/// remote = "git@example.com:fleet/api.git"
/// upstream = "origin/development"
/// hooks = ["yarn-install", { command = "make", args = ["assets"] }]
///
/// [[daemons]]
/// name = "wifi-connect"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    #[serde(default)]
    pub daemons: Vec<DaemonEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceEntry {
    pub name: String,
    pub command: String,
    pub cwd: Option<PathBuf>,
    /// Version label for services without a repository.
    pub version: Option<String>,
    pub repo: Option<RepoEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonEntry {
    pub name: String,
    pub repo: Option<RepoEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoEntry {
    pub path: PathBuf,
    pub remote: String,
    pub upstream: Option<String>,
    #[serde(default)]
    pub hooks: Vec<HookEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum HookEntry {
    Preset(String),
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Reads and validates a manifest. Relative repo paths and working
/// directories are taken relative to the manifest's own directory.
pub fn load(path: &Path) -> Result<Manifest> {
    let payload = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest at {}", path.display()))?;
    let mut manifest = parse(&payload)
        .with_context(|| format!("invalid manifest {}", path.display()))?;
    if let Some(base) = path.parent() {
        manifest.anchor_paths(base);
    }
    Ok(manifest)
}

/// Loads the manifest, treating a missing file as an empty one.
pub fn load_or_default(path: &Path) -> Result<Manifest> {
    if !path.exists() {
        return Ok(Manifest::default());
    }
    load(path)
}

pub fn parse(payload: &str) -> Result<Manifest> {
    let manifest: Manifest = toml::from_str(payload).context("failed to parse manifest TOML")?;
    manifest.validate()?;
    Ok(manifest)
}

impl Manifest {
    fn anchor_paths(&mut self, base: &Path) {
        for service in &mut self.services {
            if let Some(cwd) = &mut service.cwd {
                anchor(cwd, base);
            }
            if let Some(repo) = &mut service.repo {
                anchor(&mut repo.path, base);
            }
        }
        for daemon in &mut self.daemons {
            if let Some(repo) = &mut daemon.repo {
                anchor(&mut repo.path, base);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for service in &self.services {
            check_name("service", &service.name)?;
            if !seen.insert(service.name.as_str()) {
                anyhow::bail!("duplicate service name '{}'", service.name);
            }
            parse_command_line(&service.command)
                .with_context(|| format!("service '{}' has an invalid command", service.name))?;
            if let Some(repo) = &service.repo {
                repo.validate()
                    .with_context(|| format!("service '{}' has an invalid repo", service.name))?;
            }
        }

        let mut seen = HashSet::new();
        for daemon in &self.daemons {
            check_name("daemon", &daemon.name)?;
            if !seen.insert(daemon.name.as_str()) {
                anyhow::bail!("duplicate daemon name '{}'", daemon.name);
            }
            if let Some(repo) = &daemon.repo {
                repo.validate()
                    .with_context(|| format!("daemon '{}' has an invalid repo", daemon.name))?;
            }
        }
        Ok(())
    }
}

impl ServiceEntry {
    /// Process description for this service. Output goes to its log files;
    /// the working directory defaults to the repository checkout.
    pub fn process_spec(&self, config: &AppConfig) -> Result<ProcessSpec> {
        let mut spec = ProcessSpec::from_command_line(&self.command)
            .with_context(|| format!("service '{}' has an invalid command", self.name))?;
        spec.cwd = self
            .cwd
            .clone()
            .or_else(|| self.repo.as_ref().map(|repo| repo.path.clone()));
        spec.output = OutputTarget::Files {
            logs: process_logs(&config.log_dir, &self.name),
            rotation: config.log_rotation,
        };
        spec.stop_timeout = config.stop_timeout;
        Ok(spec)
    }
}

impl RepoEntry {
    fn upstream(&self) -> Result<Upstream> {
        let upstream = self.upstream.as_deref().unwrap_or(DEFAULT_UPSTREAM);
        Ok(upstream.parse::<Upstream>()?)
    }

    fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            anyhow::bail!("repo path cannot be empty");
        }
        if self.remote.trim().is_empty() {
            anyhow::bail!("repo remote cannot be empty");
        }
        self.upstream()?;
        for hook in &self.hooks {
            hook.resolve()?;
        }
        Ok(())
    }

    pub fn build(&self) -> Result<Repo> {
        let mut repo = Repo::new(self.path.clone(), self.remote.trim(), self.upstream()?);
        let hooks = self
            .hooks
            .iter()
            .map(|hook| hook.resolve().map(|hook| Arc::new(hook) as Arc<dyn PostReceiveHook>))
            .collect::<Result<Vec<_>>>()?;
        repo.add_post_receive_hooks(hooks);
        Ok(repo)
    }
}

impl HookEntry {
    fn resolve(&self) -> Result<CommandHook> {
        match self {
            Self::Preset(name) => CommandHook::preset(name)
                .with_context(|| format!("unknown hook preset '{name}'")),
            Self::Command { command, args } => {
                if command.trim().is_empty() {
                    anyhow::bail!("hook command cannot be empty");
                }
                Ok(CommandHook::new(command.trim(), args.clone()))
            }
        }
    }
}

fn anchor(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        anyhow::bail!("{kind} name cannot be empty");
    }
    if name.contains('/') || name.chars().any(char::is_whitespace) {
        anyhow::bail!("{kind} name '{name}' may not contain '/' or whitespace");
    }
    Ok(())
}
