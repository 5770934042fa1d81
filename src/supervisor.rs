use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::errors::OperatorResult;
use crate::manifest::Manifest;
use crate::notify::{ExitNotifier, HttpExitNotifier, LogExitNotifier};
use crate::process::ProcessHandle;
use crate::service::ManagedService;
use crate::store::{EntitySnapshot, Store};
use crate::systemd::{ServiceManager, Systemctl};
use crate::unit::ServiceUnit;
use crate::updater::{NoopUpdater, Updater};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything the supervisor and its entities share, built once at startup
/// and handed down explicitly.
#[derive(Clone)]
pub struct Context {
    pub config: AppConfig,
    pub notifier: Arc<dyn ExitNotifier>,
    pub service_manager: Arc<dyn ServiceManager>,
}

impl Context {
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let notifier: Arc<dyn ExitNotifier> = match config.notify_url.as_deref() {
            Some(url) => Arc::new(HttpExitNotifier::new(url)?),
            None => Arc::new(LogExitNotifier),
        };
        Ok(Self {
            config,
            notifier,
            service_manager: Arc::new(Systemctl::for_current_user()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub data: HealthData,
    pub meta: HealthMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthData {
    pub services: Vec<EntitySnapshot>,
    pub daemons: Vec<EntitySnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMeta {
    pub version: String,
    pub online: bool,
    pub kicked_off: bool,
}

/// Owns the service and daemon registries and runs the first-connectivity
/// kick-off.
pub struct Supervisor {
    version: String,
    services: Store<ManagedService>,
    daemons: Store<ServiceUnit>,
    online: AtomicBool,
    kicked_off: AtomicBool,
    kick_lock: Mutex<()>,
}

impl Supervisor {
    pub fn new(
        version: impl Into<String>,
        services: Store<ManagedService>,
        daemons: Store<ServiceUnit>,
    ) -> Self {
        Self {
            version: version.into(),
            services,
            daemons,
            online: AtomicBool::new(false),
            kicked_off: AtomicBool::new(false),
            kick_lock: Mutex::new(()),
        }
    }

    pub async fn from_manifest(
        manifest: &Manifest,
        context: &Context,
        version: impl Into<String>,
    ) -> Result<Self> {
        let services = Store::new();
        for entry in &manifest.services {
            let updater: Arc<dyn Updater> = match &entry.repo {
                Some(repo) => Arc::new(repo.build()?),
                None => Arc::new(NoopUpdater::new(entry.version.clone().unwrap_or_default())),
            };
            let handle = ProcessHandle::new(
                entry.process_spec(&context.config)?,
                updater.current_head(),
            );
            services
                .save(Arc::new(ManagedService::new(
                    entry.name.as_str(),
                    handle,
                    updater,
                    Arc::clone(&context.notifier),
                    context.config.notify_retry,
                )))
                .await;
        }

        let daemons = Store::new();
        for entry in &manifest.daemons {
            let updater: Arc<dyn Updater> = match &entry.repo {
                Some(repo) => Arc::new(repo.build()?),
                None => Arc::new(NoopUpdater::default()),
            };
            let unit = ServiceUnit::new(
                entry.name.as_str(),
                Arc::clone(&context.service_manager),
                updater,
            )
            .await
            .with_context(|| format!("cannot supervise daemon '{}'", entry.name))?;
            daemons.save(Arc::new(unit)).await;
        }

        info!(
            "supervising {} service(s) and {} daemon(s)",
            services.len().await,
            daemons.len().await
        );
        Ok(Self::new(version, services, daemons))
    }

    pub fn services(&self) -> &Store<ManagedService> {
        &self.services
    }

    pub fn daemons(&self) -> &Store<ServiceUnit> {
        &self.daemons
    }

    pub fn is_kicked_off(&self) -> bool {
        self.kicked_off.load(Ordering::SeqCst)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Bootstraps every registry and starts the services. Pulls new code
    /// only when `online`. Once it has succeeded, later calls are no-ops.
    ///
    /// If a service fails to start, every service is stopped again and the
    /// error is returned so the caller can retry.
    pub async fn kick_off(&self, online: bool) -> OperatorResult<()> {
        let _guard = self.kick_lock.lock().await;
        self.online.store(online, Ordering::SeqCst);
        if self.is_kicked_off() {
            return Ok(());
        }

        info!("kicking off (online: {})", online);
        self.daemons.bootstrap(online).await?;
        self.services.bootstrap(online).await?;

        if let Err(err) = self.services.start().await {
            error!("failed to start services: {}; stopping all of them", err);
            if let Err(stop_err) = self.services.stop().await {
                warn!("failed to stop services after kick-off failure: {}", stop_err);
            }
            return Err(err);
        }

        self.kicked_off.store(true, Ordering::SeqCst);
        info!("kick-off complete");
        Ok(())
    }

    /// Stops every managed service. Daemons belong to the OS service manager
    /// and keep running.
    pub async fn shutdown(&self) -> OperatorResult<()> {
        info!("stopping managed services");
        self.services.stop().await
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            data: HealthData {
                services: self.services.snapshot().await,
                daemons: self.daemons.snapshot().await,
            },
            meta: HealthMeta {
                version: self.version.clone(),
                online: self.is_online(),
                kicked_off: self.is_kicked_off(),
            },
        }
    }
}

/// Reports whether `addr` accepts a TCP connection. Without a probe address
/// the device is assumed to be online.
pub async fn probe_connectivity(addr: Option<&str>) -> bool {
    let Some(addr) = addr else {
        return true;
    };
    match timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => {
            info!("connectivity probe to {} failed: {}", addr, err);
            false
        }
        Err(_) => {
            info!("connectivity probe to {} timed out", addr);
            false
        }
    }
}
