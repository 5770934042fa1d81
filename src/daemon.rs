use std::env;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::cli::BUILD_VERSION;
use crate::config::AppConfig;
use crate::errors::OperatorResult;
use crate::http::{read_http_request, write_http_response, HttpRequest, HttpResponse};
use crate::ipc::{read_json_line, write_json_line, IpcRequest, IpcResponse};
use crate::logging::process_logs;
use crate::manifest;
use crate::service::ManagedService;
use crate::storage::{load_status, save_status};
use crate::store::Supervised;
use crate::supervisor::{probe_connectivity, Context, Supervisor};
use crate::unit::ServiceUnit;

const KICK_OFF_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registry {
    Services,
    Daemons,
}

impl Registry {
    fn select(daemon: bool) -> Self {
        if daemon {
            Self::Daemons
        } else {
            Self::Services
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Self::Services => ManagedService::KIND,
            Self::Daemons => ServiceUnit::KIND,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Start,
    Stop,
    Restart,
    Update,
}

impl Operation {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "update" => Some(Self::Update),
            _ => None,
        }
    }

    fn past_tense(self) -> &'static str {
        match self {
            Self::Start => "started",
            Self::Stop => "stopped",
            Self::Restart => "restarted",
            Self::Update => "updated",
        }
    }
}

#[derive(Debug, Deserialize)]
struct NameBody {
    name: String,
}

/// State shared by every connection handler.
struct DaemonState {
    config: AppConfig,
    supervisor: Arc<Supervisor>,
    shutdown_tx: mpsc::UnboundedSender<()>,
}

pub async fn run_foreground(config: AppConfig) -> Result<()> {
    config.ensure_layout()?;
    let listener = bind_listener(&config.daemon_addr).await?;
    let api_listener = bind_api_listener(&config.api_addr).await?;

    match load_status(&config.status_path) {
        Ok(Some(previous)) => info!(
            "previous run (fleetop {}) left {} service(s) and {} daemon(s) recorded",
            previous.meta.version,
            previous.data.services.len(),
            previous.data.daemons.len()
        ),
        Ok(None) => {}
        Err(err) => warn!("failed to read previous status: {err:#}"),
    }

    let manifest = manifest::load_or_default(&config.manifest_path)?;
    let context = Context::from_config(config.clone())?;
    let supervisor = Arc::new(Supervisor::from_manifest(&manifest, &context, BUILD_VERSION).await?);
    if supervisor.services().is_empty().await && supervisor.daemons().is_empty().await {
        warn!(
            "nothing to supervise; add services or daemons to {}",
            config.manifest_path.display()
        );
    }

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();
    let state = Arc::new(DaemonState {
        config: config.clone(),
        supervisor,
        shutdown_tx,
    });
    state.persist().await;

    let mut kick_tick = tokio::time::interval(KICK_OFF_RETRY);
    kick_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut kick_task: Option<JoinHandle<()>> = None;

    info!("fleetop daemon started at {}", config.daemon_addr);
    info!("fleetop control API started at {}", config.api_addr);

    loop {
        tokio::select! {
            incoming = listener.accept() => {
                match incoming {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(err) = handle_client(stream, state).await {
                                error!("failed to handle IPC client: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("IPC accept failed: {err}");
                    }
                }
            }
            incoming = api_listener.accept() => {
                match incoming {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(err) = handle_api_client(stream, state).await {
                                error!("failed to handle control API client: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("control API accept failed: {err}");
                    }
                }
            }
            _ = kick_tick.tick(), if !state.supervisor.is_kicked_off() => {
                let idle = kick_task.as_ref().map_or(true, JoinHandle::is_finished);
                if idle {
                    let state = Arc::clone(&state);
                    kick_task = Some(tokio::spawn(async move { state.kick_off().await }));
                }
            }
            Some(_) = shutdown_rx.recv() => {
                info!("shutdown requested via IPC; stopping managed services");
                break;
            }
            _ = shutdown_signal() => {
                info!("received shutdown signal; stopping managed services");
                break;
            }
        }
    }

    if let Some(task) = kick_task {
        task.abort();
    }
    if let Err(err) = state.supervisor.shutdown().await {
        error!("failed to stop managed services: {err}");
    }
    state.persist().await;
    Ok(())
}

pub async fn ensure_daemon_running(config: &AppConfig) -> Result<()> {
    if daemon_socket_available(&config.daemon_addr).await {
        return Ok(());
    }

    let executable = env::current_exe().context("failed to locate current executable")?;
    Command::new(executable)
        .arg("daemon")
        .arg("run")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn daemon")?;

    for _ in 0..50 {
        if daemon_socket_available(&config.daemon_addr).await {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }

    anyhow::bail!("daemon did not become ready in time")
}

async fn daemon_socket_available(daemon_addr: &str) -> bool {
    match timeout(Duration::from_millis(250), TcpStream::connect(daemon_addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        _ => false,
    }
}

async fn bind_listener(daemon_addr: &str) -> Result<TcpListener> {
    if daemon_socket_available(daemon_addr).await {
        anyhow::bail!("daemon already running at {daemon_addr}");
    }

    TcpListener::bind(daemon_addr)
        .await
        .with_context(|| format!("failed to bind daemon endpoint at {daemon_addr}"))
}

async fn bind_api_listener(api_addr: &str) -> Result<TcpListener> {
    TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind control API endpoint at {api_addr}"))
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = terminate.recv() => {}
                ctrl = tokio::signal::ctrl_c() => {
                    if let Err(err) = ctrl {
                        warn!("failed to wait for CTRL-C signal: {err}");
                    }
                }
            }
        }
        Err(err) => {
            warn!("failed to install SIGTERM handler: {err}");
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to wait for CTRL-C signal: {err}");
            }
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to wait for CTRL-C signal: {err}");
    }
}

async fn handle_client(mut stream: TcpStream, state: Arc<DaemonState>) -> Result<()> {
    let request = read_json_line::<IpcRequest, _>(&mut stream).await?;
    let response = execute_request(request, &state).await;
    write_json_line(&mut stream, &response).await
}

async fn handle_api_client(mut stream: TcpStream, state: Arc<DaemonState>) -> Result<()> {
    let response = match read_http_request(&mut stream).await {
        Ok(request) => execute_api_request(request, &state).await,
        Err(err) => HttpResponse::error(400, format!("{err:#}")),
    };
    write_http_response(&mut stream, &response).await
}

impl DaemonState {
    async fn kick_off(&self) {
        let online = probe_connectivity(self.config.probe_addr.as_deref()).await;
        if let Err(err) = self.supervisor.kick_off(online).await {
            warn!(
                "kick-off failed: {}; retrying in {}s",
                err,
                KICK_OFF_RETRY.as_secs()
            );
        }
        self.persist().await;
    }

    /// Runs one named operation and publishes the resulting status whether
    /// or not it succeeded. `Some(updated)` is returned for updates.
    async fn execute(
        &self,
        registry: Registry,
        operation: Operation,
        name: &str,
    ) -> OperatorResult<Option<bool>> {
        let services = self.supervisor.services();
        let daemons = self.supervisor.daemons();
        let result = match (registry, operation) {
            (Registry::Services, Operation::Start) => services.start_by_name(name).await.map(|_| None),
            (Registry::Services, Operation::Stop) => services.stop_by_name(name).await.map(|_| None),
            (Registry::Services, Operation::Restart) => {
                services.restart_by_name(name).await.map(|_| None)
            }
            (Registry::Services, Operation::Update) => services.update_by_name(name).await.map(Some),
            (Registry::Daemons, Operation::Start) => daemons.start_by_name(name).await.map(|_| None),
            (Registry::Daemons, Operation::Stop) => daemons.stop_by_name(name).await.map(|_| None),
            (Registry::Daemons, Operation::Restart) => {
                daemons.restart_by_name(name).await.map(|_| None)
            }
            (Registry::Daemons, Operation::Update) => daemons.update_by_name(name).await.map(Some),
        };

        match &result {
            Ok(_) => info!("{} {} {}", registry.kind(), name, operation.past_tense()),
            Err(err) => warn!("{:?} of {} {} failed: {}", operation, registry.kind(), name, err),
        }
        self.persist().await;
        result
    }

    async fn persist(&self) {
        let report = self.supervisor.health().await;
        if let Err(err) = save_status(&self.config.status_path, &report) {
            warn!("failed to persist status: {err:#}");
        }
    }
}

fn describe(registry: Registry, operation: Operation, name: &str, updated: Option<bool>) -> String {
    match updated {
        Some(false) => format!("{} {} is already up to date", registry.kind(), name),
        _ => format!("{} {} {}", registry.kind(), name, operation.past_tense()),
    }
}

async fn execute_operation(
    state: &DaemonState,
    registry: Registry,
    operation: Operation,
    name: &str,
) -> IpcResponse {
    match state.execute(registry, operation, name).await {
        Ok(updated) => {
            let mut response = IpcResponse::ok(describe(registry, operation, name, updated));
            response.updated = updated;
            response
        }
        Err(err) => IpcResponse::error(err.to_string()),
    }
}

async fn execute_request(request: IpcRequest, state: &DaemonState) -> IpcResponse {
    match request {
        IpcRequest::Ping => IpcResponse::ok("pong"),
        IpcRequest::Shutdown => {
            let _ = state.shutdown_tx.send(());
            IpcResponse::ok("daemon shutdown scheduled")
        }
        IpcRequest::Status { target } => {
            let mut health = state.supervisor.health().await;
            if let Some(target) = target {
                health.data.services.retain(|entry| entry.name == target);
                health.data.daemons.retain(|entry| entry.name == target);
                if health.data.services.is_empty() && health.data.daemons.is_empty() {
                    return IpcResponse::error(format!("{target:?} not found"));
                }
            }
            let mut response = IpcResponse::ok("ok");
            response.health = Some(health);
            response
        }
        IpcRequest::Start { name, daemon } => {
            execute_operation(state, Registry::select(daemon), Operation::Start, &name).await
        }
        IpcRequest::Stop { name, daemon } => {
            execute_operation(state, Registry::select(daemon), Operation::Stop, &name).await
        }
        IpcRequest::Restart { name, daemon } => {
            execute_operation(state, Registry::select(daemon), Operation::Restart, &name).await
        }
        IpcRequest::Update { name, daemon } => {
            execute_operation(state, Registry::select(daemon), Operation::Update, &name).await
        }
        IpcRequest::Logs { name } => {
            if state.supervisor.services().find(&name).await.is_none() {
                return IpcResponse::error(format!("service: {name:?} not found"));
            }
            let mut response = IpcResponse::ok("ok");
            response.logs = Some(process_logs(&state.config.log_dir, &name));
            response
        }
    }
}

/// Maps `/service-<op>` and `/daemon-<op>` to their registry and operation.
fn parse_route(path: &str) -> Option<(Registry, Operation)> {
    let path = path.split('?').next().unwrap_or_default();
    if let Some(op) = path.strip_prefix("/service-") {
        return Operation::parse(op).map(|op| (Registry::Services, op));
    }
    if let Some(op) = path.strip_prefix("/daemon-") {
        return Operation::parse(op).map(|op| (Registry::Daemons, op));
    }
    None
}

async fn execute_api_request(request: HttpRequest, state: &DaemonState) -> HttpResponse {
    let path = request.path.split('?').next().unwrap_or_default();
    if path == "/healthz" {
        if request.method != "GET" {
            return HttpResponse::error(405, "method not allowed");
        }
        let report = state.supervisor.health().await;
        return match serde_json::to_value(&report) {
            Ok(body) => HttpResponse::json(200, body),
            Err(err) => HttpResponse::error(500, err.to_string()),
        };
    }

    let Some((registry, operation)) = parse_route(path) else {
        return HttpResponse::error(404, "not found");
    };
    if request.method != "POST" {
        return HttpResponse::error(405, "method not allowed");
    }
    let body = match request.json::<NameBody>() {
        Ok(body) => body,
        Err(err) => return HttpResponse::error(400, format!("{err:#}")),
    };

    match state.execute(registry, operation, &body.name).await {
        Ok(updated) => HttpResponse::ok(describe(registry, operation, &body.name, updated)),
        Err(err) if err.is_not_found() => HttpResponse::error(404, err.to_string()),
        Err(err) => HttpResponse::error(500, err.to_string()),
    }
}
