use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, warn};
use url::Url;

pub const DEFAULT_NOTIFY_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_NOTIFY_BACKOFF: Duration = Duration::from_secs(3);

/// External collaborator told about services that exited with an error.
#[async_trait]
pub trait ExitNotifier: Send + Sync {
    async fn notify_exit_error(&self, name: &str, at: SystemTime) -> Result<()>;
}

/// Posts exit errors to the local status endpoint
/// (`<base>/service/<name>/exit-error`).
#[derive(Debug, Clone)]
pub struct HttpExitNotifier {
    base: Url,
    client: reqwest::Client,
}

impl HttpExitNotifier {
    pub fn new(base: &str) -> Result<Self> {
        let mut base = Url::parse(base).with_context(|| format!("invalid notify url {base:?}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to create notify HTTP client")?;
        Ok(Self { base, client })
    }

    pub fn endpoint(&self, name: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("notify url {} cannot be a base", self.base))?
            .pop_if_empty()
            .extend(["service", name, "exit-error"]);
        Ok(url)
    }
}

#[async_trait]
impl ExitNotifier for HttpExitNotifier {
    async fn notify_exit_error(&self, name: &str, at: SystemTime) -> Result<()> {
        let url = self.endpoint(name)?;
        let body = json!({
            "name": name,
            "timestamp": epoch_millis(at),
        });
        let response = self
            .client
            .post(url.as_str())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("{url} answered with status {status}");
        }
        Ok(())
    }
}

/// Notifier used when no endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogExitNotifier;

#[async_trait]
impl ExitNotifier for LogExitNotifier {
    async fn notify_exit_error(&self, name: &str, at: SystemTime) -> Result<()> {
        warn!("service {} exited with error at {}", name, epoch_millis(at));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_NOTIFY_ATTEMPTS,
            backoff: DEFAULT_NOTIFY_BACKOFF,
        }
    }
}

/// Reports an exit error, retrying up to `policy.attempts` times. Returns
/// whether the notification was delivered.
pub async fn notify_with_retry(
    notifier: &dyn ExitNotifier,
    name: &str,
    policy: RetryPolicy,
) -> bool {
    let at = SystemTime::now();
    for attempt in 1..=policy.attempts {
        match notifier.notify_exit_error(name, at).await {
            Ok(()) => {
                debug!("exit error for {} delivered on attempt {}", name, attempt);
                return true;
            }
            Err(err) => {
                error!(
                    "exit error notification for {} failed (attempt {}/{}): {:#}",
                    name, attempt, policy.attempts, err
                );
                if attempt < policy.attempts {
                    sleep(policy.backoff).await;
                }
            }
        }
    }
    warn!("giving up on exit error notification for {}", name);
    false
}

fn epoch_millis(at: SystemTime) -> u128 {
    at.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};

    use serde::Deserialize;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time::Duration;

    use super::testing::RecordingNotifier;
    use super::{notify_with_retry, ExitNotifier, HttpExitNotifier, RetryPolicy};
    use crate::http::{read_http_request, write_http_response, HttpRequest, HttpResponse};

    #[derive(Debug, Deserialize)]
    struct ExitPayload {
        name: String,
        timestamp: u64,
    }

    async fn serve_once(response: HttpResponse) -> (String, JoinHandle<HttpRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let request = read_http_request(&mut stream).await.expect("parse request");
            write_http_response(&mut stream, &response)
                .await
                .expect("write response");
            request
        });
        (format!("http://{addr}"), server)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn gives_up_after_exactly_the_configured_attempts() {
        let notifier = RecordingNotifier::failing(usize::MAX);

        let delivered = notify_with_retry(&notifier, "api", fast_policy()).await;

        assert!(!delivered);
        assert_eq!(notifier.attempts(), 3);
    }

    #[tokio::test]
    async fn stops_retrying_once_delivered() {
        let notifier = RecordingNotifier::failing(1);

        let delivered = notify_with_retry(&notifier, "api", fast_policy()).await;

        assert!(delivered);
        assert_eq!(notifier.attempts(), 2);
        assert_eq!(
            notifier.delivered.lock().expect("delivered").as_slice(),
            ["api".to_string()]
        );
    }

    #[test]
    fn http_notifier_builds_endpoint_under_base_path() {
        let notifier = HttpExitNotifier::new("http://localhost:5005").expect("valid url");
        assert_eq!(
            notifier.endpoint("api").expect("endpoint").as_str(),
            "http://localhost:5005/service/api/exit-error"
        );

        let nested = HttpExitNotifier::new("http://127.0.0.1:9000/led").expect("valid url");
        assert_eq!(
            nested.endpoint("wifi worker").expect("endpoint").as_str(),
            "http://127.0.0.1:9000/led/service/wifi%20worker/exit-error"
        );
    }

    #[tokio::test]
    async fn http_notifier_posts_name_and_timestamp() {
        let (base, server) = serve_once(HttpResponse::ok("noted")).await;
        let notifier = HttpExitNotifier::new(&base).expect("valid url");
        let at = UNIX_EPOCH + StdDuration::from_millis(1_700_000_000_123);

        notifier
            .notify_exit_error("api", at)
            .await
            .expect("notification should be delivered");
        let request = server.await.expect("server task");

        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/service/api/exit-error");
        let payload: ExitPayload = request.json().expect("json body");
        assert_eq!(payload.name, "api");
        assert_eq!(payload.timestamp, 1_700_000_000_123);
    }

    #[tokio::test]
    async fn http_notifier_fails_on_error_status() {
        let (base, server) = serve_once(HttpResponse::error(500, "down")).await;
        let notifier = HttpExitNotifier::new(&base).expect("valid url");

        let err = notifier
            .notify_exit_error("api", SystemTime::now())
            .await
            .expect_err("500 must count as a failed attempt");
        server.await.expect("server task");

        assert!(format!("{err:#}").contains("500"));
    }

    #[test]
    fn default_policy_is_three_attempts_three_seconds_apart() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.backoff, Duration::from_secs(3));
    }
}
