//! Health probes.
//!
//! A probe passes or returns a short failure reason. The rollout controller
//! names the failing probe when it rolls back.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use shipyard_core::{ProbeCheck, ProbeSpec};
use shipyard_executor::{CancelSignal, CommandSpec, ComputeRunner};

/// Default time one probe may take
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Evaluates one probe
#[async_trait]
pub trait HealthProbe: Send + Sync + std::fmt::Debug {
    /// Returns the failure reason if the probe does not pass
    async fn check(&self, probe: &ProbeSpec) -> Result<(), String>;
}

/// HTTP GET probe
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl HttpProbe {
    /// Probe whose requests time out after `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn get(&self, url: &str, expect_status: Option<u16>) -> Result<(), String> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| format!("GET {url}: {e}"))?;
        let status = response.status();
        let healthy = match expect_status {
            Some(expected) => status.as_u16() == expected,
            None => status.is_success(),
        };
        debug!(url = %url, status = status.as_u16(), healthy, "http probe");
        if healthy {
            Ok(())
        } else {
            Err(match expect_status {
                Some(expected) => format!("GET {url} returned {}, expected {expected}", status.as_u16()),
                None => format!("GET {url} returned {}", status.as_u16()),
            })
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, probe: &ProbeSpec) -> Result<(), String> {
        match &probe.check {
            ProbeCheck::Http { url, expect_status } => self.get(url, *expect_status).await,
            ProbeCheck::Run { .. } => Err(format!("'{}' is not an HTTP probe", probe.name)),
        }
    }
}

/// Command probe: passes on exit status zero
#[derive(Debug, Clone)]
pub struct CommandProbe {
    runner: Arc<dyn ComputeRunner>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandProbe {
    /// Probe running commands through `runner` in `working_dir`
    pub fn new(runner: Arc<dyn ComputeRunner>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            working_dir: working_dir.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Overrides the command timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn check(&self, probe: &ProbeSpec) -> Result<(), String> {
        let ProbeCheck::Run { command } = &probe.check else {
            return Err(format!("'{}' is not a command probe", probe.name));
        };
        let spec = CommandSpec::new(command.clone(), &self.working_dir, self.timeout);
        let result = self
            .runner
            .run_command(&spec, &CancelSignal::never())
            .await
            .map_err(|e| e.to_string())?;
        if result.outcome.is_success() {
            return Ok(());
        }
        let output = result.combined_output();
        let last = output.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or_default();
        Err(if last.is_empty() {
            result.outcome.to_string()
        } else {
            format!("{}: {}", result.outcome, last.trim())
        })
    }
}

/// Dispatches each probe to the HTTP or command probe
#[derive(Debug, Clone)]
pub struct StandardProbe {
    http: HttpProbe,
    command: CommandProbe,
}

impl StandardProbe {
    /// Combines both probe kinds
    #[must_use]
    pub fn new(http: HttpProbe, command: CommandProbe) -> Self {
        Self { http, command }
    }
}

#[async_trait]
impl HealthProbe for StandardProbe {
    async fn check(&self, probe: &ProbeSpec) -> Result<(), String> {
        match probe.check {
            ProbeCheck::Http { .. } => self.http.check(probe).await,
            ProbeCheck::Run { .. } => self.command.check(probe).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use shipyard_executor::LocalRunner;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves `status` to every connection
    async fn serve(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/healthz")
    }

    fn http(url: &str, expect_status: Option<u16>) -> ProbeSpec {
        ProbeSpec {
            name: "healthz".to_string(),
            check: ProbeCheck::Http {
                url: url.to_string(),
                expect_status,
            },
        }
    }

    fn run(command: &str) -> ProbeSpec {
        ProbeSpec {
            name: "smoke".to_string(),
            check: ProbeCheck::Run {
                command: command.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_http_probe_status() {
        let ok = serve("200 OK").await;
        let broken = serve("503 Service Unavailable").await;
        let probe = HttpProbe::default();

        assert_eq!(probe.check(&http(&ok, None)).await, Ok(()));
        assert_eq!(probe.check(&http(&broken, Some(503))).await, Ok(()));
        let err = probe.check(&http(&broken, None)).await.unwrap_err();
        assert!(err.ends_with("returned 503"), "{err}");
        let err = probe.check(&http(&ok, Some(204))).await.unwrap_err();
        assert!(err.ends_with("returned 200, expected 204"), "{err}");
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);
        assert!(HttpProbe::new(Duration::from_secs(2)).check(&http(&url, None)).await.is_err());
    }

    #[tokio::test]
    async fn test_command_probe_reports_last_line() {
        let dir = TempDir::new().unwrap();
        let probe = CommandProbe::new(Arc::new(LocalRunner::default()), dir.path());
        assert_eq!(probe.check(&run("true")).await, Ok(()));
        assert_eq!(
            probe.check(&run("echo checking; echo 'queue depth 900' >&2; exit 1")).await,
            Err("failed (exit 1): queue depth 900".to_string())
        );
    }

    #[tokio::test]
    async fn test_standard_probe_dispatches() {
        let dir = TempDir::new().unwrap();
        let url = serve("204 No Content").await;
        let probe = StandardProbe::new(
            HttpProbe::default(),
            CommandProbe::new(Arc::new(LocalRunner::default()), dir.path()),
        );
        assert_eq!(probe.check(&http(&url, None)).await, Ok(()));
        assert_eq!(probe.check(&run("exit 0")).await, Ok(()));
        assert!(HttpProbe::default().check(&run("exit 0")).await.is_err());
    }
}
