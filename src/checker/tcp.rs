//! TCP connect checker.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::net::TcpStream;

use super::{elapsed_ms, CheckError, CheckResult, Checker};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens a raw TCP connection to `tcp://host:port`.
#[derive(Debug, Clone)]
pub struct TcpChecker {
    timeout: Duration,
}

impl Default for TcpChecker {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl TcpChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Checker for TcpChecker {
    async fn check(&self, address: &str, timeout: Option<Duration>) -> CheckResult {
        let Some((host, port)) = parse_tcp_address(address) else {
            return CheckResult::failure(0, "Invalid URL format")
                .with("CONNECTED", false)
                .with("ERROR", "Invalid TCP URL format. Expected: tcp://host:port");
        };

        let timeout = timeout.unwrap_or(self.timeout);
        let start = Instant::now();

        match connect(&host, port, timeout).await {
            Ok(()) => CheckResult::success(elapsed_ms(start))
                .with("CONNECTED", true)
                .with("STATUS", "connected"),
            Err(e) => {
                tracing::debug!("TcpChecker: {}:{} failed: {}", host, port, e);
                CheckResult::failure(elapsed_ms(start), connect_error_message(&e))
                    .with("CONNECTED", false)
            }
        }
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }
}

/// Split `tcp://host:port` into its parts.
pub fn parse_tcp_address(address: &str) -> Option<(String, u16)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^tcp://([^:/]+):(\d+)$").unwrap());

    let caps = re.captures(address)?;
    let host = caps.get(1)?.as_str().to_string();
    let port = caps.get(2)?.as_str().parse::<u16>().ok()?;
    Some((host, port))
}

async fn connect(host: &str, port: u16, timeout: Duration) -> Result<(), CheckError> {
    // The stream is dropped as soon as the connect resolves, on every path.
    let _stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| CheckError::Timeout(timeout))?
        .map_err(|e| CheckError::Network(e.to_string()))?;
    Ok(())
}

fn connect_error_message(e: &CheckError) -> String {
    match e {
        CheckError::Timeout(_) => "Connection timeout".to_string(),
        other => other.to_string(),
    }
}
