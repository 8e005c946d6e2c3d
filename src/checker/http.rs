//! HTTP checker.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{elapsed_ms, CheckError, CheckResult, Checker};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bodies larger than this are truncated before landing in the context.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Issues a GET against an `http://` or `https://` address.
#[derive(Debug, Clone)]
pub struct HttpChecker {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for HttpChecker {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl HttpChecker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

struct HttpResponse {
    status: u16,
    content_length: usize,
    body: String,
}

#[async_trait]
impl Checker for HttpChecker {
    async fn check(&self, address: &str, timeout: Option<Duration>) -> CheckResult {
        let timeout = timeout.unwrap_or(self.timeout);
        let start = Instant::now();

        match self.fetch(address, timeout).await {
            Ok(response) => {
                let elapsed = elapsed_ms(start);
                let ok = (200..400).contains(&response.status);
                let result = if ok {
                    CheckResult::success(elapsed)
                } else {
                    CheckResult::failure(elapsed, format!("HTTP status {}", response.status))
                        .with("RESPONSE_TIME", elapsed)
                };
                result
                    .with("CONNECTED", true)
                    .with("STATUS_CODE", response.status)
                    .with("CONTENT_LENGTH", response.content_length as u64)
                    .with("BODY", response.body)
            }
            Err(e) => {
                let message = match &e {
                    CheckError::Timeout(t) => format!("Request timed out after {:?}", t),
                    other => other.to_string(),
                };
                CheckResult::failure(elapsed_ms(start), message).with("CONNECTED", false)
            }
        }
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }
}

impl HttpChecker {
    async fn fetch(&self, address: &str, timeout: Duration) -> Result<HttpResponse, CheckError> {
        let url = url::Url::parse(address)
            .map_err(|e| CheckError::Config(format!("Invalid URL '{}': {}", address, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(CheckError::Config(format!(
                "Invalid URL scheme '{}'. Expected http or https",
                url.scheme()
            )));
        }

        let mut response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        let status = response.status().as_u16();
        let (content_length, body) = read_capped_body(&mut response)
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        Ok(HttpResponse {
            status,
            content_length,
            body,
        })
    }
}

/// Read the full body to measure complete transfer time, keeping only the
/// first `MAX_BODY_BYTES`. Returns the total length and the kept text.
async fn read_capped_body(response: &mut reqwest::Response) -> Result<(usize, String), reqwest::Error> {
    let mut kept: Vec<u8> = Vec::new();
    let mut total = 0;

    while let Some(chunk) = response.chunk().await? {
        total += chunk.len();
        let room = MAX_BODY_BYTES - kept.len();
        kept.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    Ok((total, String::from_utf8_lossy(&kept).into_owned()))
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> CheckError {
    if e.is_timeout() {
        CheckError::Timeout(timeout)
    } else {
        CheckError::Network(e.to_string())
    }
}
