//! WebSocket handshake checker.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{elapsed_ms, CheckError, CheckResult, Checker};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens a WebSocket handshake and closes it as soon as it is established.
#[derive(Debug, Clone)]
pub struct WebSocketChecker {
    timeout: Duration,
}

impl Default for WebSocketChecker {
    fn default() -> Self {
        Self {
            timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

#[async_trait]
impl Checker for WebSocketChecker {
    async fn check(&self, address: &str, timeout: Option<Duration>) -> CheckResult {
        let timeout = timeout.unwrap_or(self.timeout);
        let start = Instant::now();

        match handshake(address, timeout).await {
            Ok(()) => CheckResult::success(elapsed_ms(start)).with("CONNECTED", true),
            Err(e) => {
                let elapsed = elapsed_ms(start);
                let message = match &e {
                    CheckError::Timeout(_) => "Connection timeout".to_string(),
                    other => other.to_string(),
                };
                CheckResult::failure(elapsed, message)
                    .with("CONNECTED", false)
                    .with("RESPONSE_TIME", elapsed)
            }
        }
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }
}

async fn handshake(address: &str, timeout: Duration) -> Result<(), CheckError> {
    let (mut stream, _response) =
        tokio::time::timeout(timeout, tokio_tungstenite::connect_async(address))
            .await
            .map_err(|_| CheckError::Timeout(timeout))?
            .map_err(|e| CheckError::Network(e.to_string()))?;

    // Only the handshake matters; a failed close is not a failed check
    if let Err(e) = stream.close(None).await {
        tracing::debug!("WebSocketChecker: close after open failed for {}: {}", address, e);
    }
    Ok(())
}
