//! Ping checker with native ICMP and command fallback.
//!
//! Native ICMP runs on a blocking socket inside `spawn_blocking`. When the
//! host refuses ICMP sockets the system `ping` utility is used instead and its
//! output is scraped for the round-trip time.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{elapsed_ms, CheckError, CheckResult, Checker};

/// Per-attempt timeout handed to the echo request.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Overall cap on the command, including process spawn.
const OVERALL_TIMEOUT: Duration = Duration::from_secs(10);

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW; DGRAM works unprivileged where ping_group_range allows
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("PingChecker: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("PingChecker: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }
    tracing::info!("PingChecker: native ICMP unavailable, using ping command");
    IcmpCapability::CommandOnly
}

/// Outcome of a single echo attempt.
#[derive(Debug, Clone, PartialEq)]
struct PingOutcome {
    reachable: bool,
    /// Round-trip time in milliseconds, when known.
    rtt_ms: Option<u64>,
}

/// Sends one ICMP echo to `ping://host`.
#[derive(Debug, Clone)]
pub struct PingChecker {
    timeout: Duration,
}

impl Default for PingChecker {
    fn default() -> Self {
        Self {
            timeout: OVERALL_TIMEOUT,
        }
    }
}

#[async_trait]
impl Checker for PingChecker {
    async fn check(&self, address: &str, timeout: Option<Duration>) -> CheckResult {
        let timeout = timeout.unwrap_or(self.timeout);
        let start = Instant::now();

        let host = match parse_ping_address(address) {
            Ok(h) => h,
            Err(e) => {
                return CheckResult::failure(elapsed_ms(start), e.to_string())
                    .with("PACKET_LOSS", 100u64)
            }
        };

        let outcome = match tokio::time::timeout(timeout, ping(&host)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CheckError::Timeout(timeout)),
        };

        match outcome {
            Ok(PingOutcome { reachable: true, rtt_ms }) => {
                let ping_time = rtt_ms.unwrap_or_else(|| elapsed_ms(start));
                CheckResult::success(ping_time)
                    .with("PING_HOST", host.as_str())
                    .with("PING_TIME", ping_time)
                    .with("PACKET_LOSS", 0u64)
            }
            Ok(PingOutcome { reachable: false, .. }) => {
                CheckResult::failure(elapsed_ms(start), "100% packet loss")
                    .with("PING_HOST", host.as_str())
                    .with("PACKET_LOSS", 100u64)
            }
            Err(e) => {
                tracing::debug!("PingChecker: {} failed: {}", host, e);
                CheckResult::failure(elapsed_ms(start), e.to_string())
                    .with("PING_HOST", host.as_str())
                    .with("PACKET_LOSS", 100u64)
            }
        }
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }
}

/// Extract the host from `ping://host`.
pub fn parse_ping_address(address: &str) -> Result<String, CheckError> {
    let url = url::Url::parse(address)
        .map_err(|e| CheckError::Config(format!("Invalid ping URL '{}': {}", address, e)))?;
    if url.scheme() != "ping" {
        return Err(CheckError::Config(format!(
            "Invalid ping URL '{}'. Expected: ping://host",
            address
        )));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| CheckError::Config(format!("Missing host in '{}'", address)))?;
    // Keep IPv6 literals bare for the socket and the command line
    Ok(host.trim_start_matches('[').trim_end_matches(']').to_string())
}

async fn ping(host: &str) -> Result<PingOutcome, CheckError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let ip = resolve_address(host).await?;
        let result = tokio::task::spawn_blocking(move || echo_blocking(ip, ATTEMPT_TIMEOUT))
            .await
            .map_err(|e| CheckError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Ok(rtt) => {
                return Ok(PingOutcome {
                    reachable: true,
                    rtt_ms: Some(rtt.as_millis() as u64),
                })
            }
            Err(CheckError::Timeout(_)) => {
                return Ok(PingOutcome {
                    reachable: false,
                    rtt_ms: None,
                })
            }
            Err(e) if is_permission_error(&e) => {
                tracing::warn!(
                    "PingChecker: native ping to {} denied, falling back to command: {}",
                    host,
                    e
                );
            }
            Err(e) => return Err(e),
        }
    }

    run_ping_command(host).await
}

fn is_permission_error(e: &CheckError) -> bool {
    let s = e.to_string();
    s.contains("Permission") || s.contains("Operation not permitted") || s.contains("denied")
}

async fn resolve_address(host: &str) -> Result<IpAddr, CheckError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| CheckError::Resolve(format!("DNS resolution failed for {}: {}", host, e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| CheckError::Resolve(format!("No addresses found for {}", host)))
}

/// One echo request/reply exchange on a blocking socket.
fn echo_blocking(ip: IpAddr, timeout: Duration) -> Result<Duration, CheckError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 8u8, 0u8),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 128u8, 129u8),
    };

    let mut socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| CheckError::Network(format!("Failed to create ICMP socket: {}", e)))?;
    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| CheckError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| CheckError::Network(format!("Failed to connect: {}", e)))?;

    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(request_type, identifier, sequence);

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            CheckError::Network(format!("Permission denied: {}", e))
        } else {
            CheckError::Network(format!("Failed to send: {}", e))
        }
    })?;

    let mut buf = [0u8; 1500];
    loop {
        let len = socket.read(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                CheckError::Timeout(timeout)
            }
            _ => CheckError::Network(format!("Failed to receive: {}", e)),
        })?;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(CheckError::Timeout(timeout));
        }

        // RAW IPv4 sockets deliver the IP header ahead of the ICMP message
        let offset = if ip.is_ipv4() && len > 0 && buf[0] >> 4 == 4 {
            ((buf[0] & 0x0F) as usize) * 4
        } else {
            0
        };
        if is_echo_reply(&buf[..len], offset, reply_type, identifier, sequence) {
            return Ok(elapsed);
        }
    }
}

fn is_echo_reply(buf: &[u8], offset: usize, reply_type: u8, identifier: u16, sequence: u16) -> bool {
    let Some(icmp) = buf.get(offset..offset + 8) else {
        return false;
    };
    // DGRAM sockets on Linux rewrite the identifier, so only type and sequence are binding there
    let id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    icmp[0] == reply_type && seq == sequence && (offset == 0 || id == identifier)
}

/// Build an ICMP/ICMPv6 echo request. The ICMPv6 checksum is left to the kernel.
fn build_echo_request(request_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = request_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    if request_type == 8 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// RFC 1071 checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

fn ping_command_args(host: &str) -> Vec<String> {
    if cfg!(windows) {
        vec!["-n".into(), "1".into(), "-w".into(), "5000".into(), host.into()]
    } else {
        vec!["-c".into(), "1".into(), "-W".into(), "5".into(), host.into()]
    }
}

/// Run the system ping utility under the overall cap.
async fn run_ping_command(host: &str) -> Result<PingOutcome, CheckError> {
    let child = Command::new("ping")
        .args(ping_command_args(host))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(OVERALL_TIMEOUT, child)
        .await
        .map_err(|_| CheckError::Timeout(OVERALL_TIMEOUT))?
        .map_err(|e| CheckError::Command(format!("failed to execute ping: {}", e)))?;

    interpret_ping_output(
        output.status.success(),
        &String::from_utf8_lossy(&output.stdout),
        &String::from_utf8_lossy(&output.stderr),
    )
}

/// Classify a finished `ping` run.
///
/// A non-zero exit is only reachable when a reply is printed anyway. Output
/// that reports neither a reply nor a loss summary means ping itself failed,
/// e.g. an unknown host.
fn interpret_ping_output(status_success: bool, stdout: &str, stderr: &str) -> Result<PingOutcome, CheckError> {
    let reachable = if status_success {
        ping_succeeded(stdout)
    } else {
        has_reply_marker(stdout)
    };

    if !reachable && !reports_loss(stdout) {
        let detail = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
        return Err(CheckError::Command(format!("ping failed: {}", detail)));
    }

    Ok(PingOutcome {
        reachable,
        rtt_ms: if reachable { parse_ping_time(stdout) } else { None },
    })
}

fn has_reply_marker(output: &str) -> bool {
    output.contains(" 1 received")
        || output.contains(" 1 packets received")
        // Windows prints "Reply from" for unreachable-host replies too
        || output
            .lines()
            .any(|line| line.contains("Reply from") && line.to_ascii_lowercase().contains("time"))
}

/// Output carries a loss summary or an unreachable reply, so ping ran.
fn reports_loss(output: &str) -> bool {
    output.contains("packet loss") || output.contains("Lost = ") || output.contains("host unreachable")
}

/// Reachable unless the output reports total loss without any reply.
fn ping_succeeded(output: &str) -> bool {
    if output.contains("Reply from") || output.contains("Request timed out") {
        return has_reply_marker(output);
    }
    let total_loss = output.contains("100% packet loss") || output.contains("100.0% packet loss");
    has_reply_marker(output) || !total_loss
}

/// Round-trip time in whole milliseconds from `time=X ms` / `time<1ms`.
fn parse_ping_time(output: &str) -> Option<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)time[=<](\d+\.?\d*)").unwrap());

    let ms = re.captures(output)?.get(1)?.as_str().parse::<f64>().ok()?;
    Some(ms.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::ContextValue;

    #[test]
    fn test_icmp_checksum_validates() {
        let packet = build_echo_request(8, 0x1234, 0x0001);
        // A packet including its own checksum sums to zero
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_icmp_checksum_odd_length() {
        assert_eq!(icmp_checksum(&[0xFF]), !0xFF00u16);
    }

    #[test]
    fn test_build_echo_request() {
        let packet = build_echo_request(8, 0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);

        let v6 = build_echo_request(128, 1, 2);
        assert_eq!(v6[0], 128);
        assert_eq!(v6[2..4], [0, 0]);
    }

    #[test]
    fn test_is_echo_reply() {
        let mut reply = build_echo_request(0, 0x1234, 7);
        assert!(is_echo_reply(&reply, 0, 0, 0x9999, 7));
        reply[7] = 8;
        assert!(!is_echo_reply(&reply, 0, 0, 0x1234, 7));
        assert!(!is_echo_reply(&reply[..4], 0, 0, 0x1234, 7));
    }

    #[test]
    fn test_parse_ping_time_linux() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        assert_eq!(parse_ping_time(output), Some(12));
    }

    #[test]
    fn test_parse_ping_time_windows() {
        assert_eq!(parse_ping_time("Reply from 1.1.1.1: bytes=32 time=15ms TTL=57"), Some(15));
        assert_eq!(parse_ping_time("Reply from 127.0.0.1: bytes=32 time<1ms TTL=128"), Some(1));
        assert_eq!(parse_ping_time("Request timed out."), None);
    }

    #[test]
    fn test_ping_success_rules() {
        let ok = "1 packets transmitted, 1 received, 0% packet loss, time 0ms";
        assert!(ping_succeeded(ok));

        let lost = "1 packets transmitted, 0 received, 100% packet loss, time 0ms";
        assert!(!ping_succeeded(lost));

        let macos_lost = "1 packets transmitted, 0 packets received, 100.0% packet loss";
        assert!(!ping_succeeded(macos_lost));

        assert!(ping_succeeded("Reply from 10.0.0.1: bytes=32 time=3ms TTL=64"));
    }

    const LINUX_OK: &str = "PING 10.0.0.1 (10.0.0.1) 56(84) bytes of data.
64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=0.412 ms

--- 10.0.0.1 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
";

    const LINUX_LOST: &str = "PING 10.0.0.9 (10.0.0.9) 56(84) bytes of data.

--- 10.0.0.9 ping statistics ---
1 packets transmitted, 0 received, 100% packet loss, time 0ms
";

    const MACOS_OK: &str = "PING 10.0.0.1 (10.0.0.1): 56 data bytes
64 bytes from 10.0.0.1: icmp_seq=0 ttl=64 time=3.611 ms

--- 10.0.0.1 ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
";

    const MACOS_LOST: &str = "PING 10.0.0.9 (10.0.0.9): 56 data bytes

--- 10.0.0.9 ping statistics ---
1 packets transmitted, 0 packets received, 100.0% packet loss
";

    const WINDOWS_OK: &str = "Pinging 10.0.0.1 with 32 bytes of data:
Reply from 10.0.0.1: bytes=32 time=7ms TTL=64

Ping statistics for 10.0.0.1:
    Packets: Sent = 1, Received = 1, Lost = 0 (0% loss),
";

    const WINDOWS_UNREACHABLE: &str = "Pinging 10.0.0.9 with 32 bytes of data:
Reply from 10.0.0.2: Destination host unreachable.

Ping statistics for 10.0.0.9:
    Packets: Sent = 1, Received = 1, Lost = 0 (0% loss),
";

    const WINDOWS_TIMEOUT: &str = "Pinging 10.0.0.9 with 32 bytes of data:
Request timed out.

Ping statistics for 10.0.0.9:
    Packets: Sent = 1, Received = 0, Lost = 1 (100% loss),
";

    #[test]
    fn test_command_output_reachable() {
        for (output, rtt) in [(LINUX_OK, 0), (MACOS_OK, 4), (WINDOWS_OK, 7)] {
            let outcome = interpret_ping_output(true, output, "").unwrap();
            assert!(outcome.reachable, "{}", output);
            assert_eq!(outcome.rtt_ms, Some(rtt));
        }
    }

    #[test]
    fn test_command_output_unreachable() {
        for output in [LINUX_LOST, MACOS_LOST, WINDOWS_TIMEOUT] {
            let outcome = interpret_ping_output(false, output, "").unwrap();
            assert!(!outcome.reachable, "{}", output);
            assert_eq!(outcome.rtt_ms, None);
        }
    }

    #[test]
    fn test_windows_unreachable_reply_is_not_success() {
        // Windows may exit 0 here
        for status in [true, false] {
            let outcome = interpret_ping_output(status, WINDOWS_UNREACHABLE, "").unwrap();
            assert!(!outcome.reachable);
        }
    }

    #[test]
    fn test_command_failure_is_error() {
        let err = interpret_ping_output(false, "", "ping: nosuchhost.invalid: Name or service not known")
            .unwrap_err();
        match err {
            CheckError::Command(msg) => assert!(msg.contains("Name or service not known")),
            other => panic!("unexpected error: {:?}", other),
        }

        let err = interpret_ping_output(false, "ping: unknown host", "").unwrap_err();
        assert!(err.to_string().contains("unknown host"));
    }

    #[test]
    fn test_parse_ping_address() {
        assert_eq!(parse_ping_address("ping://example.com").unwrap(), "example.com");
        assert_eq!(parse_ping_address("ping://10.0.0.1").unwrap(), "10.0.0.1");
        assert_eq!(parse_ping_address("ping://[::1]").unwrap(), "::1");
        assert!(parse_ping_address("example.com").is_err());
        assert!(parse_ping_address("tcp://example.com:80").is_err());
    }

    #[tokio::test]
    async fn test_malformed_address_never_raises() {
        let result = PingChecker::default().check("definitely not a url", None).await;
        assert!(!result.success);
        assert!(result.error.as_deref().is_some_and(|e| !e.is_empty()));
        assert_eq!(result.context.get("PACKET_LOSS"), Some(&ContextValue::Number(100.0)));
    }
}
