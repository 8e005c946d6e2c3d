//! DNS checker using raw UDP packets.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use super::{elapsed_ms, CheckError, CheckResult, Checker};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const FALLBACK_NAMESERVER: &str = "8.8.8.8:53";
const EDNS_PAYLOAD_SIZE: u16 = 1232;

/// Nameserver from `/etc/resolv.conf`, read once per process.
static SYSTEM_NAMESERVER: OnceLock<String> = OnceLock::new();

/// Record types the checker can query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Mx,
    Txt,
    Ns,
}

impl RecordType {
    /// Parse a `type=` query value. Unknown values fall back to `A`.
    pub fn parse_or_default(s: Option<&str>) -> Self {
        match s.map(|v| v.to_ascii_uppercase()).as_deref() {
            Some("AAAA") => RecordType::Aaaa,
            Some("CNAME") => RecordType::Cname,
            Some("MX") => RecordType::Mx,
            Some("TXT") => RecordType::Txt,
            Some("NS") => RecordType::Ns,
            _ => RecordType::A,
        }
    }

    fn qtype(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
            RecordType::Ns => "NS",
        }
    }
}

/// A parsed `dns://hostname?type=T&expect=V` address.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsQuery {
    pub hostname: String,
    pub record_type: RecordType,
    pub expect: Option<String>,
}

impl DnsQuery {
    pub fn parse(address: &str) -> Result<Self, CheckError> {
        let url = url::Url::parse(address)
            .map_err(|e| CheckError::Config(format!("Invalid DNS URL '{}': {}", address, e)))?;
        if url.scheme() != "dns" {
            return Err(CheckError::Config(format!(
                "Invalid DNS URL '{}'. Expected: dns://hostname?type=A",
                address
            )));
        }

        let hostname = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| CheckError::Config(format!("Missing hostname in '{}'", address)))?
            .to_string();

        let mut record_type = None;
        let mut expect = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "type" => record_type = Some(value.into_owned()),
                "expect" if !value.is_empty() => expect = Some(value.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            hostname,
            record_type: RecordType::parse_or_default(record_type.as_deref()),
            expect,
        })
    }
}

/// Resolves a hostname against the system nameserver.
#[derive(Debug, Clone)]
pub struct DnsChecker {
    nameserver: Option<SocketAddr>,
    timeout: Duration,
}

impl Default for DnsChecker {
    fn default() -> Self {
        Self {
            nameserver: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl DnsChecker {
    /// Query a fixed nameserver instead of the one in `/etc/resolv.conf`.
    pub fn with_nameserver(nameserver: SocketAddr, timeout: Duration) -> Self {
        Self {
            nameserver: Some(nameserver),
            timeout,
        }
    }

    fn nameserver(&self) -> String {
        match self.nameserver {
            Some(addr) => addr.to_string(),
            None => system_nameserver().to_string(),
        }
    }
}

#[async_trait]
impl Checker for DnsChecker {
    async fn check(&self, address: &str, timeout: Option<Duration>) -> CheckResult {
        let timeout = timeout.unwrap_or(self.timeout);
        let start = Instant::now();

        let query = match DnsQuery::parse(address) {
            Ok(q) => q,
            Err(e) => {
                return CheckResult::failure(elapsed_ms(start), e.to_string())
                    .with("DNS_RCODE", "SERVFAIL")
            }
        };

        match resolve(&self.nameserver(), &query, timeout).await {
            Ok(records) => {
                let elapsed = elapsed_ms(start);
                let serialized = serde_json::to_string(&records).unwrap_or_default();
                let matched = query
                    .expect
                    .as_deref()
                    .map_or(true, |expected| serialized.contains(expected));

                let result = if matched {
                    CheckResult::success(elapsed)
                } else {
                    CheckResult::failure(
                        elapsed,
                        format!(
                            "Expected value '{}' not found in {} records",
                            query.expect.as_deref().unwrap_or_default(),
                            query.record_type.as_str()
                        ),
                    )
                    .with("RESPONSE_TIME", elapsed)
                };

                result
                    .with("DNS_RCODE", "NOERROR")
                    .with("DNS_RECORDS", records)
                    .with("DNS_HOSTNAME", query.hostname.as_str())
                    .with("DNS_TYPE", query.record_type.as_str())
            }
            Err(e) => {
                tracing::debug!("DnsChecker: {} failed: {}", query.hostname, e);
                CheckResult::failure(elapsed_ms(start), e.to_string())
                    .with("DNS_RCODE", "SERVFAIL")
                    .with("DNS_HOSTNAME", query.hostname.as_str())
                    .with("DNS_TYPE", query.record_type.as_str())
            }
        }
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }
}

/// First `nameserver` entry from `/etc/resolv.conf`, or the public fallback.
fn system_nameserver() -> &'static str {
    SYSTEM_NAMESERVER.get_or_init(|| {
        std::fs::read_to_string("/etc/resolv.conf")
            .ok()
            .and_then(|conf| parse_resolv_conf(&conf))
            .unwrap_or_else(|| FALLBACK_NAMESERVER.to_string())
    })
}

fn parse_resolv_conf(conf: &str) -> Option<String> {
    conf.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix("nameserver"))
        .map(str::trim)
        .filter(|server| !server.is_empty())
        .map(|server| match server.parse::<Ipv6Addr>() {
            Ok(v6) => format!("[{}]:53", v6),
            Err(_) => format!("{}:53", server),
        })
}

async fn resolve(
    nameserver: &str,
    query: &DnsQuery,
    timeout: Duration,
) -> Result<Vec<String>, CheckError> {
    let (packet, tx_id) = build_dns_query(&query.hostname, query.record_type)?;

    let exchange = async {
        let response = exchange_udp(nameserver, &packet, tx_id).await?;
        if !is_truncated(&response) {
            return Ok(response);
        }
        tracing::debug!("DnsChecker: response for {} truncated, retrying over TCP", query.hostname);
        exchange_tcp(nameserver, &packet, tx_id).await
    };

    let response = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| CheckError::Timeout(timeout))??;

    let records = parse_dns_response(&response, query.record_type)?;
    if records.is_empty() {
        return Err(CheckError::Resolve(format!(
            "no {} records found for {}",
            query.record_type.as_str(),
            query.hostname
        )));
    }
    Ok(records)
}

fn is_truncated(msg: &[u8]) -> bool {
    msg.get(2).is_some_and(|flags| flags & 0x02 != 0)
}

async fn exchange_udp(nameserver: &str, packet: &[u8], tx_id: u16) -> Result<Vec<u8>, CheckError> {
    let bind_addr = if nameserver.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| CheckError::Network(format!("failed to bind socket: {}", e)))?;
    socket
        .connect(nameserver)
        .await
        .map_err(|e| CheckError::Network(format!("failed to connect to {}: {}", nameserver, e)))?;

    socket
        .send(packet)
        .await
        .map_err(|e| CheckError::Network(format!("failed to send: {}", e)))?;

    let mut buf = vec![0u8; 4096];
    loop {
        let n = socket
            .recv(&mut buf)
            .await
            .map_err(|e| CheckError::Network(format!("failed to recv: {}", e)))?;
        // Stray datagrams with another transaction id are skipped
        if n >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == tx_id {
            buf.truncate(n);
            return Ok(buf);
        }
    }
}

/// Send `packet` over TCP with the two-byte length prefix and read the reply.
async fn exchange_tcp(nameserver: &str, packet: &[u8], tx_id: u16) -> Result<Vec<u8>, CheckError> {
    let network = |what: &str, e: std::io::Error| CheckError::Network(format!("TCP {}: {}", what, e));

    let mut stream = TcpStream::connect(nameserver)
        .await
        .map_err(|e| network("connect failed", e))?;

    let mut framed = Vec::with_capacity(packet.len() + 2);
    framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    framed.extend_from_slice(packet);
    stream.write_all(&framed).await.map_err(|e| network("send failed", e))?;

    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await.map_err(|e| network("recv failed", e))?;
    let mut response = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut response).await.map_err(|e| network("recv failed", e))?;

    if response.len() < 2 || u16::from_be_bytes([response[0], response[1]]) != tx_id {
        return Err(CheckError::Resolve("TCP response id mismatch".to_string()));
    }
    Ok(response)
}

/// Build a recursive query packet with an EDNS0 OPT record.
///
/// Returns the packet and its transaction id.
fn build_dns_query(hostname: &str, record_type: RecordType) -> Result<(Vec<u8>, u16), CheckError> {
    let tx_id: u16 = rand::random();
    let flags: u16 = 0x0100; // Standard query, recursion desired

    let mut packet = Vec::with_capacity(64);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&1u16.to_be_bytes()); // ARCOUNT (OPT)

    for label in hostname.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(CheckError::Config(format!("invalid hostname: {}", hostname)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&record_type.qtype().to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN

    // OPT pseudo-record: root name, type 41, payload size in CLASS
    packet.push(0);
    packet.extend_from_slice(&41u16.to_be_bytes());
    packet.extend_from_slice(&EDNS_PAYLOAD_SIZE.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());

    Ok((packet, tx_id))
}

/// Extract the answer records of `record_type` from a response.
fn parse_dns_response(msg: &[u8], record_type: RecordType) -> Result<Vec<String>, CheckError> {
    let malformed = || CheckError::Resolve("malformed DNS response".to_string());

    if msg.len() < 12 {
        return Err(CheckError::Resolve(format!("response too short: {} bytes", msg.len())));
    }

    let rcode = msg[3] & 0x0F;
    if rcode != 0 {
        return Err(CheckError::Resolve(format!("DNS error {}", rcode_name(rcode))));
    }

    let qd_count = u16::from_be_bytes([msg[4], msg[5]]);
    let an_count = u16::from_be_bytes([msg[6], msg[7]]);

    let mut pos = 12;
    for _ in 0..qd_count {
        let (_, next) = read_name(msg, pos).ok_or_else(malformed)?;
        pos = next + 4;
    }

    let mut records = Vec::new();
    for _ in 0..an_count {
        let (_, next) = read_name(msg, pos).ok_or_else(malformed)?;
        pos = next;
        let header = msg.get(pos..pos + 10).ok_or_else(malformed)?;
        let rtype = u16::from_be_bytes([header[0], header[1]]);
        let rdlen = u16::from_be_bytes([header[8], header[9]]) as usize;
        let rdata_start = pos + 10;
        let rdata = msg.get(rdata_start..rdata_start + rdlen).ok_or_else(malformed)?;
        pos = rdata_start + rdlen;

        if rtype != record_type.qtype() {
            continue;
        }

        let record = match record_type {
            RecordType::A => {
                let octets: [u8; 4] = rdata.try_into().map_err(|_| malformed())?;
                Ipv4Addr::from(octets).to_string()
            }
            RecordType::Aaaa => {
                let octets: [u8; 16] = rdata.try_into().map_err(|_| malformed())?;
                Ipv6Addr::from(octets).to_string()
            }
            RecordType::Cname | RecordType::Ns => {
                read_name(msg, rdata_start).ok_or_else(malformed)?.0
            }
            RecordType::Mx => {
                let preference = u16::from_be_bytes([
                    *rdata.first().ok_or_else(malformed)?,
                    *rdata.get(1).ok_or_else(malformed)?,
                ]);
                let exchange = read_name(msg, rdata_start + 2).ok_or_else(malformed)?.0;
                format!("{} {}", preference, exchange)
            }
            RecordType::Txt => read_character_strings(rdata).ok_or_else(malformed)?,
        };
        records.push(record);
    }

    Ok(records)
}

/// Read a possibly compressed domain name at `pos`.
///
/// Returns the dotted name and the offset just past the name in the
/// original (uncompressed) position.
fn read_name(msg: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *msg.get(pos)? as usize;
        if len == 0 {
            end.get_or_insert(pos + 1);
            break;
        }
        if len & 0xC0 == 0xC0 {
            let pointer = (((len & 0x3F) << 8) | *msg.get(pos + 1)? as usize) as usize;
            end.get_or_insert(pos + 2);
            jumps += 1;
            if jumps > 64 {
                return None;
            }
            pos = pointer;
            continue;
        }
        let label = msg.get(pos + 1..pos + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += 1 + len;
    }

    Some((labels.join("."), end?))
}

fn read_character_strings(rdata: &[u8]) -> Option<String> {
    let mut out = String::new();
    let mut pos = 0;
    while pos < rdata.len() {
        let len = rdata[pos] as usize;
        let chunk = rdata.get(pos + 1..pos + 1 + len)?;
        out.push_str(&String::from_utf8_lossy(chunk));
        pos += 1 + len;
    }
    Some(out)
}

fn rcode_name(rcode: u8) -> &'static str {
    match rcode {
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        _ => "UNKNOWN",
    }
}
