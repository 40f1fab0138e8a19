// Live capture sessions: tcpdump line parsing and the bounded scan loop

use crate::ifaces::NetworkInterface;
use crate::summary::CaptureSummary;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Longest capture session we allow, matching the scan endpoint contract.
const MAX_SCAN_TIMEOUT: Duration = Duration::from_secs(60);

/// Protocol family of a captured packet.
///
/// Numeric values follow the IP protocol numbers; the JSON form is the family
/// name. `Forbbiden` is the unclassified zero value and never comes out of the
/// parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    Forbbiden = 0,
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
}

impl ProtocolFamily {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolFamily::Tcp => "TCP",
            ProtocolFamily::Udp => "UDP",
            ProtocolFamily::Icmp => "ICMP",
            ProtocolFamily::Forbbiden => "Forbbiden",
        }
    }
}

impl Serialize for ProtocolFamily {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

/// One parsed tcpdump record.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub timestamp: DateTime<Utc>,
    pub family: ProtocolFamily,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    /// Zero when the protocol has no ports (ICMP).
    pub source_port: u16,
    pub dest_port: u16,
    /// Payload bytes; zero when tcpdump printed no length.
    pub length: u64,
}

/// Parse one line of `tcpdump -n -tt` output.
///
/// Returns `None` for any line that does not describe a supported packet
/// (ARP, malformed lines, unknown labels). The capture stream runs unattended
/// for the whole session, so a bad line is skipped rather than surfaced.
///
/// Expected shapes:
///   1675941530.517119 IP 10.72.6.42.54440 > 10.72.6.42.8000: UDP, length 88
///   1675941503.166124 IP 10.99.245.232.443 > 10.72.6.42.58325: Flags [P.], ..., length 172
///   1675941649.798584 IP 192.168.255.10 > 101.43.175.30: ICMP echo request, id 57083, seq 8, length 64
pub fn parse_tcpdump_line(line: &str) -> Option<PacketRecord> {
    let mut fields = line.split_whitespace();

    let timestamp: f64 = fields.next()?.parse().ok()?;
    if fields.next()? != "IP" {
        return None;
    }
    let source = fields.next()?.trim_matches(':');
    if fields.next()? != ">" {
        return None;
    }
    let destination = fields.next()?.trim_matches(':');
    let label = fields.next()?.trim_matches(',');

    let family = match label {
        "UDP" => ProtocolFamily::Udp,
        // TCP lines carry flag annotations instead of a protocol name.
        "Flags" => ProtocolFamily::Tcp,
        "ICMP" => ProtocolFamily::Icmp,
        _ => return None,
    };

    let (source, source_port) = parse_endpoint(source)?;
    let (destination, dest_port) = parse_endpoint(destination)?;

    // -tt epoch seconds fit i64 nanoseconds until 2262; the cast saturates
    // on absurd values instead of wrapping.
    Some(PacketRecord {
        timestamp: DateTime::from_timestamp_nanos((timestamp * 1e9) as i64),
        family,
        source,
        destination,
        source_port,
        dest_port,
        length: parse_length(line),
    })
}

/// Parse `a.b.c.d.port` or `a.b.c.d` (ICMP has no ports, port defaults to 0).
fn parse_endpoint(token: &str) -> Option<(Ipv4Addr, u16)> {
    let parts: Vec<&str> = token.split('.').collect();
    let (octets, port) = match parts.len() {
        4 => (&parts[..4], 0u16),
        5 => (&parts[..4], parts[4].parse().ok()?),
        _ => return None,
    };

    let mut addr = [0u8; 4];
    for (slot, part) in addr.iter_mut().zip(octets) {
        *slot = part.parse().ok()?;
    }
    Some((Ipv4Addr::from(addr), port))
}

/// Extract the packet length from the last `, length N` in the line, if any.
fn parse_length(line: &str) -> u64 {
    const MARKER: &str = ", length ";
    let Some(idx) = line.rfind(MARKER) else {
        return 0;
    };
    let digits: String = line[idx + MARKER.len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

/// A validated scan request.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub iface: String,
    pub timeout: Duration,
    pub expression: String,
}

impl ScanRequest {
    pub fn new(ifaces: Option<&str>, timeout: Option<&str>, exp: Option<&str>) -> Result<Self> {
        let iface = match ifaces {
            Some(v) if !v.is_empty() => v,
            _ => bail!("no iface"),
        };
        if iface.contains(',') {
            bail!("only a single interface is supported, ifaces={iface}");
        }

        let timeout = match timeout {
            Some(v) if !v.is_empty() => parse_timeout(v)?,
            _ => bail!("no timeout"),
        };

        let expression = match exp {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => "ip".to_string(),
        };

        Ok(Self {
            iface: iface.to_string(),
            timeout,
            expression,
        })
    }
}

fn parse_timeout(raw: &str) -> Result<Duration> {
    let secs: i64 = raw
        .parse()
        .with_context(|| format!("parse timeout={raw}"))?;
    if secs <= 0 {
        bail!("invalid timeout={raw}, should >0s");
    }
    let timeout = Duration::from_secs(secs as u64);
    if timeout > MAX_SCAN_TIMEOUT {
        bail!("invalid timeout={raw}, should <=60s");
    }
    Ok(timeout)
}

/// Run one capture session: spawn tcpdump, aggregate its output until the
/// deadline, then kill the process and drain whatever is still buffered.
///
/// The session is single-writer: only this loop touches the summary. Hitting
/// the deadline is the normal way out and still returns the partial summary.
pub async fn scan(request: &ScanRequest, directory: Vec<NetworkInterface>) -> Result<CaptureSummary> {
    // -n: don't resolve names; -tt: unix timestamps with fraction.
    let args = [
        "-i",
        request.iface.as_str(),
        "-n",
        "-tt",
        "--immediate-mode",
        "-l",
        request.expression.as_str(),
    ];
    log::info!("tcpdump {}", args.join(" "));

    let child = Command::new("tcpdump")
        .args(args)
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("start tcpdump {}", args.join(" ")))?;

    let mut summary = CaptureSummary::new(directory);
    run_session(child, request.timeout, &mut summary)
        .await
        .with_context(|| format!("tcpdump {}", args.join(" ")))?;

    summary.finish();
    log::info!("scan ok, iface={}, {}", request.iface, summary.describe());
    Ok(summary)
}

/// Drive one capture process: aggregate its stdout lines until the deadline,
/// then kill it and drain whatever is still buffered. A read failure also
/// kills the process, so the session stays bounded and the partial summary is
/// still delivered.
async fn run_session(
    mut child: tokio::process::Child,
    timeout: Duration,
    summary: &mut CaptureSummary,
) -> Result<()> {
    let stdout = child.stdout.take().context("pipe capture stdout")?;
    let mut lines = BufReader::new(stdout).lines();

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut cancelled = false;

    loop {
        tokio::select! {
            _ = &mut deadline, if !cancelled => {
                log::info!("scan finished for timeout={timeout:?}, kill capture process");
                let _ = child.start_kill();
                cancelled = true;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(record) = parse_tcpdump_line(&line) {
                        summary.on_packet(&record);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("scan read failed, kill capture process: {e}");
                    let _ = child.start_kill();
                    cancelled = true;
                    break;
                }
            }
        }
    }

    // A kill above makes the process exit abnormally; only a failure before
    // the deadline is a real error.
    let status = child.wait().await.context("wait capture process")?;
    if !status.success() && !cancelled {
        bail!("capture process exited with {status}");
    }
    Ok(())
}
