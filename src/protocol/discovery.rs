/// DVR auto-discovery: probe candidate /24 subnets for a command-port
/// responder. Kicks in when the configured host is unreachable at startup
/// or after repeated session failures.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Parallel TCP probe cap.
const MAX_PROBES: usize = 300;
const PROBE_TIMEOUT: Duration = Duration::from_millis(600);
/// Minimum spacing between whole-subnet scans.
pub const SCAN_COOLDOWN: Duration = Duration::from_secs(60);

/// Local IPv4 address of the default-route interface, found by opening a
/// UDP socket toward a public address. No packets are sent.
pub fn local_ip() -> Option<Ipv4Addr> {
    let sock = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    sock.connect("8.8.8.8:80").ok()?;
    match sock.local_addr().ok()?.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }
}

/// Candidate /24 prefixes: this host's own subnet first, then a small
/// hardcoded fallback list, deduplicated.
fn candidate_subnets() -> Vec<[u8; 3]> {
    let mut subnets = Vec::new();
    if let Some(ip) = local_ip() {
        let o = ip.octets();
        subnets.push([o[0], o[1], o[2]]);
    }
    for fallback in [[192u8, 168, 0], [192, 168, 1]] {
        if !subnets.contains(&fallback) {
            subnets.push(fallback);
        }
    }
    subnets
}

async fn probe(addr: SocketAddr) -> bool {
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Scan the candidate subnets for a host answering on `cmd_port`.
/// Returns the first responder. Bounded to `MAX_PROBES` concurrent
/// connection attempts.
pub async fn scan(cmd_port: u16) -> Option<Ipv4Addr> {
    let subnets = candidate_subnets();
    info!(?subnets, cmd_port, "scanning for DVR");

    let limiter = Arc::new(Semaphore::new(MAX_PROBES));
    let mut probes = tokio::task::JoinSet::new();
    for subnet in subnets {
        for host in 1u8..=254 {
            let ip = Ipv4Addr::new(subnet[0], subnet[1], subnet[2], host);
            let limiter = limiter.clone();
            probes.spawn(async move {
                let _permit = limiter.acquire().await.ok()?;
                probe(SocketAddr::new(IpAddr::V4(ip), cmd_port))
                    .await
                    .then_some(ip)
            });
        }
    }

    let mut found = None;
    while let Some(res) = probes.join_next().await {
        if let Ok(Some(ip)) = res {
            // First responder wins; drain the rest.
            found.get_or_insert(ip);
        }
    }

    match found {
        Some(ip) => {
            info!(%ip, "DVR found");
            Some(ip)
        }
        None => {
            warn!("no DVR responder found on candidate subnets");
            None
        }
    }
}

/// Quick reachability check of the currently configured host.
pub async fn reachable(host: &str, cmd_port: u16) -> bool {
    let addr = format!("{host}:{cmd_port}");
    match timeout(Duration::from_secs(3), TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(%addr, "DVR unreachable: {e}");
            false
        }
        Err(_) => {
            debug!(%addr, "DVR connect timed out");
            false
        }
    }
}
