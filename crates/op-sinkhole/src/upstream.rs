//! Upstream resolver discovery.
//!
//! Discovered once and persisted. The chain is: cached value, NetworkManager,
//! system resolver config, default gateway, public fallback. Every candidate
//! must answer a live query before it is accepted.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use op_common::fs::{read_optional, write_atomic};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::probe;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolver that enforcement forwards allowed lookups to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpstreamDns(IpAddr);

impl UpstreamDns {
    pub fn new(ip: IpAddr) -> Self {
        Self(ip)
    }

    pub fn ip(&self) -> IpAddr {
        self.0
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.0, 53)
    }
}

impl std::fmt::Display for UpstreamDns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a discovered upstream came from, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamSource {
    Cache,
    NetworkManager,
    ResolvConf,
    Gateway,
    Fallback,
}

pub struct UpstreamDiscovery<'a> {
    pub cache_path: &'a Path,
    pub resolv_conf_paths: &'a [&'a Path],
    pub validation_domain: &'a str,
    pub probe_timeout: Duration,
    pub fallback: IpAddr,
}

impl UpstreamDiscovery<'_> {
    /// Walk the chain, persist the winner and return it.
    pub async fn discover(&self) -> (UpstreamDns, UpstreamSource) {
        if let Some(cached) = load_cached(self.cache_path) {
            if self.validate(cached).await {
                debug!(upstream = %cached, "Using cached upstream DNS");
                return (UpstreamDns(cached), UpstreamSource::Cache);
            }
            warn!(upstream = %cached, "Cached upstream DNS failed validation, rediscovering");
        }

        let mut candidates: Vec<(IpAddr, UpstreamSource)> = Vec::new();
        if let Some(out) = run("nmcli", &["-t", "-f", "IP4.DNS,IP6.DNS", "dev", "show"]).await {
            candidates.extend(
                parse_nmcli_dns(&out)
                    .into_iter()
                    .map(|ip| (ip, UpstreamSource::NetworkManager)),
            );
        }
        for path in self.resolv_conf_paths {
            if let Ok(Some(content)) = read_optional(path) {
                candidates.extend(
                    parse_resolv_conf(&content)
                        .into_iter()
                        .map(|ip| (ip, UpstreamSource::ResolvConf)),
                );
            }
        }
        if let Some(out) = run("ip", &["route", "show", "default"]).await {
            if let Some(gw) = parse_default_route(&out) {
                candidates.push((gw, UpstreamSource::Gateway));
            }
        }

        let mut tried = Vec::new();
        for (ip, source) in candidates {
            if tried.contains(&ip) {
                continue;
            }
            tried.push(ip);
            if self.validate(ip).await {
                info!(upstream = %ip, ?source, "Upstream DNS discovered");
                self.persist(ip);
                return (UpstreamDns(ip), source);
            }
            debug!(upstream = %ip, ?source, "Upstream candidate did not answer");
        }

        warn!(upstream = %self.fallback, "No local upstream answered, using public fallback");
        self.persist(self.fallback);
        (UpstreamDns(self.fallback), UpstreamSource::Fallback)
    }

    async fn validate(&self, ip: IpAddr) -> bool {
        let server = SocketAddr::new(ip, 53);
        matches!(
            probe::query(server, self.validation_domain, self.probe_timeout).await,
            Ok(answer) if answer.resolved()
        )
    }

    fn persist(&self, ip: IpAddr) {
        if let Err(e) = write_atomic(self.cache_path, format!("{ip}\n").as_bytes()) {
            warn!(path = %self.cache_path.display(), "Cannot persist upstream DNS: {}", e);
        }
    }
}

/// Persisted upstream, without validation.
pub fn load_cached(path: &Path) -> Option<IpAddr> {
    read_optional(path).ok()??.trim().parse().ok()
}

async fn run(cmd: &str, args: &[&str]) -> Option<String> {
    let output = timeout(
        COMMAND_TIMEOUT,
        Command::new(cmd)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output(),
    )
    .await;

    match output {
        Ok(Ok(out)) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).to_string()),
        _ => None,
    }
}

fn usable(ip: &IpAddr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}

/// `IP4.DNS[1]:192.168.1.1` lines from `nmcli -t`.
pub fn parse_nmcli_dns(output: &str) -> Vec<IpAddr> {
    output
        .lines()
        .filter(|l| l.starts_with("IP4.DNS") || l.starts_with("IP6.DNS"))
        .filter_map(|l| l.split_once(':'))
        .filter_map(|(_, v)| v.trim().parse::<IpAddr>().ok())
        .filter(usable)
        .collect()
}

/// `nameserver` entries that are not the local sinkhole itself.
pub fn parse_resolv_conf(content: &str) -> Vec<IpAddr> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#') && !l.starts_with(';'))
        .filter_map(|l| l.strip_prefix("nameserver"))
        .filter_map(|v| {
            // Drop IPv6 zone suffixes (fe80::1%eth0)
            let v = v.trim();
            let v = v.split('%').next().unwrap_or(v);
            v.parse::<IpAddr>().ok()
        })
        .filter(usable)
        .collect()
}

/// Gateway from `ip route show default`: `default via 192.168.1.1 dev eth0 ...`
pub fn parse_default_route(output: &str) -> Option<IpAddr> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        while let Some(word) = parts.next() {
            if word == "via" {
                return parts.next().and_then(|v| v.parse().ok());
            }
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    #[test]
    fn test_parse_nmcli() {
        let out = "IP4.DNS[1]:192.168.1.1\nIP4.DNS[2]:127.0.0.53\nIP6.DNS[1]:2001:db8::1\nGENERAL.DEVICE:eth0\n";
        let ips = parse_nmcli_dns(out);
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0], IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(ips[1], "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_resolv_conf() {
        let content = "# managed\nnameserver 127.0.0.1\nnameserver 10.0.0.2\n; old\nnameserver fe80::1%eth0\nsearch lan\n";
        let ips = parse_resolv_conf(content);
        assert_eq!(ips, vec![
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            "fe80::1".parse::<IpAddr>().unwrap(),
        ]);
    }

    #[test]
    fn test_parse_default_route() {
        let out = "default via 192.168.0.254 dev wlp2s0 proto dhcp metric 600\n";
        assert_eq!(
            parse_default_route(out),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 254)))
        );
        assert_eq!(parse_default_route("default dev tun0 scope link\n"), None);
    }

    #[test]
    fn test_load_cached() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("upstream-dns.conf");
        assert!(load_cached(&path).is_none());
        std::fs::write(&path, "1.1.1.1\n").unwrap();
        assert_eq!(load_cached(&path), Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))));
    }

    #[test]
    fn test_display() {
        let up = UpstreamDns::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(up.to_string(), "8.8.8.8");
        assert_eq!(up.socket_addr().port(), 53);
    }
}
