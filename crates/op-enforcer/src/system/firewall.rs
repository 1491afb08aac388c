//! iptables ruleset restricting DNS egress to the local sinkhole.
//!
//! Rules live in a dedicated chain jumped to from OUTPUT so apply and flush
//! never touch rules owned by anything else on the host.

use std::net::IpAddr;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use op_sinkhole::UpstreamDns;
use tokio::process::Command;
use tracing::{debug, info};

use super::Firewall;

pub const CHAIN: &str = "OPENPATH";

#[derive(Debug, Clone, Default)]
pub struct IptablesFirewall;

impl IptablesFirewall {
    pub fn new() -> Self {
        Self
    }

    async fn flush_family(&self, bin: &str) {
        // Each step may legitimately fail when the chain is already gone.
        let _ = run_iptables(bin, &["-D", "OUTPUT", "-j", CHAIN]).await;
        let _ = run_iptables(bin, &["-F", CHAIN]).await;
        let _ = run_iptables(bin, &["-X", CHAIN]).await;
    }
}

fn binary_for(ip: IpAddr) -> &'static str {
    if ip.is_ipv4() { "iptables" } else { "ip6tables" }
}

async fn run_iptables(bin: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(bin)
        .args(args)
        .output()
        .await
        .map_err(|e| anyhow!("Failed to execute {}: {}", bin, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("{} {} failed: {}", bin, args.join(" "), stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Rule arguments appended to the chain, in order.
pub fn ruleset(upstream: &UpstreamDns) -> Vec<Vec<String>> {
    let up = upstream.ip().to_string();
    let mut rules: Vec<Vec<String>> = vec![
        vec!["-o".into(), "lo".into(), "-j".into(), "ACCEPT".into()],
        vec![
            "-m".into(),
            "conntrack".into(),
            "--ctstate".into(),
            "ESTABLISHED,RELATED".into(),
            "-j".into(),
            "ACCEPT".into(),
        ],
    ];
    for proto in ["udp", "tcp"] {
        rules.push(vec![
            "-p".into(),
            proto.into(),
            "-d".into(),
            up.clone(),
            "--dport".into(),
            "53".into(),
            "-j".into(),
            "ACCEPT".into(),
        ]);
    }
    for proto in ["udp", "tcp"] {
        rules.push(vec![
            "-p".into(),
            proto.into(),
            "--dport".into(),
            "53".into(),
            "-j".into(),
            "DROP".into(),
        ]);
    }
    // DNS over TLS
    rules.push(vec![
        "-p".into(),
        "tcp".into(),
        "--dport".into(),
        "853".into(),
        "-j".into(),
        "DROP".into(),
    ]);
    rules.push(vec!["-j".into(), "RETURN".into()]);
    rules
}

#[async_trait]
impl Firewall for IptablesFirewall {
    async fn apply(&self, upstream: &UpstreamDns) -> Result<()> {
        let bin = binary_for(upstream.ip());

        if run_iptables(bin, &["-N", CHAIN]).await.is_err() {
            run_iptables(bin, &["-F", CHAIN]).await?;
        }
        for rule in ruleset(upstream) {
            let mut args: Vec<&str> = vec!["-A", CHAIN];
            args.extend(rule.iter().map(String::as_str));
            run_iptables(bin, &args).await?;
        }
        if run_iptables(bin, &["-C", "OUTPUT", "-j", CHAIN]).await.is_err() {
            run_iptables(bin, &["-I", "OUTPUT", "1", "-j", CHAIN]).await?;
        }

        info!(upstream = %upstream, "Firewall rules applied");
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.flush_family("iptables").await;
        self.flush_family("ip6tables").await;
        debug!("Firewall rules flushed");
        Ok(())
    }

    async fn is_active(&self) -> bool {
        if run_iptables("iptables", &["-C", "OUTPUT", "-j", CHAIN]).await.is_err()
            && run_iptables("ip6tables", &["-C", "OUTPUT", "-j", CHAIN]).await.is_err()
        {
            return false;
        }
        for bin in ["iptables", "ip6tables"] {
            if let Ok(listing) = run_iptables(bin, &["-S", CHAIN]).await {
                if listing.lines().any(|l| l.contains("--dport 53") && l.contains("DROP")) {
                    return true;
                }
            }
        }
        false
    }
}
