//! dnsmasq configuration rendering.
//!
//! dnsmasq matches `server=`/`address=` rules by longest domain, but the
//! catch-all `address=/#/` must still come first in the file for resolvers
//! that evaluate top-down. The renderer is the only place that orders rules.

use op_whitelist::Rules;

use crate::upstream::UpstreamDns;

/// Catch-all rule answering NXDOMAIN for every name not matched elsewhere.
pub const DENY_ALL: &str = "address=/#/";

const HEADER: &str = "# Generated by openpath. Do not edit: rewritten on every policy change.\n";

fn push_common(out: &mut String) {
    out.push_str(HEADER);
    out.push_str("no-resolv\n");
    out.push_str("no-poll\n");
    out.push_str("listen-address=127.0.0.1\n");
    out.push_str("bind-interfaces\n");
    out.push_str("cache-size=1000\n");
}

/// Enforcing configuration: deny-all, then one forward rule per allowed domain,
/// then explicit NXDOMAIN for blocked subdomains.
///
/// `essential` domains (captive portal detection) are allowed whatever the policy says.
pub fn render_enforcing(rules: &Rules, upstream: &UpstreamDns, essential: &[String]) -> String {
    let mut allowed: Vec<&str> = rules
        .domains
        .iter()
        .chain(essential.iter())
        .map(String::as_str)
        .collect();
    allowed.sort_unstable();
    allowed.dedup();

    let mut out = String::with_capacity(256 + allowed.len() * 48);
    push_common(&mut out);

    out.push_str("\n# Deny everything not listed below\n");
    out.push_str(DENY_ALL);
    out.push('\n');

    out.push_str("\n# Allowed domains (subdomains included)\n");
    for domain in allowed {
        out.push_str(&format!("server=/{}/{}\n", domain, upstream));
    }

    let blocked = rules.sorted_blocked_subdomains();
    if !blocked.is_empty() {
        out.push_str("\n# Blocked subdomains of allowed domains\n");
        for domain in blocked {
            out.push_str(&format!("address=/{}/\n", domain));
        }
    }

    out
}

/// Fail-open configuration: plain forwarding of everything to the upstream.
pub fn render_passthrough(upstream: &UpstreamDns) -> String {
    let mut out = String::with_capacity(256);
    push_common(&mut out);
    out.push_str("\n# Enforcement disabled: forward everything\n");
    out.push_str(&format!("server={}\n", upstream));
    out
}

/// True when the deny-all rule is present and precedes every allow rule.
pub fn verify_deny_all_first(config: &str) -> bool {
    let mut seen_deny_all = false;
    for line in config.lines().map(str::trim) {
        if line == DENY_ALL {
            seen_deny_all = true;
        } else if line.starts_with("server=/") && !seen_deny_all {
            return false;
        }
    }
    seen_deny_all
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn upstream() -> UpstreamDns {
        UpstreamDns::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)))
    }

    fn rules(doc: &str) -> Rules {
        op_whitelist::parse(doc).unwrap().rules().unwrap().clone()
    }

    #[test]
    fn test_deny_all_before_allow_rules() {
        let config = render_enforcing(
            &rules("zeta.org\nalpha.com\ngoogle.com\n"),
            &upstream(),
            &[],
        );
        let deny = config.find(DENY_ALL).unwrap();
        for (idx, _) in config.match_indices("server=/") {
            assert!(deny < idx);
        }
        assert!(verify_deny_all_first(&config));
        assert!(config.contains("server=/google.com/9.9.9.9\n"));
    }

    #[test]
    fn test_blocked_subdomains_rendered() {
        let config = render_enforcing(
            &rules("google.com\n## BLOCKED-SUBDOMAINS\nads.google.com\n"),
            &upstream(),
            &[],
        );
        assert!(config.contains("address=/ads.google.com/\n"));
    }

    #[test]
    fn test_essential_domains_merged() {
        let essential = vec!["detectportal.firefox.com".to_string(), "google.com".to_string()];
        let config = render_enforcing(&rules("google.com\n"), &upstream(), &essential);
        assert!(config.contains("server=/detectportal.firefox.com/9.9.9.9\n"));
        assert_eq!(config.matches("server=/google.com/").count(), 1);
    }

    #[test]
    fn test_passthrough_has_no_deny_all() {
        let config = render_passthrough(&upstream());
        assert!(!config.contains(DENY_ALL));
        assert!(config.contains("server=9.9.9.9\n"));
        assert!(!verify_deny_all_first(&config));
    }

    #[test]
    fn test_verify_detects_misordering() {
        let bad = "server=/google.com/8.8.8.8\naddress=/#/\n";
        assert!(!verify_deny_all_first(bad));
        assert!(!verify_deny_all_first("server=/google.com/8.8.8.8\n"));
        assert!(verify_deny_all_first("address=/#/\nserver=/google.com/8.8.8.8\n"));
    }
}
