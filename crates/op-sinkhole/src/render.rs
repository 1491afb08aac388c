use op_whitelist::Rules;
use serde_json::Value;

use crate::browser;
use crate::digest::{self, Digest};
use crate::dnsmasq;
use crate::upstream::UpstreamDns;

/// Everything a policy turns into, before anything touches disk.
#[derive(Debug, Clone)]
pub struct RenderedArtifacts {
    pub dns_config: String,
    pub firefox_policy: Value,
    pub chromium_policy: Value,
}

impl RenderedArtifacts {
    pub fn dns_digest(&self) -> Digest {
        digest::hash(self.dns_config.as_bytes())
    }

    pub fn browser_digest(&self) -> Digest {
        // serde_json maps are ordered, so serialization is canonical.
        let firefox = self.firefox_policy.to_string();
        let chromium = self.chromium_policy.to_string();
        digest::hash_parts(&[firefox.as_bytes(), chromium.as_bytes()])
    }
}

pub fn render(rules: &Rules, upstream: &UpstreamDns, essential: &[String]) -> RenderedArtifacts {
    let patterns = browser::block_patterns(rules);
    RenderedArtifacts {
        dns_config: dnsmasq::render_enforcing(rules, upstream, essential),
        firefox_policy: browser::render_firefox_fragment(&patterns),
        chromium_policy: browser::render_chromium_fragment(&patterns),
    }
}
