use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration principale chargée depuis les variables d'environnement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// URL du document whitelist (texte brut, trois sections)
    pub whitelist_url: Option<String>,
    /// Répertoire des données persistantes (état, verrou, caches)
    pub data_dir: PathBuf,
    /// Fichier de configuration dnsmasq généré
    pub dnsmasq_config_path: PathBuf,
    /// Unité systemd du résolveur local
    pub resolver_unit: String,
    /// Document de politiques Firefox (policies.json)
    pub firefox_policy_path: PathBuf,
    /// Documents de politiques gérées Chromium / Chrome
    pub chromium_policy_paths: Vec<PathBuf>,
    /// Configuration résolveur de la machine
    pub resolv_conf_path: PathBuf,
    /// Cadences des tâches périodiques
    pub reconcile_interval_secs: u64,
    pub watchdog_interval_secs: u64,
    pub captive_interval_secs: u64,
    /// Timeouts réseau
    pub fetch_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    /// Nombre d'échecs consécutifs du watchdog avant fail-open
    pub failure_threshold: u32,
    /// Délai avant re-vérification après une action de récupération
    pub recheck_delay_secs: u64,
    /// Domaine qui doit toujours résoudre
    pub health_domain: String,
    /// Domaine qui ne doit PAS résoudre tant que le sinkhole est actif
    pub sinkhole_probe_domain: String,
    /// Détection de portail captif
    pub captive_portal_url: String,
    pub captive_portal_expected: String,
    /// Dernier maillon de la chaîne de découverte du DNS amont
    pub fallback_upstream_dns: String,
    /// Logs au format JSON
    pub log_json: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            whitelist_url: None,
            data_dir: PathBuf::from("/var/lib/openpath"),
            dnsmasq_config_path: PathBuf::from("/etc/dnsmasq.d/openpath.conf"),
            resolver_unit: "dnsmasq.service".to_string(),
            firefox_policy_path: PathBuf::from("/usr/lib/firefox/distribution/policies.json"),
            chromium_policy_paths: vec![
                PathBuf::from("/etc/chromium/policies/managed/openpath.json"),
                PathBuf::from("/etc/opt/chrome/policies/managed/openpath.json"),
            ],
            resolv_conf_path: PathBuf::from("/etc/resolv.conf"),
            reconcile_interval_secs: 300,
            watchdog_interval_secs: 60,
            captive_interval_secs: 30,
            fetch_timeout_secs: 10,
            probe_timeout_secs: 5,
            failure_threshold: 3,
            recheck_delay_secs: 2,
            health_domain: "google.com".to_string(),
            sinkhole_probe_domain: "example.com".to_string(),
            captive_portal_url: "http://detectportal.firefox.com/success.txt".to_string(),
            captive_portal_expected: "success".to_string(),
            fallback_upstream_dns: "8.8.8.8".to_string(),
            log_json: false,
        }
    }
}

impl EnvConfig {
    /// Charge la configuration depuis les variables d'environnement
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("WHITELIST_URL") {
            if !v.trim().is_empty() {
                config.whitelist_url = Some(v.trim().to_string());
            }
        }
        if let Ok(v) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DNSMASQ_CONFIG_PATH") {
            config.dnsmasq_config_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RESOLVER_UNIT") {
            config.resolver_unit = v;
        }
        if let Ok(v) = std::env::var("FIREFOX_POLICY_PATH") {
            config.firefox_policy_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CHROMIUM_POLICY_PATHS") {
            config.chromium_policy_paths = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Ok(v) = std::env::var("RESOLV_CONF_PATH") {
            config.resolv_conf_path = PathBuf::from(v);
        }
        parse_into(&mut config.reconcile_interval_secs, "RECONCILE_INTERVAL_SECS");
        parse_into(&mut config.watchdog_interval_secs, "WATCHDOG_INTERVAL_SECS");
        parse_into(&mut config.captive_interval_secs, "CAPTIVE_INTERVAL_SECS");
        parse_into(&mut config.fetch_timeout_secs, "FETCH_TIMEOUT_SECS");
        parse_into(&mut config.probe_timeout_secs, "PROBE_TIMEOUT_SECS");
        parse_into(&mut config.failure_threshold, "FAILURE_THRESHOLD");
        parse_into(&mut config.recheck_delay_secs, "RECHECK_DELAY_SECS");
        if let Ok(v) = std::env::var("HEALTH_DOMAIN") {
            config.health_domain = v.to_lowercase();
        }
        if let Ok(v) = std::env::var("SINKHOLE_PROBE_DOMAIN") {
            config.sinkhole_probe_domain = v.to_lowercase();
        }
        if let Ok(v) = std::env::var("CAPTIVE_PORTAL_URL") {
            config.captive_portal_url = v;
        }
        if let Ok(v) = std::env::var("CAPTIVE_PORTAL_EXPECTED") {
            config.captive_portal_expected = v;
        }
        if let Ok(v) = std::env::var("FALLBACK_UPSTREAM_DNS") {
            config.fallback_upstream_dns = v;
        }
        if let Ok(v) = std::env::var("LOG_FORMAT") {
            config.log_json = v.eq_ignore_ascii_case("json");
        }

        config
    }

    /// Charge le fichier .env puis les variables d'environnement
    pub fn load(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            load_dotenv(path);
        } else {
            let candidates = [
                PathBuf::from("/etc/openpath/openpath.env"),
                PathBuf::from(".env"),
            ];
            for candidate in &candidates {
                if candidate.exists() {
                    load_dotenv(candidate);
                    break;
                }
            }
        }

        Self::from_env()
    }

    /// Configuration dont toutes les données vivent sous `root` (tests, bancs d'essai)
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            data_dir: root.join("data"),
            dnsmasq_config_path: root.join("dnsmasq.d/openpath.conf"),
            firefox_policy_path: root.join("firefox/policies.json"),
            chromium_policy_paths: vec![root.join("chromium/managed/openpath.json")],
            resolv_conf_path: root.join("resolv.conf"),
            recheck_delay_secs: 0,
            ..Self::default()
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("openpath.lock")
    }

    pub fn whitelist_cache_path(&self) -> PathBuf {
        self.data_dir.join("whitelist.txt")
    }

    pub fn upstream_cache_path(&self) -> PathBuf {
        self.data_dir.join("upstream-dns.conf")
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Hôte de l'URL de détection de portail captif, toujours autorisé dans le sinkhole
    pub fn captive_portal_host(&self) -> Option<String> {
        let rest = self
            .captive_portal_url
            .split_once("://")
            .map(|(_, r)| r)
            .unwrap_or(&self.captive_portal_url);
        let host = rest.split(['/', ':', '?']).next().unwrap_or("");
        if host.is_empty() {
            None
        } else {
            Some(host.to_lowercase())
        }
    }

    /// Domains the sinkhole forwards whatever the whitelist says: the captive
    /// portal host and the domain the health watchdog resolves.
    pub fn essential_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.captive_portal_host().into_iter().collect();
        if !self.health_domain.is_empty() && !domains.contains(&self.health_domain) {
            domains.push(self.health_domain.clone());
        }
        domains
    }
}

fn parse_into<T: std::str::FromStr>(slot: &mut T, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.trim().parse() {
            *slot = parsed;
        }
    }
}

/// Charge un fichier .env basique (KEY=VALUE par ligne)
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    // SAFETY: called before spawning any threads (single-threaded init)
                    unsafe { std::env::set_var(key, value) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EnvConfig::default();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.reconcile_interval_secs, 300);
        assert_eq!(config.watchdog_interval_secs, 60);
        assert!(config.whitelist_url.is_none());
        assert_eq!(config.state_path(), PathBuf::from("/var/lib/openpath/state.json"));
    }

    #[test]
    fn test_captive_portal_host() {
        let mut config = EnvConfig::default();
        assert_eq!(
            config.captive_portal_host().as_deref(),
            Some("detectportal.firefox.com")
        );

        config.captive_portal_url = "http://Connectivity-Check.example.net:8080/gen_204".into();
        assert_eq!(
            config.captive_portal_host().as_deref(),
            Some("connectivity-check.example.net")
        );
    }

    #[test]
    fn test_essential_domains() {
        let mut config = EnvConfig::default();
        assert_eq!(
            config.essential_domains(),
            vec!["detectportal.firefox.com".to_string(), "google.com".to_string()]
        );

        config.health_domain = "detectportal.firefox.com".into();
        assert_eq!(config.essential_domains(), vec!["detectportal.firefox.com".to_string()]);
    }

    #[test]
    fn test_rooted_paths() {
        let config = EnvConfig::rooted_at(Path::new("/tmp/op"));
        assert_eq!(config.lock_path(), PathBuf::from("/tmp/op/data/openpath.lock"));
        assert_eq!(config.recheck_delay_secs, 0);
    }
}
