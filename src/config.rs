//! Server and site configuration.
//!
//! Configuration is loaded from a JSON file, deserialized with serde
//! defaults, and validated before the daemon starts; any violation is fatal
//! at construction time. Site resolution implements the `"!"` (empty host)
//! and `"*"` (catch-all) sentinel keys.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

fn default_ports() -> Vec<u16> {
    vec![80]
}

fn default_secure_ports() -> Vec<u16> {
    vec![443]
}

fn default_cache_size() -> u64 {
    4 * 1024 * 1024
}

fn default_upload_max_unit_size() -> u64 {
    1024 * 1024
}

fn default_upload_max_storage() -> u64 {
    16 * 1024 * 1024
}

/// What to do with requests arriving on plaintext endpoints while TLS is
/// active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaintextPolicy {
    /// Serve plaintext requests normally.
    #[default]
    None,
    /// Redirect to HTTPS when the client sent `Upgrade-Insecure-Requests: 1`.
    Upgrade,
    /// Always redirect to HTTPS.
    Reject,
}

/// TLS material paths. Incomplete or unreadable material downgrades the
/// daemon to plaintext-only with a diagnostic.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsMaterial {
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key (PKCS#8, RSA or SEC1).
    pub key: PathBuf,
    /// Optional CA bundle for client-certificate validation.
    #[serde(default)]
    pub ca: Option<PathBuf>,
    /// Optional key passphrase. Encrypted keys are not decrypted; see
    /// DESIGN.md.
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// One hosted site: a logical server identity bound to one or more
/// hostnames and a single category letter.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Hostnames served by this site; `hosts[0]` is the canonical host used
    /// in cache keys and hook names.
    pub hosts: Vec<String>,
    /// Category letter A-Z selecting which hook functions may serve this
    /// site.
    pub category: char,
    #[serde(default)]
    pub description: String,
}

impl SiteConfig {
    /// Canonical host: the first entry of the host list.
    pub fn canonical_host(&self) -> &str {
        &self.hosts[0]
    }

    /// Category bitmask: bit `category - 'A'`.
    pub fn category_mask(&self) -> u32 {
        1 << (self.category.to_ascii_uppercase() as u32 - 'A' as u32)
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind addresses; every address is bound on every port.
    pub addrs: Vec<IpAddr>,
    /// Plaintext HTTP ports.
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    /// HTTPS ports, used when TLS material loads.
    #[serde(default = "default_secure_ports")]
    pub secure_ports: Vec<u16>,
    /// Hostname -> site map. `"!"` matches an empty or missing Host header;
    /// `"*"` matches any otherwise-unmatched host.
    #[serde(default)]
    pub sites: HashMap<String, SiteConfig>,
    /// TLS material; absent means plaintext-only.
    #[serde(default)]
    pub secure: Option<TlsMaterial>,
    #[serde(default)]
    pub plaintext_policy: PlaintextPolicy,
    /// Response cache byte limit; zero disables the bound.
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,
    /// Maximum declared size of a single request body.
    #[serde(default = "default_upload_max_unit_size")]
    pub upload_max_unit_size: u64,
    /// Process-wide cap on concurrently buffered upload bytes.
    #[serde(default = "default_upload_max_storage")]
    pub upload_max_storage: u64,
    /// Hook module directory.
    pub basedir: PathBuf,
    /// Whether the module watcher descends into subdirectories.
    #[serde(default)]
    pub watch_recursive: bool,
    /// Wrap hook execution so raised errors become fatal descriptors
    /// instead of propagating to the dispatcher.
    #[serde(default)]
    pub safe_hooks: bool,
}

impl ServerConfig {
    /// Reads, parses, and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let config: ServerConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation; every violation is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addrs.is_empty() {
            return Err(ConfigError::NoBindAddrs);
        }
        if self.ports.is_empty() && self.secure_ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        for (host, site) in &self.sites {
            if site.hosts.is_empty() {
                return Err(ConfigError::EmptyHostList { host: host.clone() });
            }
            if site.hosts.iter().any(|h| h.is_empty()) {
                return Err(ConfigError::EmptyHostname { host: host.clone() });
            }
            if !site.category.is_ascii_uppercase() {
                return Err(ConfigError::InvalidCategory {
                    host: host.clone(),
                    found: site.category.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Resolves the site for a request's Host header.
    ///
    /// The header value is matched verbatim; a missing or empty host falls
    /// back to the `"!"` sentinel, anything else unmatched to `"*"`. `None`
    /// means the connection is destroyed without a response.
    pub fn resolve_site(&self, host: &str) -> Option<&SiteConfig> {
        if host.is_empty() {
            return self.sites.get("!").or_else(|| self.sites.get("*"));
        }
        self.sites.get(host).or_else(|| self.sites.get("*"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(hosts: &[&str], category: char) -> SiteConfig {
        SiteConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            category,
            description: String::new(),
        }
    }

    fn base_config() -> ServerConfig {
        ServerConfig {
            addrs: vec!["127.0.0.1".parse().unwrap()],
            ports: default_ports(),
            secure_ports: default_secure_ports(),
            sites: HashMap::new(),
            secure: None,
            plaintext_policy: PlaintextPolicy::default(),
            cache_size: default_cache_size(),
            upload_max_unit_size: default_upload_max_unit_size(),
            upload_max_storage: default_upload_max_storage(),
            basedir: PathBuf::from("hooks"),
            watch_recursive: false,
            safe_hooks: false,
        }
    }

    #[test]
    fn defaults_from_minimal_json() {
        let config: ServerConfig = serde_json::from_str(
            r#"{ "addrs": ["0.0.0.0"], "basedir": "hooks" }"#,
        )
        .unwrap();
        assert_eq!(config.ports, vec![80]);
        assert_eq!(config.secure_ports, vec![443]);
        assert_eq!(config.cache_size, 4 * 1024 * 1024);
        assert_eq!(config.upload_max_unit_size, 1024 * 1024);
        assert_eq!(config.upload_max_storage, 16 * 1024 * 1024);
        assert_eq!(config.plaintext_policy, PlaintextPolicy::None);
        assert!(!config.safe_hooks);
        config.validate().unwrap();
    }

    #[test]
    fn plaintext_policy_parses_lowercase() {
        let config: ServerConfig = serde_json::from_str(
            r#"{ "addrs": ["0.0.0.0"], "basedir": "hooks", "plaintext_policy": "upgrade" }"#,
        )
        .unwrap();
        assert_eq!(config.plaintext_policy, PlaintextPolicy::Upgrade);
    }

    #[test]
    fn empty_addrs_is_fatal() {
        let mut config = base_config();
        config.addrs.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoBindAddrs)));
    }

    #[test]
    fn empty_host_list_is_fatal() {
        let mut config = base_config();
        config.sites.insert("a.example".into(), site(&[], 'A'));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyHostList { .. })
        ));
    }

    #[test]
    fn category_must_be_one_uppercase_letter() {
        let mut config = base_config();
        config
            .sites
            .insert("a.example".into(), site(&["a.example"], 'q'));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCategory { .. })
        ));

        config
            .sites
            .insert("a.example".into(), site(&["a.example"], 'Q'));
        config.validate().unwrap();
    }

    #[test]
    fn category_mask_is_one_bit_per_letter() {
        assert_eq!(site(&["x"], 'A').category_mask(), 0b001);
        assert_eq!(site(&["x"], 'B').category_mask(), 0b010);
        assert_eq!(site(&["x"], 'Z').category_mask(), 1 << 25);
    }

    #[test]
    fn site_resolution_fallbacks() {
        let mut config = base_config();
        config.sites.insert("!".into(), site(&["empty.example"], 'A'));
        config.sites.insert("*".into(), site(&["any.example"], 'B'));
        config
            .sites
            .insert("www.example".into(), site(&["www.example"], 'C'));

        assert_eq!(
            config.resolve_site("").unwrap().canonical_host(),
            "empty.example"
        );
        assert_eq!(
            config.resolve_site("x.example").unwrap().canonical_host(),
            "any.example"
        );
        assert_eq!(
            config.resolve_site("www.example").unwrap().canonical_host(),
            "www.example"
        );

        config.sites.remove("*");
        assert!(config.resolve_site("x.example").is_none());
        assert!(config.resolve_site("").is_some(), "\"!\" still matches");

        config.sites.remove("!");
        assert!(config.resolve_site("").is_none());
    }
}
