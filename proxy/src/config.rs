//! Configuration management for LDAP-Proxy
//!
//! Loaded from a TOML file. The first `[[backends]]` entry must be the `ldap`
//! datastore that relays to upstream servers; later entries only contribute
//! user lookups.

use crate::error::ConfigError;
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub frontend: FrontendConfig,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client-facing listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// A backend datastore
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "datastore", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Relay to upstream LDAP servers
    Ldap(LdapBackendConfig),
    /// Users and groups from this file
    Config {},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapBackendConfig {
    /// Upstream URLs, `ldap://` or `ldaps://`, in preference order for ties
    pub servers: Vec<String>,
    pub base_dn: String,
    /// RDN attribute carrying the username in bind DNs
    #[serde(default = "default_name_format")]
    pub name_format: String,
    /// Skip certificate verification for `ldaps://` upstreams
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    /// Bound on upstream connection establishment, unbounded when unset
    #[serde(default)]
    pub dial_timeout_ms: Option<u64>,
}

impl LdapBackendConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn dial_timeout(&self) -> Option<Duration> {
        self.dial_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub upn: Option<String>,
    /// Base32 TOTP secret
    #[serde(default)]
    pub otp_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub gid: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace); `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:389".to_string()
}

fn default_name_format() -> String {
    "cn".to_string()
}

fn default_health_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse and validate TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The relaying backend; `validate` guarantees it is the first entry
    pub fn ldap_backend(&self) -> Option<&LdapBackendConfig> {
        match self.backends.first() {
            Some(BackendConfig::Ldap(ldap)) => Some(ldap),
            _ => None,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.frontend
            .listen
            .parse::<SocketAddr>()
            .map_err(|_| {
                ConfigError::ValidationError(format!(
                    "Invalid listen address: {}",
                    self.frontend.listen
                ))
            })?;

        let ldap = match self.backends.first() {
            Some(BackendConfig::Ldap(ldap)) => ldap,
            Some(_) => {
                return Err(ConfigError::ValidationError(
                    "the first backend must use datastore = \"ldap\"".to_string(),
                ))
            }
            None => {
                return Err(ConfigError::ValidationError(
                    "at least one backend is required".to_string(),
                ))
            }
        };

        if self.backends[1..]
            .iter()
            .any(|b| matches!(b, BackendConfig::Ldap(_)))
        {
            return Err(ConfigError::ValidationError(
                "only one ldap backend is supported".to_string(),
            ));
        }

        // Any bad URL is fatal
        Registry::from_urls(ldap.servers.as_slice())?;

        if ldap.base_dn.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "base_dn cannot be empty".to_string(),
            ));
        }
        if ldap.name_format.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "name_format cannot be empty".to_string(),
            ));
        }
        if ldap.health_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "health_interval_secs must be greater than 0".to_string(),
            ));
        }
        if ldap.dial_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "dial_timeout_ms must be greater than 0".to_string(),
            ));
        }

        for user in &self.users {
            if user.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "user name cannot be empty".to_string(),
                ));
            }
            if let Some(secret) = user.otp_secret.as_deref().filter(|s| !s.is_empty()) {
                if crate::otp::decode_secret(secret).is_none() {
                    return Err(ConfigError::ValidationError(format!(
                        "otp_secret of user {} is not valid base32",
                        user.name
                    )));
                }
            }
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
[frontend]
listen = "127.0.0.1:3389"

[[backends]]
datastore = "ldap"
servers = ["ldap://ldap1.example.com", "ldaps://ldap2.example.com:3269"]
base_dn = "dc=example,dc=com"
insecure = true
dial_timeout_ms = 1500

[[backends]]
datastore = "config"

[[users]]
name = "carol"
otp_secret = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ"

[[groups]]
name = "admins"
gid = 5501

[logging]
level = "debug"
"#;

    #[test]
    fn test_parse_example() {
        let config = Config::parse(EXAMPLE).unwrap();
        assert_eq!(config.frontend.listen, "127.0.0.1:3389");
        assert_eq!(config.backends.len(), 2);

        let ldap = config.ldap_backend().unwrap();
        assert_eq!(ldap.servers.len(), 2);
        assert_eq!(ldap.name_format, "cn");
        assert!(ldap.insecure);
        assert_eq!(ldap.health_interval(), Duration::from_secs(60));
        assert_eq!(ldap.dial_timeout(), Some(Duration::from_millis(1500)));
        assert!(matches!(config.backends[1], BackendConfig::Config {}));
        assert_eq!(config.users[0].name, "carol");
        assert_eq!(config.groups[0].gid, 5501);
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse(
            r#"
[[backends]]
datastore = "ldap"
servers = ["ldap://ldap1.example.com"]
base_dn = "dc=example,dc=com"
"#,
        )
        .unwrap();
        assert_eq!(config.frontend.listen, "0.0.0.0:389");
        assert_eq!(config.logging.level, "info");
        assert!(config.users.is_empty());
        assert_eq!(config.ldap_backend().unwrap().dial_timeout(), None);
    }

    #[test]
    fn test_first_backend_must_be_ldap() {
        let err = Config::parse(
            r#"
[[backends]]
datastore = "config"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("first backend"));
    }

    #[test]
    fn test_bad_server_url_is_rejected() {
        let err = Config::parse(
            r#"
[[backends]]
datastore = "ldap"
servers = ["ldap://good.example.com", "http://bad.example.com"]
base_dn = "dc=example,dc=com"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn test_unknown_datastore_is_parse_error() {
        let err = Config::parse(
            r#"
[[backends]]
datastore = "s3"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_invalid_otp_secret() {
        let mut config = Config::parse(EXAMPLE).unwrap();
        config.users[0].otp_secret = Some("not base32!".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load_from_file("/nonexistent/ldap-proxy.toml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
