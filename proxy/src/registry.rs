//! Upstream Backend Registry
//!
//! Parses the configured upstream URLs into endpoints and tracks their
//! reachability and round-trip latency as measured by the health monitor.

use crate::error::ConfigError;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Transport used to reach an upstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// `ldap://`
    Ldap,
    /// `ldaps://`
    Ldaps,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Ldap => 389,
            Scheme::Ldaps => 636,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Ldap => "ldap",
            Scheme::Ldaps => "ldaps",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known reachability of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Down,
    Up,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Down => write!(f, "down"),
            Status::Up => write!(f, "up"),
        }
    }
}

/// An upstream LDAP server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub hostname: String,
    pub port: u16,
    pub status: Status,
    pub latency: Duration,
}

impl Endpoint {
    /// Parse an `ldap://` or `ldaps://` URL.
    ///
    /// The port defaults to the scheme's standard port. New endpoints start
    /// down until the first probe says otherwise.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw).map_err(|e| ConfigError::invalid_url(raw, e.to_string()))?;

        let scheme = match url.scheme() {
            "ldap" => Scheme::Ldap,
            "ldaps" => Scheme::Ldaps,
            other => {
                return Err(ConfigError::invalid_url(
                    raw,
                    format!("unknown LDAP scheme: {}", other),
                ))
            }
        };

        let hostname = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::invalid_url(raw, "missing hostname"))?
            .to_string();
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Self {
            scheme,
            hostname,
            port,
            status: Status::Down,
            latency: Duration::ZERO,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.hostname, self.port)
    }

    pub fn is_up(&self) -> bool {
        self.status == Status::Up
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

#[derive(Serialize)]
struct EndpointSnapshot<'a> {
    hostname: &'a str,
    port: u16,
    scheme: Scheme,
    status: Status,
    latency_ms: f64,
}

/// The ordered set of upstream endpoints.
///
/// Order is the configuration order and never changes after startup; the
/// best-server selector relies on it for tie-breaking.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    endpoints: Vec<Endpoint>,
}

impl Registry {
    /// Parse every URL. Any bad URL fails the whole registry.
    pub fn from_urls<S: AsRef<str>>(urls: &[S]) -> Result<Self, ConfigError> {
        if urls.is_empty() {
            return Err(ConfigError::ValidationError(
                "no upstream servers configured".to_string(),
            ));
        }
        let endpoints = urls
            .iter()
            .map(|u| Endpoint::parse(u.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { endpoints })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Record a probe outcome. Down endpoints always carry zero latency.
    pub fn record(&mut self, index: usize, status: Status, latency: Duration) {
        if let Some(endpoint) = self.endpoints.get_mut(index) {
            endpoint.status = status;
            endpoint.latency = match status {
                Status::Up => latency,
                Status::Down => Duration::ZERO,
            };
        }
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.is_up()).count()
    }

    /// JSON snapshot published under the `servers` key
    pub fn snapshot_json(&self) -> String {
        let snapshot: Vec<EndpointSnapshot<'_>> = self
            .endpoints
            .iter()
            .map(|e| EndpointSnapshot {
                hostname: &e.hostname,
                port: e.port,
                scheme: e.scheme,
                status: e.status,
                latency_ms: e.latency.as_secs_f64() * 1000.0,
            })
            .collect();
        serde_json::to_string(&snapshot).unwrap_or_else(|_| "[]".to_string())
    }

    /// Human readable summary for logs
    pub fn stats_summary(&self) -> String {
        let mut summary = format!(
            "Upstream servers: {} ({} healthy)\n",
            self.endpoints.len(),
            self.healthy_count()
        );
        for endpoint in &self.endpoints {
            summary.push_str(&format!(
                "  {} status={} latency={:.3}ms\n",
                endpoint,
                endpoint.status,
                endpoint.latency.as_secs_f64() * 1000.0
            ));
        }
        summary
    }
}
