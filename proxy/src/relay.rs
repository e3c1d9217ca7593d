//! LDAP relay handler
//!
//! Authenticates binds (with an optional TOTP second factor), forwards binds
//! and searches to the pooled upstream connection of each client connection,
//! and reshapes search results to match what the client asked for.

use crate::config::LdapBackendConfig;
use crate::error::{RelayError, RelayResult};
use crate::handler::{Handler, HandlerChain};
use crate::health::{HealthMonitor, HealthTrigger, DEFAULT_HEALTH_INTERVAL};
use crate::metrics::Metrics;
use crate::otp;
use crate::proto::{ResultCode, SearchRequest, SearchResult};
use crate::registry::Registry;
use crate::reshape::reshape_entries;
use crate::session::{ClientConn, RelayState, SessionPool, SharedState};
use crate::upstream::Connector;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Attribute list asking for no attributes at all (RFC 4511 section 4.5.1.8)
const NO_ATTRIBUTES: &str = "1.1";

/// What the relay needs to know about its upstream servers
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub servers: Vec<String>,
    pub base_dn: String,
    pub name_format: String,
    pub health_interval: Duration,
}

impl RelaySettings {
    pub fn new<S: Into<String>>(servers: Vec<S>, base_dn: impl Into<String>) -> Self {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            base_dn: base_dn.into(),
            name_format: "cn".to_string(),
            health_interval: DEFAULT_HEALTH_INTERVAL,
        }
    }

    pub fn with_name_format(mut self, name_format: impl Into<String>) -> Self {
        self.name_format = name_format.into();
        self
    }
}

impl From<&LdapBackendConfig> for RelaySettings {
    fn from(config: &LdapBackendConfig) -> Self {
        Self {
            servers: config.servers.clone(),
            base_dn: config.base_dn.clone(),
            name_format: config.name_format.clone(),
            health_interval: config.health_interval(),
        }
    }
}

/// Relays client operations to the best upstream server
pub struct LdapRelay {
    base_dn: String,
    name_format: String,
    handlers: HandlerChain,
    state: SharedState,
    pool: SessionPool,
    metrics: Arc<Metrics>,
    monitor: JoinHandle<()>,
}

impl LdapRelay {
    /// Parse the upstream URLs, probe them once and start health monitoring.
    ///
    /// Fails on a bad URL or when no upstream answers the startup probe.
    pub async fn start(
        settings: RelaySettings,
        handlers: HandlerChain,
        connector: Arc<dyn Connector>,
        metrics: Arc<Metrics>,
    ) -> RelayResult<Self> {
        let registry = Registry::from_urls(settings.servers.as_slice())?;
        info!("{} upstream servers configured", registry.len());

        let state: SharedState = Arc::new(Mutex::new(RelayState::new(registry)));
        let (trigger, rx) = HealthTrigger::channel();
        let monitor = HealthMonitor::new(
            state.clone(),
            connector.clone(),
            metrics.clone(),
            settings.health_interval,
            rx,
        )
        .start()
        .await?;

        let pool = SessionPool::new(state.clone(), connector, trigger, metrics.clone());

        Ok(Self {
            base_dn: settings.base_dn,
            name_format: settings.name_format,
            handlers,
            state,
            pool,
            metrics,
            monitor,
        })
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Current registry contents
    pub async fn registry(&self) -> Registry {
        self.state.lock().await.registry.clone()
    }

    /// Stop health monitoring and close every pooled connection
    pub async fn shutdown(&self) {
        self.monitor.abort();
        self.pool.shutdown().await;
    }

    /// Username carried by a bind DN
    pub fn username(&self, bind_dn: &str) -> String {
        username_from_dn(bind_dn, &self.base_dn, &self.name_format)
    }

    /// Strip and check the second factor.
    ///
    /// Returns the password to forward upstream, or `None` when the second
    /// factor is required and invalid.
    async fn second_factor<'a>(&self, username: &str, password: &'a str) -> Option<&'a str> {
        let user = match self.handlers.find_user(username, false).await {
            Some(user) => user,
            None => {
                debug!(username = %username, "user unknown to lookup handlers, no second factor");
                return Some(password);
            }
        };

        let secret = match user.otp_secret() {
            Some(secret) => secret,
            None => return Some(password),
        };

        let (real, code) = split_otp(password)?;
        if otp::validate(code, secret) {
            Some(real)
        } else {
            None
        }
    }
}

/// Lower-case the DN, drop the base DN suffix, keep the first RDN value
pub fn username_from_dn(bind_dn: &str, base_dn: &str, name_format: &str) -> String {
    let lower = bind_dn.to_lowercase();
    let suffix = format!(",{}", base_dn.to_lowercase());
    let relative = lower.strip_suffix(suffix.as_str()).unwrap_or(lower.as_str());
    let first = relative.split(',').next().unwrap_or_default();
    let prefix = format!("{}=", name_format.to_lowercase());
    first.strip_prefix(prefix.as_str()).unwrap_or(first).to_string()
}

/// Split `password || code`; the password must be longer than the code
fn split_otp(password: &str) -> Option<(&str, &str)> {
    if password.len() <= otp::DIGITS {
        return None;
    }
    let at = password.len() - otp::DIGITS;
    if !password.is_char_boundary(at) {
        return None;
    }
    Some(password.split_at(at))
}

#[async_trait]
impl Handler for LdapRelay {
    async fn bind(&self, bind_dn: &str, password: &str, conn: &ClientConn) -> ResultCode {
        self.metrics.bind_reqs.inc();
        info!(binddn = %bind_dn, src = %conn, "Bind request");

        let username = self.username(bind_dn);
        let password = match self.second_factor(&username, password).await {
            Some(password) => password,
            None => {
                self.metrics.bind_otp_errors.inc();
                info!(binddn = %bind_dn, src = %conn, "Bind error: invalid OTP token");
                return ResultCode::InvalidCredentials;
            }
        };

        let session = match self.pool.acquire(conn).await {
            Ok(session) => session,
            Err(e) => {
                self.metrics.bind_session_errors.inc();
                warn!(binddn = %bind_dn, src = %conn, error = %e, "could not get session");
                return ResultCode::OperationsError;
            }
        };

        let result = session.upstream.lock().await.bind(bind_dn, password).await;
        match result {
            Ok(()) => {
                self.metrics.bind_successes.inc();
                info!(binddn = %bind_dn, src = %conn, "bind success");
                ResultCode::Success
            }
            Err(e) => {
                self.metrics.bind_errors.inc();
                info!(binddn = %bind_dn, src = %conn, error = %e, "invalid creds");
                if !matches!(e, RelayError::Rejected { .. }) {
                    self.pool.evict(conn).await;
                }
                ResultCode::InvalidCredentials
            }
        }
    }

    async fn search(&self, bound_dn: &str, mut request: SearchRequest, conn: &ClientConn) -> SearchResult {
        self.metrics.search_reqs.inc();
        info!(binddn = %bound_dn, src = %conn, filter = %request.filter, "Search request");

        let mut want_attributes = true;
        if request.attributes.len() == 1 && request.attributes[0] == NO_ATTRIBUTES {
            want_attributes = false;
            request.attributes.clear();
        }
        // Upstream must return values so the filter can be matched against them
        let types_only = std::mem::replace(&mut request.types_only, false);

        let session = match self.pool.acquire(conn).await {
            Ok(session) => session,
            Err(e) => {
                self.metrics.search_session_errors.inc();
                warn!(binddn = %bound_dn, src = %conn, error = %e, "could not get session");
                return SearchResult::with_code(ResultCode::OperationsError);
            }
        };

        let result = session.upstream.lock().await.search(&request).await;
        let upstream = match result {
            Ok(upstream) => upstream,
            Err(e) => {
                self.metrics.search_errors.inc();
                warn!(binddn = %bound_dn, src = %conn, error = %e, "upstream search failed");
                self.pool.evict(conn).await;
                return SearchResult::with_code(ResultCode::OperationsError);
            }
        };

        let mut entries = upstream.entries;
        reshape_entries(&mut entries, &request.filter, want_attributes, types_only);

        if upstream.code.is_success() {
            self.metrics.search_successes.inc();
            info!(filter = %request.filter, numentries = entries.len(), "Search OK");
        } else {
            self.metrics.search_errors.inc();
            info!(filter = %request.filter, code = %upstream.code, message = %upstream.message, "Search error");
        }

        SearchResult {
            entries,
            references: upstream.references,
            referrals: upstream.referrals,
            controls: upstream.controls,
            code: upstream.code,
        }
    }

    async fn close(&self, bound_dn: &str, conn: &ClientConn) {
        self.metrics.frontend_closes.inc();
        debug!(binddn = %bound_dn, src = %conn, "Close");
        self.pool.release(conn).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_from_dn() {
        let base = "dc=Example,dc=com";
        assert_eq!(username_from_dn("cn=Carol,dc=example,dc=com", base, "cn"), "carol");
        assert_eq!(
            username_from_dn("CN=alice,ou=people,DC=example,DC=com", base, "cn"),
            "alice"
        );
        assert_eq!(username_from_dn("uid=bob,dc=example,dc=com", base, "uid"), "bob");
        // Other RDN attribute: prefix kept
        assert_eq!(username_from_dn("uid=bob,dc=example,dc=com", base, "cn"), "uid=bob");
        assert_eq!(username_from_dn("carol", base, "cn"), "carol");
    }

    #[test]
    fn test_split_otp() {
        assert_eq!(split_otp("hunter2123456"), Some(("hunter2", "123456")));
        assert_eq!(split_otp("x123456"), Some(("x", "123456")));
        assert_eq!(split_otp("123456"), None);
        assert_eq!(split_otp(""), None);
        // Code boundary inside a multi-byte character
        assert_eq!(split_otp("abcdé12345"), None);
    }
}
