// Common test utilities
#![allow(dead_code)]

use async_trait::async_trait;
use ldap_proxy::config::UserConfig;
use ldap_proxy::proto::Control;
use ldap_proxy::{
    ClientConn, ConfigUserStore, Connector, Endpoint, Entry, HandlerChain, LdapRelay, Metrics,
    RelayError, RelayResult, RelaySettings, ResultCode, SearchRequest, UpstreamConnection,
    UpstreamSearch,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BASE_DN: &str = "dc=example,dc=com";
pub const CAROL_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

/// Scripted upstream directory shared by every mock connection
#[derive(Default)]
pub struct MockDirectory {
    /// Reachable hostnames and how long a connect takes
    pub hosts: Mutex<HashMap<String, Duration>>,
    /// Bind DN to password
    pub credentials: Mutex<HashMap<String, String>>,
    pub entries: Mutex<Vec<Entry>>,
    pub search_code: Mutex<Option<ResultCode>>,
    /// Continuation references and response controls returned by every search
    pub references: Mutex<Vec<String>>,
    pub controls: Mutex<Vec<Control>>,
    pub fail_search: AtomicBool,
    pub dials: AtomicUsize,
    pub closes: AtomicUsize,
    pub binds: Mutex<Vec<(String, String)>>,
    pub searches: Mutex<Vec<SearchRequest>>,
}

impl MockDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_host(&self, hostname: &str, delay: Duration) {
        self.hosts
            .lock()
            .unwrap()
            .insert(hostname.to_string(), delay);
    }

    pub fn remove_host(&self, hostname: &str) {
        self.hosts.lock().unwrap().remove(hostname);
    }

    pub fn add_credentials(&self, dn: &str, password: &str) {
        self.credentials
            .lock()
            .unwrap()
            .insert(dn.to_string(), password.to_string());
    }

    pub fn set_entries(&self, entries: Vec<Entry>) {
        *self.entries.lock().unwrap() = entries;
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn binds(&self) -> Vec<(String, String)> {
        self.binds.lock().unwrap().clone()
    }

    pub fn searches(&self) -> Vec<SearchRequest> {
        self.searches.lock().unwrap().clone()
    }
}

pub struct MockConnector {
    pub directory: Arc<MockDirectory>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint) -> RelayResult<Box<dyn UpstreamConnection>> {
        let delay = self
            .directory
            .hosts
            .lock()
            .unwrap()
            .get(&endpoint.hostname)
            .copied();
        let delay = match delay {
            Some(delay) => delay,
            None => return Err(RelayError::dial(endpoint.address(), "connection refused")),
        };
        tokio::time::sleep(delay).await;
        self.directory.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            directory: self.directory.clone(),
        }))
    }
}

pub struct MockConnection {
    directory: Arc<MockDirectory>,
}

#[async_trait]
impl UpstreamConnection for MockConnection {
    async fn bind(&mut self, dn: &str, password: &str) -> RelayResult<()> {
        self.directory
            .binds
            .lock()
            .unwrap()
            .push((dn.to_string(), password.to_string()));
        let accepted = self
            .directory
            .credentials
            .lock()
            .unwrap()
            .get(dn)
            .is_some_and(|expected| expected == password);
        if accepted {
            Ok(())
        } else {
            Err(RelayError::Rejected {
                code: 49,
                message: "invalid credentials".to_string(),
            })
        }
    }

    async fn search(&mut self, request: &SearchRequest) -> RelayResult<UpstreamSearch> {
        self.directory
            .searches
            .lock()
            .unwrap()
            .push(request.clone());
        if self.directory.fail_search.load(Ordering::SeqCst) {
            return Err(RelayError::upstream("connection reset by peer"));
        }
        Ok(UpstreamSearch {
            entries: self.directory.entries.lock().unwrap().clone(),
            references: self.directory.references.lock().unwrap().clone(),
            referrals: vec![],
            controls: self.directory.controls.lock().unwrap().clone(),
            code: self
                .directory
                .search_code
                .lock()
                .unwrap()
                .unwrap_or(ResultCode::Success),
            message: String::new(),
        })
    }

    async fn close(&mut self) {
        self.directory.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn create_test_client(port: u16) -> ClientConn {
    ClientConn::new(
        "127.0.0.1:389".parse().unwrap(),
        format!("192.0.2.10:{}", port).parse().unwrap(),
    )
}

pub fn create_test_user(name: &str, otp_secret: Option<&str>) -> UserConfig {
    UserConfig {
        name: name.to_string(),
        upn: None,
        otp_secret: otp_secret.map(str::to_string),
    }
}

pub async fn create_test_relay(
    directory: &Arc<MockDirectory>,
    servers: &[&str],
    users: Vec<UserConfig>,
) -> RelayResult<LdapRelay> {
    let handlers = HandlerChain::new(vec![Arc::new(ConfigUserStore::new(users, vec![]))]);
    let connector = Arc::new(MockConnector {
        directory: directory.clone(),
    });
    let metrics = Arc::new(Metrics::new().unwrap());
    LdapRelay::start(
        RelaySettings::new(servers.to_vec(), BASE_DN),
        handlers,
        connector,
        metrics,
    )
    .await
}
