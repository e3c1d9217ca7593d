//! Session pool
//!
//! One pooled upstream connection per client connection. The pool and the
//! upstream registry share a single lock owned by the relay instance; the lock
//! is only held for map and vector access, never across network I/O.

use crate::error::RelayResult;
use crate::health::HealthTrigger;
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::selection::best_server;
use crate::upstream::{Connector, UpstreamConnection};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Addresses identifying one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientConn {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

impl ClientConn {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            remote_addr,
        }
    }

    /// Deterministic fingerprint of the local+remote address pair
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.local_addr.to_string().as_bytes());
        hasher.update(self.remote_addr.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.remote_addr)
    }
}

pub type SharedUpstream = Arc<Mutex<Box<dyn UpstreamConnection>>>;

/// A client connection paired with its pooled upstream connection
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub client: ClientConn,
    pub upstream: SharedUpstream,
    /// Upstream the connection was opened against
    pub server: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("server", &self.server)
            .finish()
    }
}

/// Everything guarded by the relay lock
#[derive(Default)]
pub struct RelayState {
    pub registry: Registry,
    pub sessions: HashMap<String, Session>,
}

impl RelayState {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            sessions: HashMap::new(),
        }
    }
}

pub type SharedState = Arc<Mutex<RelayState>>;

/// Lazily opens and caches upstream connections per client connection
#[derive(Clone)]
pub struct SessionPool {
    state: SharedState,
    connector: Arc<dyn Connector>,
    trigger: HealthTrigger,
    metrics: Arc<Metrics>,
}

impl SessionPool {
    pub fn new(
        state: SharedState,
        connector: Arc<dyn Connector>,
        trigger: HealthTrigger,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state,
            connector,
            trigger,
            metrics,
        }
    }

    /// Return the session for `client`, opening an upstream connection if needed.
    ///
    /// Dial failures wake the health monitor and are returned as-is; the next
    /// request from the client gets a fresh attempt.
    pub async fn acquire(&self, client: &ClientConn) -> RelayResult<Session> {
        let id = client.id();

        let server = {
            let state = self.state.lock().await;
            if let Some(session) = state.sessions.get(&id) {
                return Ok(session.clone());
            }
            best_server(state.registry.endpoints())?
        };

        let upstream = match self.connector.connect(&server).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(server = %server, src = %client, error = %e, "upstream dial failed");
                self.metrics.upstream_dial_errors.inc();
                self.trigger.request_probe();
                return Err(e);
            }
        };
        self.metrics.upstream_connections_created.inc();

        let session = Session {
            id: id.clone(),
            client: *client,
            upstream: Arc::new(Mutex::new(upstream)),
            server: server.url(),
        };

        let (session, redundant) = {
            let mut state = self.state.lock().await;
            match state.sessions.get(&id) {
                Some(existing) => (existing.clone(), Some(session)),
                None => {
                    state.sessions.insert(id, session.clone());
                    (session, None)
                }
            }
        };

        match redundant {
            Some(extra) => {
                debug!(src = %client, "session raced, closing redundant upstream connection");
                extra.upstream.lock().await.close().await;
            }
            None => {
                self.metrics.sessions_active.inc();
                info!(src = %client, server = %session.server, "opened upstream session");
            }
        }

        Ok(session)
    }

    /// Close and forget the session for `client`. No-op if there is none.
    pub async fn release(&self, client: &ClientConn) {
        let id = client.id();
        let removed = self.state.lock().await.sessions.remove(&id);
        if let Some(session) = removed {
            self.close_session(session).await;
        }
    }

    /// Drop a session whose upstream connection failed mid-request
    pub async fn evict(&self, client: &ClientConn) {
        let id = client.id();
        let removed = self.state.lock().await.sessions.remove(&id);
        if let Some(session) = removed {
            warn!(src = %client, server = %session.server, "evicting broken upstream session");
            self.close_session(session).await;
            self.trigger.request_probe();
        }
    }

    /// Close every pooled connection
    pub async fn shutdown(&self) {
        let sessions: Vec<Session> = {
            let mut state = self.state.lock().await;
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        info!("closing {} upstream sessions", sessions.len());
        for session in sessions {
            self.close_session(session).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn close_session(&self, session: Session) {
        session.upstream.lock().await.close().await;
        self.metrics.backend_closes.inc();
        self.metrics.sessions_active.dec();
        debug!(src = %session.client, server = %session.server, "closed upstream session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::health::HealthTrigger;
    use crate::proto::SearchRequest;
    use crate::registry::{Endpoint, Status};
    use crate::upstream::UpstreamSearch;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NullConnection {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl UpstreamConnection for NullConnection {
        async fn bind(&mut self, _dn: &str, _password: &str) -> RelayResult<()> {
            Ok(())
        }

        async fn search(&mut self, _request: &SearchRequest) -> RelayResult<UpstreamSearch> {
            Err(RelayError::upstream("not used"))
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingConnector {
        dials: AtomicUsize,
        closed: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, endpoint: &Endpoint) -> RelayResult<Box<dyn UpstreamConnection>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RelayError::dial(endpoint.address(), "connection refused"));
            }
            Ok(Box::new(NullConnection {
                closed: self.closed.clone(),
            }))
        }
    }

    fn client(port: u16) -> ClientConn {
        ClientConn::new(
            "127.0.0.1:389".parse().unwrap(),
            format!("10.0.0.1:{}", port).parse().unwrap(),
        )
    }

    fn healthy_state() -> SharedState {
        let mut registry = Registry::from_urls(&["ldap://ldap1.example.com"]).unwrap();
        registry.record(0, Status::Up, Duration::from_millis(3));
        Arc::new(Mutex::new(RelayState::new(registry)))
    }

    fn pool(state: SharedState, connector: Arc<CountingConnector>) -> (SessionPool, HealthTrigger, tokio::sync::mpsc::Receiver<()>) {
        let (trigger, rx) = HealthTrigger::channel();
        let metrics = Arc::new(Metrics::new().unwrap());
        (SessionPool::new(state, connector, trigger.clone(), metrics), trigger, rx)
    }

    fn connector(fail: bool) -> Arc<CountingConnector> {
        Arc::new(CountingConnector {
            dials: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            fail,
        })
    }

    #[test]
    fn test_client_id_is_deterministic() {
        let a = client(50000);
        let b = client(50000);
        let c = client(50001);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().len(), 64);
    }

    #[tokio::test]
    async fn test_acquire_reuses_session() {
        let connector = connector(false);
        let (pool, _trigger, _rx) = pool(healthy_state(), connector.clone());

        let first = pool.acquire(&client(50000)).await.unwrap();
        let second = pool.acquire(&client(50000)).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(Arc::ptr_eq(&first.upstream, &second.upstream));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_sessions_are_per_connection() {
        let connector = connector(false);
        let (pool, _trigger, _rx) = pool(healthy_state(), connector.clone());

        let a = pool.acquire(&client(50000)).await.unwrap();
        let b = pool.acquire(&client(50001)).await.unwrap();

        assert!(!Arc::ptr_eq(&a.upstream, &b.upstream));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_healthy_servers_does_not_dial() {
        let registry = Registry::from_urls(&["ldap://ldap1.example.com"]).unwrap();
        let state = Arc::new(Mutex::new(RelayState::new(registry)));
        let connector = connector(false);
        let (pool, _trigger, _rx) = pool(state, connector.clone());

        let result = pool.acquire(&client(50000)).await;
        assert!(matches!(result, Err(RelayError::NoHealthyServers)));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_triggers_probe_once() {
        let connector = connector(true);
        let (pool, _trigger, mut rx) = pool(healthy_state(), connector.clone());

        assert!(matches!(
            pool.acquire(&client(50000)).await,
            Err(RelayError::Dial { .. })
        ));
        assert!(pool.acquire(&client(50000)).await.is_err());

        // Two failures, one pending trigger
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_release_closes_and_is_idempotent() {
        let connector = connector(false);
        let (pool, _trigger, _rx) = pool(healthy_state(), connector.clone());

        pool.acquire(&client(50000)).await.unwrap();
        pool.release(&client(50000)).await;
        pool.release(&client(50000)).await;

        assert!(pool.is_empty().await);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);

        // A new request dials again
        pool.acquire(&client(50000)).await.unwrap();
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let connector = connector(false);
        let (pool, _trigger, _rx) = pool(healthy_state(), connector.clone());

        for port in 50000..50004 {
            pool.acquire(&client(port)).await.unwrap();
        }
        pool.shutdown().await;

        assert!(pool.is_empty().await);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 4);
    }
}
