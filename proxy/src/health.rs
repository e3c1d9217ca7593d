//! Upstream health monitoring
//!
//! Probes every registry endpoint by opening and immediately closing a
//! connection, records the outcome under the relay lock and publishes the
//! snapshot. Runs on a fixed interval and whenever the session pool reports a
//! dial failure.

use crate::error::{RelayError, RelayResult};
use crate::metrics::Metrics;
use crate::registry::{Endpoint, Status};
use crate::session::SharedState;
use crate::upstream::Connector;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// Non-blocking handle used to request an out-of-band probe.
///
/// The channel holds one pending request; extra requests are dropped.
#[derive(Debug, Clone)]
pub struct HealthTrigger {
    tx: mpsc::Sender<()>,
}

impl HealthTrigger {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    pub fn request_probe(&self) {
        if self.tx.try_send(()).is_ok() {
            debug!("health probe requested");
        }
    }
}

/// Keeps the registry status and latencies current
pub struct HealthMonitor {
    state: SharedState,
    connector: Arc<dyn Connector>,
    metrics: Arc<Metrics>,
    interval: Duration,
    rx: mpsc::Receiver<()>,
}

impl HealthMonitor {
    pub fn new(
        state: SharedState,
        connector: Arc<dyn Connector>,
        metrics: Arc<Metrics>,
        interval: Duration,
        rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            state,
            connector,
            metrics,
            interval,
            rx,
        }
    }

    /// Probe every endpoint once and return how many are up.
    ///
    /// Connections are opened without holding the lock; results are written
    /// back in a single critical section.
    pub async fn probe(&self) -> RelayResult<usize> {
        let endpoints: Vec<Endpoint> = self.state.lock().await.registry.endpoints().to_vec();

        let outcomes = join_all(
            endpoints
                .iter()
                .map(|e| probe_endpoint(self.connector.as_ref(), e)),
        )
        .await;

        let healthy = {
            let mut state = self.state.lock().await;
            for (index, (status, latency)) in outcomes.into_iter().enumerate() {
                state.registry.record(index, status, latency);
            }
            self.metrics.publish_servers(&state.registry);
            debug!("{}", state.registry.stats_summary());
            state.registry.healthy_count()
        };

        if healthy == 0 {
            return Err(RelayError::NoHealthyServers);
        }
        Ok(healthy)
    }

    /// Run the startup probe, then spawn the background loop.
    ///
    /// Fails when no endpoint answers the startup probe.
    pub async fn start(self) -> RelayResult<JoinHandle<()>> {
        let healthy = self.probe().await?;
        info!("{} upstream servers healthy at startup", healthy);
        Ok(tokio::spawn(self.run()))
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately and the startup probe already ran
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("periodic health probe");
                }
                trigger = self.rx.recv() => {
                    if trigger.is_none() {
                        info!("health trigger channel closed, stopping monitor");
                        return;
                    }
                    debug!("triggered health probe");
                }
            }

            match self.probe().await {
                Ok(healthy) => debug!("{} upstream servers healthy", healthy),
                Err(RelayError::NoHealthyServers) => warn!("no healthy upstream servers"),
                Err(e) => error!(error = %e, "health probe failed"),
            }
        }
    }
}

/// Connect, measure, close. Failure means down with zero latency.
async fn probe_endpoint(connector: &dyn Connector, endpoint: &Endpoint) -> (Status, Duration) {
    let start = Instant::now();
    match connector.connect(endpoint).await {
        Ok(mut conn) => {
            let elapsed = start.elapsed().max(Duration::from_nanos(1));
            conn.close().await;
            debug!(
                hostname = %endpoint.hostname,
                port = endpoint.port,
                latency_ms = elapsed.as_secs_f64() * 1000.0,
                "probe ok"
            );
            (Status::Up, elapsed)
        }
        Err(e) => {
            warn!(hostname = %endpoint.hostname, port = endpoint.port, error = %e, "probe failed");
            (Status::Down, Duration::ZERO)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::SearchRequest;
    use crate::registry::Registry;
    use crate::session::RelayState;
    use crate::upstream::{UpstreamConnection, UpstreamSearch};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    struct ProbeConnection;

    #[async_trait]
    impl UpstreamConnection for ProbeConnection {
        async fn bind(&mut self, _dn: &str, _password: &str) -> RelayResult<()> {
            Ok(())
        }

        async fn search(&mut self, _request: &SearchRequest) -> RelayResult<UpstreamSearch> {
            Err(RelayError::upstream("not used"))
        }

        async fn close(&mut self) {}
    }

    /// Hosts in `reachable` accept connections, everything else refuses
    struct StaticConnector {
        reachable: HashSet<String>,
    }

    #[async_trait]
    impl Connector for StaticConnector {
        async fn connect(&self, endpoint: &Endpoint) -> RelayResult<Box<dyn crate::upstream::UpstreamConnection>> {
            if self.reachable.contains(&endpoint.hostname) {
                Ok(Box::new(ProbeConnection))
            } else {
                Err(RelayError::dial(endpoint.address(), "connection refused"))
            }
        }
    }

    fn monitor(urls: &[&str], reachable: &[&str]) -> (HealthMonitor, SharedState, Arc<Metrics>, HealthTrigger) {
        let registry = Registry::from_urls(urls).unwrap();
        let state = Arc::new(Mutex::new(RelayState::new(registry)));
        let connector = Arc::new(StaticConnector {
            reachable: reachable.iter().map(|h| h.to_string()).collect(),
        });
        let metrics = Arc::new(Metrics::new().unwrap());
        let (trigger, rx) = HealthTrigger::channel();
        let monitor = HealthMonitor::new(
            state.clone(),
            connector,
            metrics.clone(),
            Duration::from_secs(3600),
            rx,
        );
        (monitor, state, metrics, trigger)
    }

    #[tokio::test]
    async fn test_probe_records_status() {
        let (monitor, state, metrics, _trigger) =
            monitor(&["ldap://up.example.com", "ldap://down.example.com"], &["up.example.com"]);

        assert_eq!(monitor.probe().await.unwrap(), 1);

        let state = state.lock().await;
        let endpoints = state.registry.endpoints();
        assert_eq!(endpoints[0].status, Status::Up);
        assert!(endpoints[0].latency > Duration::ZERO);
        assert_eq!(endpoints[1].status, Status::Down);
        assert_eq!(endpoints[1].latency, Duration::ZERO);
        assert!(metrics.servers().contains("down.example.com"));
    }

    #[tokio::test]
    async fn test_start_fails_when_nothing_answers() {
        let (monitor, _state, _metrics, _trigger) = monitor(&["ldap://down.example.com"], &[]);
        assert!(matches!(monitor.start().await, Err(RelayError::NoHealthyServers)));
    }

    #[tokio::test]
    async fn test_trigger_coalesces() {
        let (trigger, mut rx) = HealthTrigger::channel();
        trigger.request_probe();
        trigger.request_probe();
        trigger.request_probe();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_loop_stops_when_triggers_dropped() {
        let (monitor, _state, _metrics, trigger) = monitor(&["ldap://up.example.com"], &["up.example.com"]);
        let handle = monitor.start().await.unwrap();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
