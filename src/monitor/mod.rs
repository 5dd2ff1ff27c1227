/// Cluster monitor: probes every backend, elects the active one, publishes changes
pub mod arp;
pub mod counters;
pub mod state;

pub use arp::{ArpManager, CmdOutput, CmdRunner, ExecCmdRunner, PrivilegedArpManager};
pub use counters::DecisionCounters;
pub use state::{HealthState, HealthStateMachine, Transition};

use crate::config::ActiveSelection;
use crate::core::{Backend, BackendsRepository};
use crate::health::{HealthStatus, ProbeOutcome, StatusFetcher};
use crate::utils::{format_duration, resolve_host_ip};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DIAL: &str = "dial";
const LOG: &str = "log";
const CLEAR_ARP: &str = "clearArp";
const CONSECUTIVE_UNHEALTHY: &str = "consecutiveUnhealthyChecks";

/// Probe log lines are emitted once every this many probes per backend
const LOG_FREQUENCY: u64 = 5;

/// Monitor-local view of one backend, rebuilt each time monitoring starts
#[derive(Debug)]
pub struct BackendStatus {
    pub index: u64,
    pub healthy: bool,
    counters: DecisionCounters,
    machine: HealthStateMachine,
}

impl BackendStatus {
    pub fn new(index: u64, healthy: bool) -> Self {
        Self {
            index,
            healthy,
            counters: DecisionCounters::new(),
            machine: HealthStateMachine::new(),
        }
    }

    fn with_counters(index: u64, arp_enabled: bool, clear_threshold: u64) -> Self {
        let mut counters = DecisionCounters::new();

        counters.add_condition(LOG, |c| c.get_count(DIAL) % LOG_FREQUENCY == 0);
        counters.add_condition(CLEAR_ARP, move |c| {
            let checks = c.get_count(CONSECUTIVE_UNHEALTHY);
            arp_enabled && checks > 0 && checks % clear_threshold == 0
        });

        Self {
            counters,
            ..Self::new(index, false)
        }
    }

    pub fn state(&self) -> HealthState {
        self.machine.state()
    }
}

/// Pick the active backend among healthy ones by ordinal index.
///
/// Equal indices are broken by the lowest backend name so the result never
/// depends on iteration order.
pub fn choose_active_backend<'a, I>(entries: I, selection: ActiveSelection) -> Option<Arc<Backend>>
where
    I: IntoIterator<Item = (&'a Arc<Backend>, &'a BackendStatus)>,
{
    entries
        .into_iter()
        .filter(|(_, status)| status.healthy)
        .min_by(|(a, a_status), (b, b_status)| {
            let by_index = match selection {
                ActiveSelection::LowestIndex => a_status.index.cmp(&b_status.index),
                ActiveSelection::HighestIndex => b_status.index.cmp(&a_status.index),
            };
            by_index.then_with(|| a.name().cmp(b.name()))
        })
        .map(|(backend, _)| Arc::clone(backend))
}

fn same_backend(a: &Option<Arc<Backend>>, b: &Option<Arc<Backend>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Periodic health monitor for the whole cluster
pub struct ClusterMonitor {
    repository: Arc<BackendsRepository>,
    healthcheck_timeout: Duration,
    selection: ActiveSelection,
    fetcher: Arc<dyn StatusFetcher>,
    arp_manager: Option<Arc<dyn ArpManager>>,
    clear_arp_threshold: u64,
    subscribers: Vec<mpsc::Sender<Option<Arc<Backend>>>>,
}

impl ClusterMonitor {
    pub fn new(
        repository: Arc<BackendsRepository>,
        healthcheck_timeout: Duration,
        selection: ActiveSelection,
        fetcher: Arc<dyn StatusFetcher>,
    ) -> Self {
        Self {
            repository,
            healthcheck_timeout,
            selection,
            fetcher,
            arp_manager: None,
            clear_arp_threshold: 5,
            subscribers: Vec::new(),
        }
    }

    /// Clear a failing backend's ARP entry every `threshold` consecutive failed probes
    pub fn with_arp_manager(mut self, manager: Arc<dyn ArpManager>, threshold: u64) -> Self {
        self.arp_manager = Some(manager);
        self.clear_arp_threshold = threshold.max(1);
        self
    }

    /// Subscribe to active backend changes. Sends are awaited in registration
    /// order, so a subscriber that stops draining stalls the monitor.
    pub fn register_backend_subscriber(&mut self, subscriber: mpsc::Sender<Option<Arc<Backend>>>) {
        self.subscribers.push(subscriber);
    }

    pub fn tick_period(&self) -> Duration {
        self.healthcheck_timeout / 5
    }

    /// Start monitoring in a background task until `stop` turns true or its sender is dropped.
    /// A tick already in progress finishes before the task exits.
    pub fn monitor(self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut statuses = self.setup_statuses().await;
            let mut active: Option<Arc<Backend>> = None;
            let period = self.tick_period();

            info!(
                backends = statuses.len(),
                "Monitoring cluster every {}",
                format_duration(period)
            );

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => {
                        break;
                    }
                }

                self.check_all_backends(&mut statuses).await;

                let next = choose_active_backend(
                    statuses.iter().map(|(backend, status)| (backend, status)),
                    self.selection,
                );

                // Probes only record health; the active slot changes here, once per tick
                self.repository.set_active(next.clone()).await;

                if !same_backend(&active, &next) {
                    self.publish(&next).await;
                    active = next;
                }
            }

            info!("Cluster monitor stopped");
        })
    }

    async fn setup_statuses(&self) -> Vec<(Arc<Backend>, BackendStatus)> {
        let arp_enabled = self.arp_manager.is_some();
        let mut backends = self.repository.all().await;
        let mut statuses = Vec::new();

        while let Some(backend) = backends.recv().await {
            let status = BackendStatus::with_counters(
                statuses.len() as u64,
                arp_enabled,
                self.clear_arp_threshold,
            );
            statuses.push((backend, status));
        }
        statuses
    }

    /// Probe every backend concurrently and wait for all of them
    async fn check_all_backends(&self, statuses: &mut [(Arc<Backend>, BackendStatus)]) {
        let checks = statuses
            .iter_mut()
            .map(|(backend, status)| self.query_backend_health(backend, status));

        futures::future::join_all(checks).await;
    }

    async fn query_backend_health(&self, backend: &Arc<Backend>, status: &mut BackendStatus) {
        status.counters.increment_count(DIAL);
        let should_log = status.counters.should(LOG);

        let url = backend.healthcheck_url();
        let outcome = ProbeOutcome::from_fetch(self.fetcher.fetch(&url).await);

        if let Some(index) = outcome.index {
            status.index = index;
            backend.set_index(index).await;
        }

        let healthy = outcome.status.is_healthy();
        status.healthy = healthy;

        if healthy {
            status.counters.reset_count(CONSECUTIVE_UNHEALTHY);
        } else {
            status.counters.increment_count(CONSECUTIVE_UNHEALTHY);
        }

        match status.machine.observe(healthy) {
            Some(Transition::BecameHealthy) => {
                info!(backend = %backend.name(), "Backend became healthy");
                self.repository.mark_healthy(backend).await;
            }
            Some(Transition::BecameUnhealthy) => {
                warn!(backend = %backend.name(), "Backend became unhealthy: {}", outcome.status);
                self.repository.mark_unhealthy(backend).await;
            }
            None => {}
        }

        if should_log {
            match &outcome.status {
                HealthStatus::Healthy => {
                    debug!(backend = %backend.name(), endpoint = %url, "Healthcheck succeeded");
                }
                failure => {
                    error!(
                        backend = %backend.name(),
                        endpoint = %url,
                        consecutive_failures = status.counters.get_count(CONSECUTIVE_UNHEALTHY),
                        "Healthcheck failed on backend: {}",
                        failure
                    );
                }
            }
        }

        if status.counters.should(CLEAR_ARP) {
            self.clear_arp_entry(backend).await;
        }
    }

    async fn clear_arp_entry(&self, backend: &Backend) {
        let Some(arp_manager) = &self.arp_manager else {
            return;
        };

        let ip = match resolve_host_ip(backend.host()).await {
            Ok(ip) => ip,
            Err(e) => {
                error!(backend = %backend.name(), "DNS lookup failed for {}: {}", backend.host(), e);
                return;
            }
        };

        if !arp_manager.is_cached(ip).await {
            return;
        }

        match arp_manager.remove_entry(ip).await {
            Ok(()) => info!(backend = %backend.name(), "Cleared arp cache entry for {}", ip),
            Err(e) => error!(backend = %backend.name(), "Failed to clear arp cache: {}", e),
        }
    }

    async fn publish(&self, active: &Option<Arc<Backend>>) {
        match active {
            Some(backend) => {
                info!(backend = %backend.name(), "New active backend {}", backend.address());
            }
            None => {
                warn!("No healthy backends, no active backend");
            }
        }

        for subscriber in &self.subscribers {
            if subscriber.send(active.clone()).await.is_err() {
                debug!("Active backend subscriber dropped its receiver");
            }
        }
    }
}
