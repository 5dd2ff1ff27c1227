pub mod api;
pub mod config;
pub mod error;
/// Pasarela - failover TCP proxy for replicated database clusters
///
/// Clients connect to one stable address. Pasarela probes the status sidecar
/// of every cluster member, elects a single healthy member as active, and
/// bridges each new client connection to it. When the active member fails,
/// its sessions are severed and new connections go to the next member chosen
/// by ordinal index.
pub mod core;
pub mod health;
pub mod monitor;
pub mod proxy;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub use crate::api::{broadcast_bool, ClusterApi};
pub use crate::config::{ActiveSelection, BackendConfig, Config};
pub use crate::core::{Backend, BackendsRepository, Bridge, Bridges, Conn, Dialer, TcpDialer};
pub use crate::error::{PasarelaError, PasarelaResult};
pub use crate::health::{HttpStatusFetcher, StatusFetcher};
pub use crate::monitor::{choose_active_backend, ArpManager, ClusterMonitor, DecisionCounters};
pub use crate::proxy::{BridgeRunner, ClusterRouter, HealthPort, Router};

/// Buffer for the monitor's active backend subscriber channels
const SUBSCRIBER_BUFFER: usize = 16;

/// ARP cache invalidation settings
#[derive(Debug, Clone, PartialEq)]
pub struct ArpSettings {
    pub binary: String,
    pub clear_threshold: u64,
}

/// Runtime configuration for one proxy instance
#[derive(Debug, Clone)]
pub struct PasarelaConfig {
    pub listen_addr: String,
    pub health_port: Option<u16>,
    pub healthcheck_timeout: Duration,
    pub dial_timeout: Duration,
    pub active_selection: ActiveSelection,
    pub backends: Vec<BackendConfig>,
    pub arp: Option<ArpSettings>,
}

impl PasarelaConfig {
    /// Create a new runtime configuration with validation
    pub fn new(
        listen_addr: String,
        backends: Vec<BackendConfig>,
        healthcheck_timeout: Duration,
        active_selection: ActiveSelection,
    ) -> Result<Self, String> {
        if listen_addr.trim().is_empty() {
            return Err("Listen address cannot be empty".to_string());
        }

        // The monitor ticks every timeout / 5
        if healthcheck_timeout < Duration::from_millis(5) {
            return Err("Health check timeout must be at least 5ms".to_string());
        }

        if backends.is_empty() {
            return Err("At least one backend is required".to_string());
        }

        Ok(Self {
            listen_addr,
            health_port: None,
            healthcheck_timeout,
            dial_timeout: Duration::from_secs(5),
            active_selection,
            backends,
            arp: None,
        })
    }

    /// Get the selection policy as a string for logging
    pub fn selection_name(&self) -> &'static str {
        match self.active_selection {
            ActiveSelection::LowestIndex => "lowest index",
            ActiveSelection::HighestIndex => "highest index",
        }
    }

    /// Check if the configuration is valid
    pub fn is_valid(&self) -> bool {
        !self.listen_addr.trim().is_empty()
            && self.healthcheck_timeout >= Duration::from_millis(5)
            && !self.dial_timeout.is_zero()
            && !self.backends.is_empty()
    }
}

impl From<&Config> for PasarelaConfig {
    fn from(config: &Config) -> Self {
        let arp = config.arp.enabled.then(|| ArpSettings {
            binary: config.arp.binary.clone(),
            clear_threshold: config.arp.clear_threshold,
        });

        Self {
            listen_addr: config.server.listen_addr.clone(),
            health_port: config.server.health_port,
            healthcheck_timeout: config.proxy.healthcheck_timeout(),
            dial_timeout: config.proxy.dial_timeout(),
            active_selection: config.proxy.active_selection,
            backends: config.proxy.backends.clone(),
            arp,
        }
    }
}

/// One proxy instance: the backends, their monitor and the client listener
pub struct Pasarela {
    config: PasarelaConfig,
    repository: Arc<BackendsRepository>,
    cluster_api: Arc<ClusterApi>,
    fetcher: Arc<dyn StatusFetcher>,
    arp_manager: Option<Arc<dyn ArpManager>>,
}

impl Pasarela {
    pub fn new(config: PasarelaConfig) -> PasarelaResult<Self> {
        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new(config.dial_timeout));
        let fetcher: Arc<dyn StatusFetcher> =
            Arc::new(HttpStatusFetcher::new(config.healthcheck_timeout)?);
        Ok(Self::with_collaborators(config, dialer, fetcher))
    }

    /// Build with explicit dialing and status probing capabilities
    pub fn with_collaborators(
        config: PasarelaConfig,
        dialer: Arc<dyn Dialer>,
        fetcher: Arc<dyn StatusFetcher>,
    ) -> Self {
        let repository = Arc::new(BackendsRepository::from_config(&config.backends, dialer));

        let arp_manager = config.arp.as_ref().map(|arp| {
            Arc::new(crate::monitor::PrivilegedArpManager::new(
                Arc::new(crate::monitor::ExecCmdRunner),
                arp.binary.clone(),
            )) as Arc<dyn ArpManager>
        });

        Self {
            config,
            repository,
            cluster_api: Arc::new(ClusterApi::new()),
            fetcher,
            arp_manager,
        }
    }

    pub fn config(&self) -> &PasarelaConfig {
        &self.config
    }

    pub fn repository(&self) -> Arc<BackendsRepository> {
        Arc::clone(&self.repository)
    }

    /// Control-plane handle for traffic toggles and active backend state
    pub fn cluster_api(&self) -> Arc<ClusterApi> {
        Arc::clone(&self.cluster_api)
    }

    /// Run until `shutdown` turns true.
    ///
    /// Listeners are bound before anything starts, so a bind failure is
    /// returned without leaving background tasks behind.
    pub async fn run_until(self, shutdown: watch::Receiver<bool>) -> PasarelaResult<()> {
        let listener = crate::core::create_listener(&self.config.listen_addr).await?;
        let health_port = match self.config.health_port {
            Some(port) => Some(HealthPort::bind(port).await?),
            None => None,
        };

        info!(
            backends = self.config.backends.len(),
            "Starting pasarela v{}, active backend chosen by {}",
            env!("CARGO_PKG_VERSION"),
            self.config.selection_name()
        );

        let (active_tx, active_rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut monitor = ClusterMonitor::new(
            Arc::clone(&self.repository),
            self.config.healthcheck_timeout,
            self.config.active_selection,
            Arc::clone(&self.fetcher),
        );
        if let (Some(manager), Some(arp)) = (&self.arp_manager, &self.config.arp) {
            monitor = monitor.with_arp_manager(Arc::clone(manager), arp.clear_threshold);
        }
        monitor.register_backend_subscriber(active_tx);
        let api_listener = self.cluster_api.listen_for_active_backend(active_rx);

        // Operator toggles fan out to every consumer; the bridge runner is the only one
        let (traffic_tx, traffic_rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let (runner_traffic_tx, runner_traffic_rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.cluster_api
            .register_traffic_enabled_chan(traffic_tx)
            .await;
        let broadcaster = broadcast_bool(traffic_rx, vec![runner_traffic_tx]);

        let monitor_handle = monitor.monitor(shutdown.clone());
        let health_handle =
            health_port.map(|health| tokio::spawn(health.serve(shutdown.clone())));

        let router = Arc::new(ClusterRouter::new(Arc::clone(&self.repository)));
        BridgeRunner::new(
            self.config.listen_addr.clone(),
            router,
            Arc::clone(&self.repository),
        )
        .with_traffic_channel(runner_traffic_rx)
        .serve(listener, shutdown)
        .await;

        if let Err(e) = monitor_handle.await {
            warn!("Cluster monitor task ended abnormally: {}", e);
        }
        if let Some(handle) = health_handle {
            if let Err(e) = handle.await {
                warn!("Health port task ended abnormally: {}", e);
            }
        }

        // The monitor dropped its subscriber, so the listener ends on its own
        let _ = api_listener.await;
        broadcaster.abort();

        info!("Pasarela stopped");
        Ok(())
    }
}
