/// A single cluster member that client sessions can be bridged to
use crate::config::BackendConfig;
use crate::core::bridges::Bridges;
use crate::core::connection::{Conn, Dialer};
use crate::error::{PasarelaError, PasarelaResult};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

#[derive(Debug)]
struct BackendState {
    healthy: bool,
    index: Option<u64>,
    traffic_enabled: bool,
}

/// One cluster member: fixed identity plus health, ordinal index and traffic flags
pub struct Backend {
    name: String,
    host: String,
    port: u16,
    status_port: u16,
    status_endpoint: String,
    state: RwLock<BackendState>,
    bridges: Bridges,
    dialer: Arc<dyn Dialer>,
}

/// Read-only snapshot for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendJson {
    pub host: String,
    pub port: u16,
    pub healthy: bool,
    pub name: String,
    pub current_session_count: usize,
    pub traffic_enabled: bool,
}

impl Backend {
    pub fn new(config: &BackendConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            status_port: config.status_port,
            status_endpoint: config.status_endpoint.clone(),
            state: RwLock::new(BackendState {
                healthy: false,
                index: None,
                traffic_enabled: true,
            }),
            bridges: Bridges::new(),
            dialer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Data address new sessions are dialed to
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn healthcheck_url(&self) -> String {
        format!(
            "http://{}:{}/{}",
            self.host,
            self.status_port,
            self.status_endpoint.trim_start_matches('/')
        )
    }

    /// Dial this backend and hand the session off to a background bridge.
    ///
    /// Returns as soon as the dial succeeds; the bridge runs in its own task and
    /// removes itself from the registry when it ends. On error the client
    /// connection is dropped, which closes it.
    pub async fn bridge(self: &Arc<Self>, client: Conn) -> PasarelaResult<()> {
        if !self.traffic_enabled().await {
            info!(
                backend = %self.name,
                "Traffic disabled - not routing to {} at {}",
                self.name,
                self.address()
            );
            return Err(PasarelaError::TrafficDisabled {
                backend: self.name.clone(),
            });
        }

        let addr = self.address();
        let backend_conn = self
            .dialer
            .dial(&addr)
            .await
            .map_err(|e| PasarelaError::dial(addr, e))?;

        let bridge = self.bridges.create(client, backend_conn).await;
        let backend = Arc::clone(self);

        tokio::spawn(async move {
            bridge.connect().await;

            if let Err(e) = backend.bridges.remove(&bridge).await {
                // Severed bridges were already dropped from the registry
                if !bridge.is_closed() {
                    error!(backend = %backend.name, bridge = bridge.id(), "Failed to remove bridge: {}", e);
                }
            }
        });

        Ok(())
    }

    /// Close every session currently pinned to this backend
    pub async fn sever_connections(&self) {
        info!(
            backend = %self.name,
            "Severing all connections to {} at {}",
            self.name,
            self.address()
        );
        self.bridges.remove_and_close_all().await;
    }

    pub async fn set_healthy(&self) {
        self.state.write().await.healthy = true;
    }

    pub async fn set_unhealthy(&self) {
        self.state.write().await.healthy = false;
    }

    pub async fn healthy(&self) -> bool {
        self.state.read().await.healthy
    }

    /// Record the ordinal index from the latest status document
    pub async fn set_index(&self, index: u64) {
        self.state.write().await.index = Some(index);
    }

    pub async fn index(&self) -> Option<u64> {
        self.state.read().await.index
    }

    pub async fn enable_traffic(&self) {
        info!(backend = %self.name, "Enabling traffic for backend {} at {}", self.name, self.address());
        self.state.write().await.traffic_enabled = true;
    }

    /// Stop accepting new sessions and drop the existing ones
    pub async fn disable_traffic(&self) {
        info!(backend = %self.name, "Disabling traffic for backend {} at {}", self.name, self.address());
        self.state.write().await.traffic_enabled = false;
        self.sever_connections().await;
    }

    pub async fn traffic_enabled(&self) -> bool {
        self.state.read().await.traffic_enabled
    }

    pub async fn session_count(&self) -> usize {
        self.bridges.size().await
    }

    pub async fn as_json(&self) -> BackendJson {
        let (healthy, traffic_enabled) = {
            let state = self.state.read().await;
            (state.healthy, state.traffic_enabled)
        };

        BackendJson {
            host: self.host.clone(),
            port: self.port,
            healthy,
            name: self.name.clone(),
            current_session_count: self.bridges.size().await,
            traffic_enabled,
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("status_port", &self.status_port)
            .field("status_endpoint", &self.status_endpoint)
            .finish()
    }
}
