/// Control-plane state: operator traffic switch and the currently active backend
use crate::core::Backend;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Identity of the active backend as reported to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveBackendJson {
    pub host: String,
    pub port: u16,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterJson {
    pub active_backend: Option<ActiveBackendJson>,
    pub traffic_enabled: bool,
    pub message: String,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct ClusterState {
    traffic_enabled: bool,
    message: String,
    last_updated: Option<DateTime<Utc>>,
    active_backend: Option<ActiveBackendJson>,
    traffic_enabled_chans: Vec<mpsc::Sender<bool>>,
}

/// Receives active backend changes and publishes operator traffic toggles
#[derive(Debug)]
pub struct ClusterApi {
    state: Mutex<ClusterState>,
}

impl Default for ClusterApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState {
                traffic_enabled: true,
                message: String::new(),
                last_updated: None,
                active_backend: None,
                traffic_enabled_chans: Vec::new(),
            }),
        }
    }

    pub async fn register_traffic_enabled_chan(&self, chan: mpsc::Sender<bool>) {
        self.state.lock().await.traffic_enabled_chans.push(chan);
    }

    pub async fn enable_traffic(&self, message: impl Into<String>) {
        self.set_traffic(true, message.into()).await;
    }

    pub async fn disable_traffic(&self, message: impl Into<String>) {
        self.set_traffic(false, message.into()).await;
    }

    /// Record the toggle and deliver it to every registered channel in order.
    /// The state lock is held across delivery so toggles are never reordered.
    async fn set_traffic(&self, enabled: bool, message: String) {
        let mut state = self.state.lock().await;

        if enabled {
            info!(message = %message, "Enabling traffic for cluster");
        } else {
            info!(message = %message, "Disabling traffic for cluster");
        }

        state.message = message;
        state.last_updated = Some(Utc::now());
        state.traffic_enabled = enabled;

        for chan in &state.traffic_enabled_chans {
            if chan.send(enabled).await.is_err() {
                debug!("Traffic channel receiver dropped");
            }
        }
    }

    /// Consume active backend changes until the sending side goes away
    pub fn listen_for_active_backend(
        self: &Arc<Self>,
        mut changes: mpsc::Receiver<Option<Arc<Backend>>>,
    ) -> JoinHandle<()> {
        let api = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(backend) = changes.recv().await {
                let summary = backend.map(|b| ActiveBackendJson {
                    host: b.host().to_string(),
                    port: b.port(),
                    name: b.name().to_string(),
                });
                api.state.lock().await.active_backend = summary;
            }
        })
    }

    pub async fn as_json(&self) -> ClusterJson {
        let state = self.state.lock().await;
        ClusterJson {
            active_backend: state.active_backend.clone(),
            traffic_enabled: state.traffic_enabled,
            message: state.message.clone(),
            last_updated: state.last_updated,
        }
    }
}

/// Forward every value from `input` to each output in turn, awaiting each send
pub fn broadcast_bool(
    mut input: mpsc::Receiver<bool>,
    outputs: Vec<mpsc::Sender<bool>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(value) = input.recv().await {
            for output in &outputs {
                let _ = output.send(value).await;
            }
        }
    })
}
