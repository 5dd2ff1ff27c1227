/// Registry of live bridges owned by one backend
use crate::core::bridge::Bridge;
use crate::core::connection::Conn;
use crate::error::{PasarelaError, PasarelaResult};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Thread-safe set of the sessions currently pinned to a backend
#[derive(Debug, Default)]
pub struct Bridges {
    bridges: RwLock<Vec<Arc<Bridge>>>,
}

impl Bridges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bridge and start tracking it. The caller drives [`Bridge::connect`].
    pub async fn create(&self, client: Conn, backend: Conn) -> Arc<Bridge> {
        let bridge = Arc::new(Bridge::new(client, backend));
        self.bridges.write().await.push(Arc::clone(&bridge));
        bridge
    }

    /// Stop tracking a bridge, matched by identity
    pub async fn remove(&self, bridge: &Arc<Bridge>) -> PasarelaResult<()> {
        let mut bridges = self.bridges.write().await;
        let index = bridges
            .iter()
            .position(|b| Arc::ptr_eq(b, bridge))
            .ok_or(PasarelaError::BridgeNotFound)?;

        bridges.remove(index);
        Ok(())
    }

    /// Close every tracked bridge and forget them all
    pub async fn remove_and_close_all(&self) {
        let mut bridges = self.bridges.write().await;
        for bridge in bridges.iter() {
            bridge.close();
        }
        bridges.clear();
    }

    pub async fn size(&self) -> usize {
        self.bridges.read().await.len()
    }

    pub async fn contains(&self, bridge: &Arc<Bridge>) -> bool {
        self.bridges
            .read()
            .await
            .iter()
            .any(|b| Arc::ptr_eq(b, bridge))
    }
}
