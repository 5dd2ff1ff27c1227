/// Routing of accepted client connections to the active backend
use crate::core::{BackendsRepository, Conn};
use crate::error::{PasarelaError, PasarelaResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait Router: Send + Sync {
    /// Hand a client connection to a backend. On error the connection has been dropped.
    async fn route_to_backend(&self, client: Conn) -> PasarelaResult<()>;
}

/// Routes to whatever backend the repository currently marks active
#[derive(Debug, Clone)]
pub struct ClusterRouter {
    repository: Arc<BackendsRepository>,
}

impl ClusterRouter {
    pub fn new(repository: Arc<BackendsRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Router for ClusterRouter {
    async fn route_to_backend(&self, client: Conn) -> PasarelaResult<()> {
        // Read at routing time, never cached from an earlier connection
        let backend = self
            .repository
            .active()
            .await
            .ok_or(PasarelaError::NoActiveBackend)?;

        debug!(client = %client.peer_addr(), backend = %backend.name(), "Routing connection");
        backend.bridge(client).await
    }
}
