/// Repository of all configured backends, the healthy subset and the active one
use crate::config::BackendConfig;
use crate::core::backend::{Backend, BackendJson};
use crate::core::connection::Dialer;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock, RwLockWriteGuard};
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Members {
    all: Vec<Arc<Backend>>,
    /// Parallel to `all`
    healthy: Vec<bool>,
    active: Option<Arc<Backend>>,
}

impl Members {
    fn position(&self, backend: &Arc<Backend>) -> Option<usize> {
        self.all.iter().position(|b| Arc::ptr_eq(b, backend))
    }

    fn is_active(&self, backend: &Arc<Backend>) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, backend))
    }

    fn first_healthy(&self) -> Option<Arc<Backend>> {
        self.all
            .iter()
            .zip(&self.healthy)
            .find(|(_, healthy)| **healthy)
            .map(|(backend, _)| Arc::clone(backend))
    }
}

/// Thread-safe collection of backends. Every operation serializes on one lock.
///
/// Each backend's own health flag is only written while that lock is held,
/// so it always agrees with the healthy subset.
#[derive(Debug, Default)]
pub struct BackendsRepository {
    members: RwLock<Members>,
}

impl BackendsRepository {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        let healthy = vec![false; backends.len()];
        Self {
            members: RwLock::new(Members {
                all: backends,
                healthy,
                active: None,
            }),
        }
    }

    /// Build one backend per config entry, all sharing the same dialer
    pub fn from_config(configs: &[BackendConfig], dialer: Arc<dyn Dialer>) -> Self {
        let backends = configs
            .iter()
            .map(|config| Arc::new(Backend::new(config, Arc::clone(&dialer))))
            .collect();
        Self::new(backends)
    }

    /// Point-in-time sequence of every backend
    pub async fn all(&self) -> mpsc::Receiver<Arc<Backend>> {
        let snapshot = self.members.read().await.all.clone();
        Self::into_receiver(snapshot)
    }

    /// Point-in-time sequence of the backends currently considered healthy
    pub async fn healthy(&self) -> mpsc::Receiver<Arc<Backend>> {
        let snapshot: Vec<_> = {
            let members = self.members.read().await;
            members
                .all
                .iter()
                .zip(&members.healthy)
                .filter(|(_, healthy)| **healthy)
                .map(|(backend, _)| Arc::clone(backend))
                .collect()
        };
        Self::into_receiver(snapshot)
    }

    fn into_receiver(snapshot: Vec<Arc<Backend>>) -> mpsc::Receiver<Arc<Backend>> {
        let (tx, rx) = mpsc::channel(snapshot.len().max(1));
        for backend in snapshot {
            // Capacity covers the whole snapshot
            let _ = tx.try_send(backend);
        }
        rx
    }

    pub async fn active(&self) -> Option<Arc<Backend>> {
        self.members.read().await.active.clone()
    }

    /// Any member, for reading properties that are the same on every backend
    pub async fn any(&self) -> Option<Arc<Backend>> {
        self.members.read().await.all.first().cloned()
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.all.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.all.is_empty()
    }

    /// Mark a backend healthy. It becomes active only if nothing is active yet.
    pub async fn set_healthy(&self, backend: &Arc<Backend>) {
        let Some(mut members) = self.record_health(backend, true).await else {
            return;
        };

        if members.active.is_none() {
            info!(backend = %backend.name(), "New active backend {}", backend.address());
            members.active = Some(Arc::clone(backend));
        }
    }

    /// Mark a backend unhealthy, failing over if it was the active one
    pub async fn set_unhealthy(&self, backend: &Arc<Backend>) {
        let Some(mut members) = self.record_health(backend, false).await else {
            return;
        };
        if !members.is_active(backend) {
            return;
        }

        backend.sever_connections().await;

        members.active = members.first_healthy();
        match &members.active {
            Some(replacement) => {
                info!(backend = %replacement.name(), "New active backend {}", replacement.address());
            }
            None => {
                warn!("No active backend");
            }
        }
    }

    /// Record a healthy probe without touching the active backend.
    ///
    /// Used by the cluster monitor, which elects the active backend itself
    /// once every probe of a tick is in.
    pub async fn mark_healthy(&self, backend: &Arc<Backend>) {
        self.record_health(backend, true).await;
    }

    /// Record a failed probe. An active backend loses its sessions and the
    /// active slot stays empty until the next election.
    pub async fn mark_unhealthy(&self, backend: &Arc<Backend>) {
        let Some(mut members) = self.record_health(backend, false).await else {
            return;
        };
        if !members.is_active(backend) {
            return;
        }

        backend.sever_connections().await;
        members.active = None;
        warn!(backend = %backend.name(), "Active backend failed, awaiting election");
    }

    /// Update the backend flag and the healthy subset under one write lock,
    /// returning the guard so callers finish their change in the same section
    async fn record_health(
        &self,
        backend: &Arc<Backend>,
        healthy: bool,
    ) -> Option<RwLockWriteGuard<'_, Members>> {
        let mut members = self.members.write().await;
        let Some(pos) = members.position(backend) else {
            warn!(backend = %backend.name(), "Ignoring health update for unknown backend");
            return None;
        };

        if healthy {
            backend.set_healthy().await;
        } else {
            backend.set_unhealthy().await;
        }
        members.healthy[pos] = healthy;
        Some(members)
    }

    /// Install the backend chosen by the cluster monitor. Returns true if it changed.
    pub async fn set_active(&self, backend: Option<Arc<Backend>>) -> bool {
        let mut members = self.members.write().await;
        let changed = match (&members.active, &backend) {
            (Some(current), Some(next)) => !Arc::ptr_eq(current, next),
            (None, None) => false,
            _ => true,
        };
        members.active = backend;
        changed
    }

    /// Status snapshot of every backend
    pub async fn as_json(&self) -> Vec<BackendJson> {
        let mut backends = self.all().await;
        let mut snapshot = Vec::new();
        while let Some(backend) = backends.recv().await {
            snapshot.push(backend.as_json().await);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::tests::{backend_config, eventually, test_backend, PipeDialer};

    async fn drain(mut rx: mpsc::Receiver<Arc<Backend>>) -> Vec<String> {
        let mut names = Vec::new();
        while let Some(backend) = rx.recv().await {
            names.push(backend.name().to_string());
        }
        names
    }

    fn three_backends() -> (BackendsRepository, Vec<Arc<Backend>>) {
        let backends = vec![test_backend("a"), test_backend("b"), test_backend("c")];
        (BackendsRepository::new(backends.clone()), backends)
    }

    #[tokio::test]
    async fn test_from_config() {
        let configs = vec![backend_config("a", "10.0.0.1"), backend_config("b", "10.0.0.2")];
        let repo = BackendsRepository::from_config(&configs, Arc::new(PipeDialer::default()));

        assert_eq!(repo.len().await, 2);
        assert_eq!(drain(repo.all().await).await, vec!["a", "b"]);
        assert_eq!(repo.any().await.unwrap().name(), "a");
        assert!(repo.active().await.is_none());
    }

    #[tokio::test]
    async fn test_first_healthy_becomes_active() {
        let (repo, backends) = three_backends();

        repo.set_healthy(&backends[1]).await;
        repo.set_healthy(&backends[0]).await;

        let active = repo.active().await.unwrap();
        assert!(Arc::ptr_eq(&active, &backends[1]));
        assert_eq!(drain(repo.healthy().await).await, vec!["a", "b"]);
        assert!(backends[0].healthy().await);
    }

    #[tokio::test]
    async fn test_sole_healthy_active_goes_unhealthy() {
        let (repo, backends) = three_backends();
        repo.set_healthy(&backends[0]).await;

        repo.set_unhealthy(&backends[0]).await;
        assert!(repo.active().await.is_none());
        assert!(drain(repo.healthy().await).await.is_empty());

        repo.set_healthy(&backends[2]).await;
        let active = repo.active().await.unwrap();
        assert!(Arc::ptr_eq(&active, &backends[2]));
    }

    #[tokio::test]
    async fn test_active_fails_over_to_remaining_healthy() {
        let (repo, backends) = three_backends();
        for backend in &backends {
            repo.set_healthy(backend).await;
        }

        repo.set_unhealthy(&backends[0]).await;
        let active = repo.active().await.unwrap();
        assert!(Arc::ptr_eq(&active, &backends[1]));

        // Losing a non-active backend leaves the active one alone
        repo.set_unhealthy(&backends[2]).await;
        let active = repo.active().await.unwrap();
        assert!(Arc::ptr_eq(&active, &backends[1]));
    }

    #[tokio::test]
    async fn test_mark_healthy_never_elects() {
        let (repo, backends) = three_backends();

        repo.mark_healthy(&backends[2]).await;
        repo.mark_healthy(&backends[0]).await;

        assert!(repo.active().await.is_none());
        assert_eq!(drain(repo.healthy().await).await, vec!["a", "c"]);
        assert!(backends[2].healthy().await);
    }

    #[tokio::test]
    async fn test_mark_unhealthy_clears_active_without_replacement() {
        let (repo, backends) = three_backends();
        for backend in &backends {
            repo.mark_healthy(backend).await;
        }
        repo.set_active(Some(Arc::clone(&backends[1]))).await;

        // A non-active failure leaves the election result alone
        repo.mark_unhealthy(&backends[0]).await;
        assert!(Arc::ptr_eq(&repo.active().await.unwrap(), &backends[1]));

        repo.mark_unhealthy(&backends[1]).await;
        assert!(repo.active().await.is_none());
        assert!(!backends[1].healthy().await);
        assert_eq!(drain(repo.healthy().await).await, vec!["c"]);
    }

    #[tokio::test]
    async fn test_mark_unhealthy_severs_active_sessions() {
        let repo = BackendsRepository::from_config(
            &[backend_config("a", "10.0.0.1"), backend_config("b", "10.0.0.2")],
            Arc::new(PipeDialer::default()),
        );
        let backend = repo.any().await.unwrap();
        repo.mark_healthy(&backend).await;
        repo.set_active(Some(Arc::clone(&backend))).await;

        let (client, _client_far) = tokio::io::duplex(64);
        backend
            .bridge(crate::core::Conn::new(client, "client"))
            .await
            .unwrap();
        assert_eq!(backend.session_count().await, 1);

        repo.mark_unhealthy(&backend).await;
        let watched = Arc::clone(&backend);
        eventually(|| {
            let backend = Arc::clone(&watched);
            async move { backend.session_count().await == 0 }
        })
        .await;
    }

    #[tokio::test]
    async fn test_set_active_reports_change() {
        let (repo, backends) = three_backends();

        assert!(!repo.set_active(None).await);
        assert!(repo.set_active(Some(Arc::clone(&backends[0]))).await);
        assert!(!repo.set_active(Some(Arc::clone(&backends[0]))).await);
        assert!(repo.set_active(Some(Arc::clone(&backends[1]))).await);
        assert!(repo.set_active(None).await);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_ignored() {
        let (repo, _backends) = three_backends();
        let stranger = test_backend("z");

        repo.set_healthy(&stranger).await;
        assert!(repo.active().await.is_none());
    }

    #[tokio::test]
    async fn test_as_json_lists_every_backend() {
        let (repo, backends) = three_backends();
        repo.set_healthy(&backends[2]).await;

        let json = repo.as_json().await;
        assert_eq!(json.len(), 3);
        assert!(!json[0].healthy);
        assert!(json[2].healthy);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_operations_keep_views_consistent() {
        let (repo, backends) = three_backends();
        let repo = Arc::new(repo);
        let mut tasks = Vec::new();

        for i in 0..8 {
            let repo = Arc::clone(&repo);
            let backends = backends.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..50 {
                    let backend = &backends[(i + round) % backends.len()];
                    match round % 5 {
                        0 => {
                            let _ = drain(repo.all().await).await;
                        }
                        1 => {
                            let _ = repo.active().await;
                        }
                        2 => repo.set_healthy(backend).await,
                        3 => repo.set_unhealthy(backend).await,
                        _ => {
                            let _ = drain(repo.healthy().await).await;
                        }
                    }
                }
            }));
        }

        let all = futures::future::join_all(tasks);
        let results = tokio::time::timeout(std::time::Duration::from_secs(5), all)
            .await
            .expect("repository operations deadlocked");
        for result in results {
            result.unwrap();
        }

        // Every backend flag agrees with the healthy subset, and the active one is healthy
        let healthy = drain(repo.healthy().await).await;
        for backend in &backends {
            assert_eq!(
                backend.healthy().await,
                healthy.iter().any(|name| name == backend.name()),
                "{} diverged from the healthy subset",
                backend.name()
            );
        }
        if let Some(active) = repo.active().await {
            assert!(active.healthy().await);
        }
    }
}
