/// Accept loop that hands client connections to the router
use crate::core::{create_listener, BackendsRepository, Conn};
use crate::error::PasarelaResult;
use crate::proxy::router::Router;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Runs the proxy listener until shutdown.
///
/// Each accepted connection is routed in its own task so a slow dial never
/// stalls the loop. Traffic toggles arrive on an optional channel and apply
/// to every backend at once.
pub struct BridgeRunner {
    listen_addr: String,
    router: Arc<dyn Router>,
    repository: Arc<BackendsRepository>,
    traffic: Option<mpsc::Receiver<bool>>,
}

impl BridgeRunner {
    pub fn new(
        listen_addr: impl Into<String>,
        router: Arc<dyn Router>,
        repository: Arc<BackendsRepository>,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            router,
            repository,
            traffic: None,
        }
    }

    pub fn with_traffic_channel(mut self, traffic: mpsc::Receiver<bool>) -> Self {
        self.traffic = Some(traffic);
        self
    }

    /// Bind the listener and serve. Only a bind failure is returned.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> PasarelaResult<()> {
        let listener = create_listener(&self.listen_addr).await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Serve on an already bound listener. Sessions still open at shutdown are left to drain.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let BridgeRunner {
            router,
            repository,
            mut traffic,
            ..
        } = self;

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => {
                    break;
                }
                change = next_traffic_change(&mut traffic) => match change {
                    Some(enabled) => apply_traffic_change(&repository, enabled).await,
                    None => {
                        traffic = None;
                    }
                },
                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => {
                        if !cluster_traffic_enabled(&repository).await {
                            info!(client = %client_addr, "Traffic disabled, closing client connection");
                            continue;
                        }

                        let conn = Conn::from_tcp(stream);
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            if let Err(e) = router.route_to_backend(conn).await {
                                warn!(client = %client_addr, "Closing unroutable connection: {}", e);
                            }
                        });
                    }
                    Err(e) => backoff_after_accept_error(&e).await,
                },
            }
        }

        drop(listener);
        info!("Proxy listener closed, existing sessions will drain");
    }
}

/// Resolves once shutdown is requested or the sender is gone. The borrowed
/// value is released before returning so the serving future stays `Send`.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Errors such as EMFILE persist until a descriptor frees up; pause instead of spinning
async fn backoff_after_accept_error(e: &io::Error) {
    error!("Failed to accept connection: {}", e);
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

async fn next_traffic_change(traffic: &mut Option<mpsc::Receiver<bool>>) -> Option<bool> {
    match traffic {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Traffic is toggled for the whole cluster, so any member carries the current flag
async fn cluster_traffic_enabled(repository: &BackendsRepository) -> bool {
    match repository.any().await {
        Some(backend) => backend.traffic_enabled().await,
        None => false,
    }
}

async fn apply_traffic_change(repository: &BackendsRepository, enabled: bool) {
    if cluster_traffic_enabled(repository).await == enabled {
        return;
    }

    let mut backends = repository.all().await;
    while let Some(backend) = backends.recv().await {
        if enabled {
            backend.enable_traffic().await;
        } else {
            backend.disable_traffic().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::tests::{eventually, test_backend};
    use crate::core::Backend;
    use crate::error::PasarelaError;
    use crate::proxy::router::ClusterRouter;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    struct Harness {
        addr: std::net::SocketAddr,
        backends: Vec<Arc<Backend>>,
        repository: Arc<BackendsRepository>,
        traffic_tx: mpsc::Sender<bool>,
        shutdown_tx: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<()>,
    }

    async fn start() -> Harness {
        let backends = vec![test_backend("a"), test_backend("b")];
        let repository = Arc::new(BackendsRepository::new(backends.clone()));
        let router = Arc::new(ClusterRouter::new(Arc::clone(&repository)));
        let (traffic_tx, traffic_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let runner = BridgeRunner::new(addr.to_string(), router, Arc::clone(&repository))
            .with_traffic_channel(traffic_rx);
        let handle = tokio::spawn(runner.serve(listener, shutdown_rx));

        Harness {
            addr,
            backends,
            repository,
            traffic_tx,
            shutdown_tx,
            handle,
        }
    }

    async fn assert_closed(stream: &mut TcpStream) {
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(1), stream.read(&mut buf))
            .await
            .expect("connection left open");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_connection_without_active_backend_is_closed() {
        let harness = start().await;

        let mut client = TcpStream::connect(harness.addr).await.unwrap();
        assert_closed(&mut client).await;

        // The loop keeps accepting after a routing failure
        harness
            .repository
            .set_active(Some(Arc::clone(&harness.backends[0])))
            .await;
        let mut client = TcpStream::connect(harness.addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let backend = Arc::clone(&harness.backends[0]);
        eventually(|| {
            let backend = Arc::clone(&backend);
            async move { backend.session_count().await == 1 }
        })
        .await;
    }

    #[tokio::test]
    async fn test_traffic_toggle_applies_to_every_backend() {
        let harness = start().await;
        harness
            .repository
            .set_active(Some(Arc::clone(&harness.backends[0])))
            .await;

        let _session = TcpStream::connect(harness.addr).await.unwrap();
        let active = Arc::clone(&harness.backends[0]);
        eventually(|| {
            let active = Arc::clone(&active);
            async move { active.session_count().await == 1 }
        })
        .await;

        harness.traffic_tx.send(false).await.unwrap();
        let backends = harness.backends.clone();
        eventually(|| {
            let backends = backends.clone();
            async move {
                !backends[0].traffic_enabled().await && !backends[1].traffic_enabled().await
            }
        })
        .await;
        // Disabling severed the existing session
        assert_eq!(harness.backends[0].session_count().await, 0);

        let mut refused = TcpStream::connect(harness.addr).await.unwrap();
        assert_closed(&mut refused).await;
        assert_eq!(harness.backends[0].session_count().await, 0);

        harness.traffic_tx.send(true).await.unwrap();
        let backends = harness.backends.clone();
        eventually(|| {
            let backends = backends.clone();
            async move { backends[0].traffic_enabled().await && backends[1].traffic_enabled().await }
        })
        .await;

        let _accepted = TcpStream::connect(harness.addr).await.unwrap();
        eventually(|| {
            let active = Arc::clone(&active);
            async move { active.session_count().await == 1 }
        })
        .await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting_but_keeps_sessions() {
        let harness = start().await;
        harness
            .repository
            .set_active(Some(Arc::clone(&harness.backends[0])))
            .await;

        let _session = TcpStream::connect(harness.addr).await.unwrap();
        let active = Arc::clone(&harness.backends[0]);
        eventually(|| {
            let active = Arc::clone(&active);
            async move { active.session_count().await == 1 }
        })
        .await;

        harness.shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(1), harness.handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(harness.backends[0].session_count().await, 1);
        assert!(TcpStream::connect(harness.addr).await.is_err());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_serve_future_is_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let repository = Arc::new(BackendsRepository::new(vec![test_backend("a")]));
        let router = Arc::new(ClusterRouter::new(Arc::clone(&repository)));
        let (_traffic_tx, traffic_rx) = mpsc::channel(1);
        let runner = BridgeRunner::new("127.0.0.1:0", router, repository)
            .with_traffic_channel(traffic_rx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let serving = runner.serve(listener, shutdown_rx);
        assert_send(&serving);
    }

    #[tokio::test]
    async fn test_accept_error_pauses_the_loop() {
        let started = std::time::Instant::now();
        let e = io::Error::new(io::ErrorKind::Other, "too many open files");

        backoff_after_accept_error(&e).await;

        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_run_fails_when_address_is_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let repository = Arc::new(BackendsRepository::new(vec![test_backend("a")]));
        let router = Arc::new(ClusterRouter::new(Arc::clone(&repository)));
        let runner = BridgeRunner::new(addr.to_string(), router, repository);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = runner.run(shutdown_rx).await;
        assert!(matches!(result, Err(PasarelaError::Network(_))));
    }
}
