/// Liveness listener for the proxy process itself
use crate::error::PasarelaResult;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Accepts TCP connections and closes them straight away, so load balancers
/// in front of the proxy can tell the process is up.
pub struct HealthPort {
    listener: TcpListener,
}

impl HealthPort {
    pub async fn bind(port: u16) -> PasarelaResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Proxy health listening on port {}", port);
        Ok(Self { listener })
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stopped| *stopped) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => drop(stream),
                    Err(e) => error!("Accepting TCP connection on health port: {}", e),
                },
            }
        }
        info!("Proxy health listener closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_accepts_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let health = HealthPort::from_listener(listener);
        let addr = health.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(health.serve(shutdown_rx));

        for _ in 0..3 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut buf = [0u8; 1];
            let read = timeout(Duration::from_secs(1), stream.read(&mut buf))
                .await
                .unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_on_ephemeral_port() {
        let health = HealthPort::bind(0).await.unwrap();
        assert!(health.local_addr().unwrap().port() > 0);
    }
}
