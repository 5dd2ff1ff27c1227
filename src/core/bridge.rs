/// One proxied session between a client and a backend
use crate::core::connection::{Conn, ProxyStream};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

/// Relays bytes between a client connection and a backend connection.
///
/// [`Bridge::connect`] runs both copy directions until either one stops or
/// [`Bridge::close`] is called. Both streams are shut down and dropped exactly
/// once, whichever path ends the session.
pub struct Bridge {
    id: u64,
    client_addr: String,
    backend_addr: String,
    streams: Mutex<Option<(Box<dyn ProxyStream>, Box<dyn ProxyStream>)>>,
    closed: watch::Sender<bool>,
}

impl Bridge {
    pub fn new(client: Conn, backend: Conn) -> Self {
        let client_addr = client.peer_addr().to_string();
        let backend_addr = backend.peer_addr().to_string();
        let (closed, _) = watch::channel(false);

        Self {
            id: NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed),
            client_addr,
            backend_addr,
            streams: Mutex::new(Some((client.into_stream(), backend.into_stream()))),
            closed,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_addr(&self) -> &str {
        &self.client_addr
    }

    pub fn backend_addr(&self) -> &str {
        &self.backend_addr
    }

    /// Copy bytes in both directions until one side finishes or the bridge is closed.
    ///
    /// Copy errors are not surfaced: when one half of a session goes away the
    /// other half usually reports an error, and both cases end the same way.
    /// Calling this a second time returns immediately.
    pub async fn connect(&self) {
        let Some((client, backend)) = self.streams.lock().await.take() else {
            return;
        };

        info!(
            client = %self.client_addr,
            backend = %self.backend_addr,
            "Session established"
        );

        let mut closed = self.closed.subscribe();
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut backend_read, mut backend_write) = tokio::io::split(backend);

        tokio::select! {
            result = tokio::io::copy(&mut client_read, &mut backend_write) => {
                if let Err(e) = result {
                    debug!(bridge = self.id, "client to backend copy stopped: {}", e);
                }
            }
            result = tokio::io::copy(&mut backend_read, &mut client_write) => {
                if let Err(e) = result {
                    debug!(bridge = self.id, "backend to client copy stopped: {}", e);
                }
            }
            _ = closed.wait_for(|closed| *closed) => {
                debug!(bridge = self.id, "bridge closed externally");
            }
        }

        let _ = backend_write.shutdown().await;
        let _ = client_write.shutdown().await;
        drop((client_read, client_write, backend_read, backend_write));

        info!(
            client = %self.client_addr,
            backend = %self.backend_addr,
            "Session closed"
        );
    }

    /// Signal termination without waiting on I/O. Only the first call
    /// notifies; later calls are no-ops.
    pub fn close(&self) {
        self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
    }

    /// Receiver that observes the close signal
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("id", &self.id)
            .field("client_addr", &self.client_addr)
            .field("backend_addr", &self.backend_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Display for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "from client at {} to backend at {}",
            self.client_addr, self.backend_addr
        )
    }
}
