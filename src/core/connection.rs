/// Connection handles and backend dialing
///
/// A [`Conn`] is one end of a proxied session: a byte stream plus the
/// remote address it talks to. Streams are boxed so bridges can be driven by
/// real sockets in production and in-memory pipes in tests.
use crate::error::PasarelaResult;
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Byte stream that can sit on either side of a bridge
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// One end of a proxied session
pub struct Conn {
    stream: Box<dyn ProxyStream>,
    peer_addr: String,
}

impl Conn {
    pub fn new<S>(stream: S, peer_addr: impl Into<String>) -> Self
    where
        S: ProxyStream + 'static,
    {
        Self {
            stream: Box::new(stream),
            peer_addr: peer_addr.into(),
        }
    }

    /// Wrap a TCP stream, tuning it for long-lived database sessions
    pub fn from_tcp(stream: TcpStream) -> Self {
        if let Err(e) = configure_stream(&stream) {
            warn!("Failed to configure TCP stream: {}", e);
        }

        let peer_addr = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self::new(stream, peer_addr)
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub(crate) fn into_stream(self) -> Box<dyn ProxyStream> {
        self.stream
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Capability to open a connection to a backend's data address
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<Conn>;
}

/// Dialer that opens plain TCP connections with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<Conn> {
        debug!("Connecting to backend {}", addr);

        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!("Successfully connected to backend {}", addr);
                Ok(Conn::from_tcp(stream))
            }
            Ok(Err(e)) => {
                debug!("Network error connecting to backend {}: {}", addr, e);
                Err(e)
            }
            Err(_) => {
                debug!("Timeout connecting to backend {}", addr);
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", addr, self.connect_timeout),
                ))
            }
        }
    }
}

/// Create a TCP listener on the specified `ip:port` address
pub async fn create_listener(listen_addr: &str) -> PasarelaResult<TcpListener> {
    let addr: SocketAddr = listen_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", listen_addr);
    Ok(listener)
}

/// Disable Nagle and enable keepalive so half-dead peers are eventually noticed
fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}
