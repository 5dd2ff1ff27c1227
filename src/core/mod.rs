/// Core proxy abstractions: connections, bridges and the backends they attach to
pub mod backend;
pub mod backends;
pub mod bridge;
pub mod bridges;
pub mod connection;

pub use backend::{Backend, BackendJson};
pub use backends::BackendsRepository;
pub use bridge::Bridge;
pub use bridges::Bridges;
pub use connection::{create_listener, Conn, Dialer, ProxyStream, TcpDialer};
