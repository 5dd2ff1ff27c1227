/// Client-facing side of the proxy: accept loop, routing and liveness port
pub mod health_port;
pub mod router;
pub mod runner;

pub use health_port::HealthPort;
pub use router::{ClusterRouter, Router};
pub use runner::BridgeRunner;
