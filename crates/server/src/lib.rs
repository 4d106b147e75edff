//! # scriptcast-server
//!
//! The distribution server: a generation-swapped script artifact store, a
//! per-connection session engine, the binary TCP ingress, and the HTTP
//! artifact ingress with random endpoint tokens.

pub mod cache;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod handler;
pub mod http;
pub mod net;
pub mod session;
pub mod store;

pub use endpoints::EndpointRegistry;
pub use error::{ConfigError, ServerError, StoreError};
pub use handler::{HandshakeConfig, PacketHandler};
pub use http::{HttpServer, HttpState};
pub use net::TcpServer;
pub use session::{SessionRegistry, DEFAULT_SESSION_TIMEOUT, SWEEP_INTERVAL};
pub use store::ScriptStore;
