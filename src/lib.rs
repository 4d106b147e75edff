//! Umbrella crate: re-exports the protocol, server, and client components
//! under one name for integration tests and downstream embedding.

pub use scriptcast_client as client;
pub use scriptcast_protocol as protocol;
pub use scriptcast_server as server;
