#![warn(missing_docs)]

//! A line-oriented chat relay on top of tokio.
//!
//! Every client first claims a name and a color with a `name|color` line. After
//! that, each line it sends is either relayed to everyone, delivered privately
//! (`/pm <name> <text>`), or ends the session (`/exit`).

use std::{net::SocketAddr, time::Duration};
use tracing_subscriber::EnvFilter;

/// Command line arguments of the `relay` binary.
pub mod arguments;

/// Fan-out of messages to all registered clients, with eviction of failing peers.
pub mod broadcast;

/// The shared, closeable write side of a client stream.
pub mod connection;

/// Per-connection state machine: handshake, relaying, departure.
pub mod handler;

/// Accept loop and server configuration.
pub mod listener;

/// Handshake parsing, command decoding and outbound line encoding.
pub mod protocol;

/// Directory of connected clients by connection and by name.
pub mod registry;

pub use arguments::Arguments;
pub use broadcast::Broadcaster;
pub use connection::{Connection, ConnectionId, SendError};
pub use handler::ConnectionHandler;
pub use listener::{serve, ServerConfig};
pub use protocol::{ClientRecord, Color, Command, Message};
pub use registry::{Registry, RegistryError};

/// Install the global tracing subscriber.
///
/// Log lines go to stdout, filtered by `RUST_LOG` (default `info`). If `console`
/// is given, the console subscriber is installed instead: it publishes task
/// events there for `tokio-console` and still logs to stdout.
pub fn init_tracing(console: Option<SocketAddr>) {
    match console {
        Some(addr) => console_subscriber::ConsoleLayer::builder()
            .retention(Duration::from_secs(60))
            .server_addr(addr)
            .init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init(),
    }
}
