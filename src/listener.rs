use anyhow::Context;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    arguments::Arguments,
    broadcast::Broadcaster,
    connection::Connection,
    handler::ConnectionHandler,
    registry::Registry,
};

/// Runtime settings of the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Deadline for a single write to a single client.
    pub send_timeout: Duration,
    /// Consecutive accept failures tolerated before the server gives up.
    pub accept_retries: u32,
    /// Delay after the first accept failure; doubled for each further one.
    pub accept_backoff: Duration,
    /// Longest line (in bytes) a client may send.
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            accept_retries: 3,
            accept_backoff: Duration::from_millis(100),
            max_line_length: 4096,
        }
    }
}

impl From<&Arguments> for ServerConfig {
    fn from(args: &Arguments) -> Self {
        Self {
            send_timeout: Duration::from_millis(args.send_timeout_ms),
            accept_retries: args.accept_retries,
            max_line_length: args.max_line_length,
            ..Self::default()
        }
    }
}

/// Accept connections on `listener` forever, one task per client.
///
/// # Termination
/// Only returns when accepting failed more than `accept_retries` times in a row.
pub async fn serve(listener: TcpListener, config: ServerConfig) -> anyhow::Result<()> {
    let broadcaster = Broadcaster::new(Arc::new(Registry::new()), config.send_timeout);
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "server is looking for connections");
    }

    let mut failures = 0;
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(accepted) => {
                failures = 0;
                accepted
            }
            Err(e) => {
                failures += 1;
                if failures > config.accept_retries {
                    error!("giving up after {failures} failed accepts: {e}");
                    return Err(e).context("Failed to accept on socket");
                }
                let delay = backoff(config.accept_backoff, failures);
                warn!("accept failed ({e}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        spawn_handler(socket, addr, &broadcaster, config.max_line_length);
    }
}

/// Delay before retrying after the `failures`-th consecutive accept error.
fn backoff(base: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1 << exponent)
}

fn spawn_handler(
    socket: TcpStream,
    addr: SocketAddr,
    broadcaster: &Broadcaster,
    max_line_length: usize,
) {
    let (reader, writer) = socket.into_split();
    let conn = Arc::new(Connection::new(addr, writer));
    let span = info_span!("conn", id = %conn.id(), %addr);
    let handler = ConnectionHandler::new(reader, conn, broadcaster.clone(), max_line_length);

    tokio::spawn(
        async move {
            info!("has connected");
            match handler.run().await {
                Ok(()) => debug!("connection finished"),
                Err(e) => warn!("connection ended: {e:#}"),
            }
        }
        .instrument(span),
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct Peer {
        lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    }

    impl Peer {
        async fn connect(addr: SocketAddr) -> Self {
            let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Option<String> {
            self.lines.next_line().await.unwrap()
        }
    }

    async fn start() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, ServerConfig::default()));
        addr
    }

    #[tokio::test]
    async fn relays_between_tcp_clients() {
        let addr = start().await;

        let mut alice = Peer::connect(addr).await;
        alice.send("alice|red").await;
        assert_eq!(alice.recv().await.unwrap(), "welcome alice");
        assert_eq!(alice.recv().await.unwrap(), "alice|red|has joined the server");

        let mut bob = Peer::connect(addr).await;
        bob.send("bob|purple").await;
        assert_eq!(bob.recv().await.unwrap(), "welcome bob");
        assert_eq!(bob.recv().await.unwrap(), "bob|black|has joined the server");
        assert_eq!(alice.recv().await.unwrap(), "bob|black|has joined the server");

        alice.send("hello").await;
        assert_eq!(bob.recv().await.unwrap(), "alice|red|hello");
        assert_eq!(alice.recv().await.unwrap(), "alice|red|hello");

        alice.send("/pm bob hi").await;
        assert_eq!(bob.recv().await.unwrap(), "[PM from alice] hi");
        assert_eq!(alice.recv().await.unwrap(), "[PM to bob] hi");

        alice.send("/pm carol hi").await;
        assert_eq!(alice.recv().await.unwrap(), "User 'carol' not found.");

        alice.send("/exit").await;
        assert_eq!(alice.recv().await, None);
        assert_eq!(bob.recv().await.unwrap(), "alice|red|has left the server");
    }

    #[tokio::test]
    async fn dropped_socket_counts_as_departure() {
        let addr = start().await;

        let mut alice = Peer::connect(addr).await;
        alice.send("alice|green").await;
        assert_eq!(alice.recv().await.unwrap(), "welcome alice");
        assert_eq!(alice.recv().await.unwrap(), "alice|green|has joined the server");

        let mut bob = Peer::connect(addr).await;
        bob.send("bob|blue").await;
        assert_eq!(bob.recv().await.unwrap(), "welcome bob");
        assert_eq!(alice.recv().await.unwrap(), "bob|blue|has joined the server");

        drop(bob);
        assert_eq!(alice.recv().await.unwrap(), "bob|blue|has left the server");
    }

    #[test]
    fn backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 1), Duration::from_millis(100));
        assert_eq!(backoff(base, 2), Duration::from_millis(200));
        assert_eq!(backoff(base, 4), Duration::from_millis(800));
    }

    #[test]
    fn config_follows_arguments() {
        use clap::Parser;
        let args = Arguments::parse_from(["relay", "--send-timeout-ms", "250", "--max-line-length", "80"]);
        let config = ServerConfig::from(&args);
        assert_eq!(config.send_timeout, Duration::from_millis(250));
        assert_eq!(config.max_line_length, 80);
        assert_eq!(config.accept_retries, 3);
    }
}
