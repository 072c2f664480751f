use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures::future::join_all;
use tracing::{debug, warn};

use crate::{
    connection::{Connection, SendError},
    protocol::{ClientRecord, Message},
    registry::Registry,
};

/// Delivers messages to registered clients.
///
/// A recipient whose send fails or times out is considered gone: it is
/// unregistered, closed, and everyone else is told it left.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    send_timeout: Duration,
}

impl Broadcaster {
    /// Deliver over the clients in `registry`, bounding every single write by `send_timeout`.
    pub fn new(registry: Arc<Registry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    /// The registry this broadcaster delivers to.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Deadline for one write to one peer.
    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Send `message` to every registered client.
    ///
    /// Writes go out concurrently, so a stalled peer costs at most one send
    /// timeout. Departures caused by failed writes are announced in turn.
    pub async fn broadcast(&self, message: Message) {
        let mut pending = VecDeque::from([message]);
        while let Some(message) = pending.pop_front() {
            let line = message.encode();
            let recipients = self.registry.snapshot();
            debug!(recipients = recipients.len(), "broadcasting {:?}", line.trim_end());

            let sends = recipients.iter().map(|(conn, _)| conn.send(&line, self.send_timeout));
            let results = join_all(sends).await;

            for ((conn, _), result) in recipients.iter().zip(results) {
                if let Err(e) = result {
                    if let Some(gone) = self.evict(conn, &e).await {
                        pending.push_back(Message::Left(gone));
                    }
                }
            }
        }
    }

    /// Send `message` to a single connection. On failure the connection is
    /// evicted (and its departure broadcast) and the error returned.
    pub async fn send_to(&self, conn: &Connection, message: &Message) -> Result<(), SendError> {
        match conn.send(&message.encode(), self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(gone) = self.evict(conn, &e).await {
                    self.broadcast(Message::Left(gone)).await;
                }
                Err(e)
            }
        }
    }

    /// Unregister and close `conn`. Returns the record if this call was the one
    /// that removed it.
    async fn evict(&self, conn: &Connection, reason: &SendError) -> Option<ClientRecord> {
        let gone = self.registry.unregister(conn.id());
        conn.close(self.send_timeout).await;
        if let Some(record) = &gone {
            warn!(conn = %conn.id(), addr = %conn.addr(), name = %record.name, "dropping client: {reason}");
        }
        gone
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::Color;
    use std::io::ErrorKind;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
    use tokio_test::io::Builder as Mock;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn record(name: &str) -> ClientRecord {
        ClientRecord {
            name: name.to_string(),
            color: Color::Blue,
        }
    }

    fn chat(name: &str, text: &str) -> Message {
        Message::Chat {
            from: record(name),
            text: text.to_string(),
        }
    }

    /// Register a client backed by an in-memory pipe, returning the far end.
    fn join(registry: &Registry, name: &str) -> BufReader<DuplexStream> {
        let (near, far) = tokio::io::duplex(1024);
        let conn = Connection::new("127.0.0.1:4000".parse().unwrap(), near);
        registry.register(Arc::new(conn), record(name)).unwrap();
        BufReader::new(far)
    }

    async fn next_line(reader: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn delivers_to_everyone() {
        let registry = Arc::new(Registry::new());
        let mut alice = join(&registry, "alice");
        let mut bob = join(&registry, "bob");
        let broadcaster = Broadcaster::new(Arc::clone(&registry), TIMEOUT);

        broadcaster.broadcast(chat("alice", "hello")).await;

        assert_eq!(next_line(&mut alice).await, "alice|blue|hello\n");
        assert_eq!(next_line(&mut bob).await, "alice|blue|hello\n");
    }

    #[tokio::test]
    async fn failed_recipient_is_removed_once() {
        let registry = Arc::new(Registry::new());
        let mut alice = join(&registry, "alice");
        let broken = Mock::new().write_error(ErrorKind::BrokenPipe.into()).build();
        let broken = Arc::new(Connection::new("127.0.0.1:4001".parse().unwrap(), broken));
        registry
            .register(Arc::clone(&broken), record("mallory"))
            .unwrap();
        let mut bob = join(&registry, "bob");
        let broadcaster = Broadcaster::new(Arc::clone(&registry), TIMEOUT);

        broadcaster.broadcast(chat("alice", "hello")).await;

        for reader in [&mut alice, &mut bob] {
            assert_eq!(next_line(reader).await, "alice|blue|hello\n");
            assert_eq!(next_line(reader).await, "mallory|blue|has left the server\n");
        }
        assert_eq!(registry.names(), ["alice", "bob"]);
        assert!(broken.is_closed());

        // Nothing more is said about mallory.
        broadcaster.broadcast(chat("bob", "still here")).await;
        assert_eq!(next_line(&mut alice).await, "bob|blue|still here\n");
    }

    #[tokio::test]
    async fn stalled_recipient_does_not_block_others() {
        tokio::time::pause();
        let registry = Arc::new(Registry::new());
        let mut alice = join(&registry, "alice");
        // A pipe nobody drains: the write cannot finish.
        let (stalled, _far) = tokio::io::duplex(1);
        registry
            .register(
                Arc::new(Connection::new("127.0.0.1:4002".parse().unwrap(), stalled)),
                record("slowpoke"),
            )
            .unwrap();
        let broadcaster = Broadcaster::new(Arc::clone(&registry), TIMEOUT);

        broadcaster.broadcast(chat("alice", "ping")).await;

        assert_eq!(next_line(&mut alice).await, "alice|blue|ping\n");
        assert_eq!(
            next_line(&mut alice).await,
            "slowpoke|blue|has left the server\n"
        );
        assert_eq!(registry.names(), ["alice"]);
    }

    #[tokio::test]
    async fn send_to_reaches_one_client() {
        let registry = Arc::new(Registry::new());
        let mut alice = join(&registry, "alice");
        let bob_conn = {
            let (near, far) = tokio::io::duplex(1024);
            let conn = Arc::new(Connection::new("127.0.0.1:4003".parse().unwrap(), near));
            registry.register(Arc::clone(&conn), record("bob")).unwrap();
            (conn, BufReader::new(far))
        };
        let (bob, mut bob_reader) = bob_conn;
        let broadcaster = Broadcaster::new(Arc::clone(&registry), TIMEOUT);

        let private = Message::Private {
            from: "alice".to_string(),
            text: "psst".to_string(),
        };
        broadcaster.send_to(&bob, &private).await.unwrap();
        broadcaster.broadcast(chat("bob", "public")).await;

        assert_eq!(next_line(&mut bob_reader).await, "[PM from alice] psst\n");
        // alice only ever sees the public line.
        assert_eq!(next_line(&mut alice).await, "bob|blue|public\n");
    }
}
