use anyhow::{anyhow, Context};
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info};

use crate::{
    broadcast::Broadcaster,
    connection::Connection,
    protocol::{self, ClientRecord, Command, Message},
};

/// Where a connection is in its life.
///
/// `Connecting` is left as soon as the handler exists, so it has no variant.
#[derive(Debug)]
enum State {
    /// Waiting for the `name|color` line.
    Handshaking,
    /// Registered; relaying lines.
    Active(ClientRecord),
    /// Leaving, with the reason the connection ended.
    Closing(anyhow::Result<()>),
    /// All resources released.
    Closed(anyhow::Result<()>),
}

/// Outcome of waiting for the next line from the peer.
#[derive(Debug)]
enum Inbound {
    Line(String),
    /// The peer shut down its side.
    Eof,
    Failed(LinesCodecError),
    /// Someone else closed the connection, e.g. after a failed delivery.
    Closed,
}

/// Drives one client connection from handshake to departure.
pub struct ConnectionHandler<Reader> {
    lines: FramedRead<Reader, LinesCodec>,
    conn: Arc<Connection>,
    broadcaster: Broadcaster,
}

impl<Reader> ConnectionHandler<Reader>
where
    Reader: AsyncRead + Unpin,
{
    /// Handle the peer reading from `reader` and writing to `conn`.
    /// Lines longer than `max_line_length` bytes end the connection.
    pub fn new(
        reader: Reader,
        conn: Arc<Connection>,
        broadcaster: Broadcaster,
        max_line_length: usize,
    ) -> Self {
        Self {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_length)),
            conn,
            broadcaster,
        }
    }

    /// Run the connection to completion.
    ///
    /// # Termination
    /// The future resolves once the peer sent `/exit`, hung up, failed a read or
    /// a write, or the handshake was refused. The connection is closed and, if it
    /// was registered, unregistered and its departure announced exactly once.
    /// The returned error, if any, describes why the connection ended abnormally.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut state = State::Handshaking;
        loop {
            state = match state {
                State::Handshaking => self.handshake().await,
                State::Active(record) => self.step(record).await,
                State::Closing(result) => self.leave(result).await,
                State::Closed(result) => break result,
            }
        }
    }

    async fn read(&mut self) -> Inbound {
        tokio::select! {
            biased;
            _ = self.conn.closed() => Inbound::Closed,
            frame = self.lines.next() => match frame {
                Some(Ok(line)) => Inbound::Line(line),
                Some(Err(e)) => Inbound::Failed(e),
                None => Inbound::Eof,
            },
        }
    }

    async fn handshake(&mut self) -> State {
        let line = match self.read().await {
            Inbound::Line(line) => line,
            Inbound::Eof | Inbound::Closed => {
                return self.abort(Err(anyhow!("peer left before the handshake"))).await
            }
            Inbound::Failed(e) => {
                return self
                    .abort(Err(e).context("Failed to receive handshake"))
                    .await
            }
        };

        let record = match protocol::parse_handshake(&line) {
            Ok(record) => record,
            Err(e) => return self.abort(Err(e).context("Refused handshake")).await,
        };

        let registry = Arc::clone(self.broadcaster.registry());
        if let Err(e) = registry.register(Arc::clone(&self.conn), record.clone()) {
            // Not registered, so nobody else will ever write here.
            let _ = self
                .conn
                .send(
                    &Message::NameTaken(record.name.clone()).encode(),
                    self.broadcaster.send_timeout(),
                )
                .await;
            return self.abort(Err(e).context("Refused handshake")).await;
        }

        let welcome = Message::Welcome(record.name.clone()).encode();
        if let Err(e) = self
            .conn
            .send(&welcome, self.broadcaster.send_timeout())
            .await
        {
            // Nobody was told about the join yet, so leave quietly.
            registry.unregister(self.conn.id());
            return self.abort(Err(e).context("Failed to welcome client")).await;
        }

        info!(name = %record.name, color = %record.color, "client joined");
        self.broadcaster
            .broadcast(Message::Joined(record.clone()))
            .await;
        State::Active(record)
    }

    async fn step(&mut self, record: ClientRecord) -> State {
        match self.read().await {
            Inbound::Line(line) => self.dispatch(record, &line).await,
            Inbound::Eof | Inbound::Closed => State::Closing(Ok(())),
            Inbound::Failed(e) => State::Closing(Err(e).context("Failed to read from client")),
        }
    }

    async fn dispatch(&mut self, record: ClientRecord, line: &str) -> State {
        match protocol::decode(line) {
            Command::Exit => {
                debug!(name = %record.name, "exit requested");
                State::Closing(Ok(()))
            }
            Command::Empty => State::Active(record),
            Command::Chat(text) => {
                self.broadcaster
                    .broadcast(Message::Chat {
                        from: record.clone(),
                        text,
                    })
                    .await;
                State::Active(record)
            }
            Command::Private { to, text } => self.private(record, to, text).await,
            Command::Invalid => self.reply(record, Message::Usage).await,
            Command::Users => {
                let names = self.broadcaster.registry().names();
                self.reply(record, Message::Online(names)).await
            }
        }
    }

    async fn private(&mut self, record: ClientRecord, to: String, text: String) -> State {
        let Some(target) = self.broadcaster.registry().lookup_by_name(&to) else {
            return self.reply(record, Message::UnknownUser(to)).await;
        };
        let delivery = Message::Private {
            from: record.name.clone(),
            text: text.clone(),
        };
        match self.broadcaster.send_to(&target, &delivery).await {
            Ok(()) => {
                debug!(from = %record.name, %to, "private message delivered");
                self.reply(record, Message::PrivateSent { to, text }).await
            }
            // The target was evicted by the failed delivery.
            Err(_) => self.reply(record, Message::UnknownUser(to)).await,
        }
    }

    /// Answer the peer itself. A failed reply ends the connection.
    async fn reply(&mut self, record: ClientRecord, message: Message) -> State {
        match self.broadcaster.send_to(&self.conn, &message).await {
            Ok(()) => State::Active(record),
            Err(e) => State::Closing(Err(e).context("Failed to reply to client")),
        }
    }

    async fn leave(&self, result: anyhow::Result<()>) -> State {
        let gone = self.broadcaster.registry().unregister(self.conn.id());
        self.conn.close(self.broadcaster.send_timeout()).await;
        if let Some(record) = gone {
            info!(name = %record.name, "has left the server");
            self.broadcaster.broadcast(Message::Left(record)).await;
        }
        State::Closed(result)
    }

    async fn abort(&self, result: anyhow::Result<()>) -> State {
        self.conn.close(self.broadcaster.send_timeout()).await;
        State::Closed(result)
    }
}
