use std::{fmt, str::FromStr};

/// Display color claimed by a client during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Color {
    /// Used whenever no valid color was given.
    #[default]
    Black,
    /// `red`
    Red,
    /// `green`
    Green,
    /// `blue`
    Blue,
}

impl Color {
    /// The wire token for this color.
    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Black => "black",
            Color::Red => "red",
            Color::Green => "green",
            Color::Blue => "blue",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a token is not one of the known colors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown color {0:?}")]
pub struct UnknownColor(pub String);

impl FromStr for Color {
    type Err = UnknownColor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "black" => Ok(Color::Black),
            "red" => Ok(Color::Red),
            "green" => Ok(Color::Green),
            "blue" => Ok(Color::Blue),
            other => Err(UnknownColor(other.to_string())),
        }
    }
}

/// Identity of a registered client. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientRecord {
    /// Claimed user name, never empty.
    pub name: String,
    /// Claimed display color.
    pub color: Color,
}

/// Why a handshake line was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// The name field was empty (or only whitespace).
    #[error("handshake carried an empty name")]
    EmptyName,
}

/// Parse the first line of a connection, `name|color`.
///
/// Fields past the second `|` are ignored. A missing or unknown color falls
/// back to [`Color::Black`].
pub fn parse_handshake(line: &str) -> Result<ClientRecord, HandshakeError> {
    let mut fields = line.split('|');
    let name = fields.next().unwrap_or_default().trim();
    if name.is_empty() {
        return Err(HandshakeError::EmptyName);
    }
    let color = fields
        .next()
        .and_then(|token| token.trim().parse().ok())
        .unwrap_or_default();
    Ok(ClientRecord {
        name: name.to_string(),
        color,
    })
}

/// A decoded line from a client that has completed its handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/exit`, any case.
    Exit,
    /// `/pm <to> <text>`.
    Private {
        /// Name of the recipient.
        to: String,
        /// Message body, verbatim.
        text: String,
    },
    /// `/pm` without a recipient or body.
    Invalid,
    /// `/users`, any case.
    Users,
    /// A blank line.
    Empty,
    /// Everything else is chat for everyone.
    Chat(String),
}

const PM_PREFIX: &str = "/pm ";

/// Decode one line sent by an active client.
pub fn decode(line: &str) -> Command {
    if let Some(rest) = line.strip_prefix(PM_PREFIX) {
        // "/pm", target, remaining text: at most three tokens.
        return match rest.split_once(' ') {
            Some((to, text)) if !to.is_empty() => Command::Private {
                to: to.to_string(),
                text: text.to_string(),
            },
            _ => Command::Invalid,
        };
    }
    if line.eq_ignore_ascii_case("/exit") {
        return Command::Exit;
    }
    if line.eq_ignore_ascii_case("/users") {
        return Command::Users;
    }
    if line.trim().is_empty() {
        return Command::Empty;
    }
    Command::Chat(line.to_string())
}

/// Everything the server ever writes to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake acknowledgement, sent to the new client only.
    Welcome(String),
    /// A chat line for everyone.
    Chat {
        /// Author of the line.
        from: ClientRecord,
        /// The line itself.
        text: String,
    },
    /// Presence: a client completed its handshake.
    Joined(ClientRecord),
    /// Presence: a client went away.
    Left(ClientRecord),
    /// Private delivery to the recipient.
    Private {
        /// Sender name.
        from: String,
        /// Message body.
        text: String,
    },
    /// Private delivery confirmation to the sender.
    PrivateSent {
        /// Recipient name.
        to: String,
        /// Message body.
        text: String,
    },
    /// The target of a private message is not connected.
    UnknownUser(String),
    /// Another live client already holds this name.
    NameTaken(String),
    /// `/pm` was missing its recipient or body.
    Usage,
    /// Reply to `/users`.
    Online(Vec<String>),
}

impl Message {
    /// Render the message as a single newline-terminated line.
    ///
    /// Text is not escaped, so a `|` inside chat text is indistinguishable
    /// from a field delimiter to a naive reader.
    pub fn encode(&self) -> String {
        let mut line = match self {
            Message::Welcome(name) => format!("welcome {name}"),
            Message::Chat { from, text } => format!("{}|{}|{text}", from.name, from.color),
            Message::Joined(who) => format!("{}|{}|has joined the server", who.name, who.color),
            Message::Left(who) => format!("{}|{}|has left the server", who.name, who.color),
            Message::Private { from, text } => format!("[PM from {from}] {text}"),
            Message::PrivateSent { to, text } => format!("[PM to {to}] {text}"),
            Message::UnknownUser(name) => format!("User '{name}' not found."),
            Message::NameTaken(name) => format!("Name '{name}' is already taken."),
            Message::Usage => "Usage: /pm <name> <message>".to_string(),
            Message::Online(names) => format!("Online: {}", names.join(", ")),
        };
        line.push('\n');
        line
    }
}
