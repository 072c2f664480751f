use std::net::SocketAddr;

use clap::Parser;

/// Command Line Arguments.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Arguments {
    /// Address to listen on.
    #[clap(short, long, value_parser, default_value = "127.0.0.1:12345")]
    pub address: SocketAddr,

    /// Address to publish console events on.
    #[clap(short, long, value_parser)]
    pub console: Option<SocketAddr>,

    /// Milliseconds a single write to a client may take before the client is dropped.
    #[clap(long, value_parser, default_value_t = 5000)]
    pub send_timeout_ms: u64,

    /// Consecutive accept failures tolerated before the server exits.
    #[clap(long, value_parser, default_value_t = 3)]
    pub accept_retries: u32,

    /// Longest line, in bytes, a client may send.
    #[clap(long, value_parser, default_value_t = 4096)]
    pub max_line_length: usize,
}
