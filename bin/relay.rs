use anyhow::Context;
use clap::Parser;
use relay::{init_tracing, serve, Arguments, ServerConfig};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Arguments::parse();

    init_tracing(args.console);

    let listener = TcpListener::bind(args.address)
        .await
        .context(format!("Failed to bind on {}", args.address))?;

    serve(listener, ServerConfig::from(&args)).await
}
