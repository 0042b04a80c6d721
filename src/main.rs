//! storelink-probe - send one request to the bookstore server and print the reply.
//!
//! ```text
//! storelink-probe [host:port] [json]
//! ```
//!
//! Without arguments it connects to the configured endpoint and sends
//! `{"action":"ping"}`. Useful for checking that a server is up and speaks
//! the framing protocol before starting one of the consoles.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storelink::blocking::BlockingClient;
use storelink::config::ClientConfig;
use storelink::transport::Endpoint;

const DEFAULT_REQUEST: &str = r#"{"action":"ping"}"#;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "storelink=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("storelink-probe v{}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1);
    let config = ClientConfig::load().context("Failed to load client config")?;
    let mut options = config.client_options();

    if let Some(addr) = args.next() {
        options.endpoint = Endpoint::parse(&addr)
            .ok_or_else(|| anyhow!("Expected host:port, got '{}'", addr))?;
    }

    let raw = args.next().unwrap_or_else(|| DEFAULT_REQUEST.to_string());
    let request: Value = serde_json::from_str(&raw).context("Request is not valid JSON")?;

    let mut client = BlockingClient::spawn(options).context("Failed to start I/O runtime")?;
    client.connect().context("Could not reach server")?;

    let started = std::time::Instant::now();
    let response = client.call(&request).context("Request failed")?;
    info!("Response in {:?}", started.elapsed());

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
