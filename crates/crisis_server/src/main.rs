use anyhow::Context as _;
use crisis_domain::paths::CRISIS_SERVER_ADDR_ENV;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let addr: SocketAddr = std::env::var(CRISIS_SERVER_ADDR_ENV)
        .unwrap_or_else(|_| "127.0.0.1:8787".to_owned())
        .parse()
        .with_context(|| format!("invalid {CRISIS_SERVER_ADDR_ENV}"))?;

    let server = crisis_server::start_server(addr).await?;
    tracing::info!(addr = %server.addr, "crisis_server listening");
    server.wait().await?;
    Ok(())
}
