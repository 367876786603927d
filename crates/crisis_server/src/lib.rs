use anyhow::Context as _;
use axum::Router;
use crisis_backend::{StoreConfig, optional_trimmed_path_from_env};
use crisis_domain::paths::CRISIS_WEB_DIST_DIR_ENV;
use std::net::SocketAddr;
use std::path::PathBuf;

pub mod engine;
mod idempotency;
pub mod server;

const DEFAULT_WEB_DIST_DIR: &str = "web/out";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub store: StoreConfig,
    /// Static files served for any path outside `/api`.
    pub web_dist_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            web_dist_dir: PathBuf::from(DEFAULT_WEB_DIST_DIR),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let store = StoreConfig::from_env().context("invalid store configuration")?;
        let web_dist_dir = optional_trimmed_path_from_env(CRISIS_WEB_DIST_DIR_ENV)?
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WEB_DIST_DIR));
        Ok(Self {
            store,
            web_dist_dir,
        })
    }

    /// Nothing touches the disk; used by tests and throwaway demos.
    pub fn ephemeral() -> Self {
        Self {
            store: StoreConfig::memory(),
            ..Self::default()
        }
    }
}

pub struct StartedServer {
    pub addr: SocketAddr,
    handle: Option<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

impl StartedServer {
    pub async fn wait(self) -> anyhow::Result<()> {
        let mut this = self;
        let handle = this.handle.take().context("server task already consumed")?;

        handle
            .await
            .context("server task panicked")?
            .context("server failed")?;
        Ok(())
    }
}

impl Drop for StartedServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

pub async fn start_server(addr: SocketAddr) -> anyhow::Result<StartedServer> {
    start_server_with_config(addr, ServerConfig::from_env()?).await
}

pub async fn start_server_with_config(
    addr: SocketAddr,
    config: ServerConfig,
) -> anyhow::Result<StartedServer> {
    let app: Router = server::router(&config)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let actual = listener.local_addr().context("failed to read local addr")?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.context("server failed")?;
        Ok(())
    });

    Ok(StartedServer {
        addr: actual,
        handle: Some(handle),
    })
}
