use anyhow::Context as _;
use clap::{Parser, Subcommand};
use crisis_backend::{StoreConfig, open_store};
use crisis_domain::paths::{offline_queue_path, session_identity_path};
use crisis_sync::{
    ConflictPolicy, HttpRemote, LocalSession, OfflineQueue, SessionIdentity, SyncConfig,
    SyncEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crisis")]
#[command(about = "Crisis session client: local session files and server sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the local session as JSON
    Show,
    /// Write the local session to a timestamped export file
    Export {
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Replace the local session with an export file
    Import { file: PathBuf },
    /// Delete the local session
    Clear,
    /// Keep a session in sync with a server and log every change
    Sync {
        #[arg(long, default_value = "http://127.0.0.1:8787")]
        server: String,

        /// Holds the session id and the offline queue
        #[arg(long, default_value = "crisis-client")]
        client_dir: PathBuf,

        /// Session to join instead of the stored one
        #[arg(long)]
        session: Option<String>,

        #[arg(long, default_value_t = 5000)]
        poll_ms: u64,

        /// Let every poll overwrite unconfirmed local edits
        #[arg(long)]
        last_writer_wins: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Show => {
            let session = open_local()?;
            println!("{}", crisis_domain::export_json(session.state()));
        }
        Command::Export { out } => {
            let path = open_local()?.export_to(&out)?;
            println!("{}", path.display());
        }
        Command::Import { file } => open_local()?.import_from(&file)?,
        Command::Clear => open_local()?.clear()?,
        Command::Sync {
            server,
            client_dir,
            session,
            poll_ms,
            last_writer_wins,
        } => {
            run_sync(server, client_dir, session, poll_ms, last_writer_wins).await?;
        }
    }
    Ok(())
}

fn open_local() -> anyhow::Result<LocalSession> {
    let config = StoreConfig::from_env().context("invalid store configuration")?;
    let store = open_store(&config)?;
    LocalSession::open(store)
}

async fn run_sync(
    server: String,
    client_dir: PathBuf,
    session: Option<String>,
    poll_ms: u64,
    last_writer_wins: bool,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&client_dir)
        .with_context(|| format!("failed to create {}", client_dir.display()))?;
    let identity_path = session_identity_path(&client_dir);
    let session_id = match session {
        Some(raw) => {
            let id = crisis_domain::SessionId::parse(&raw)
                .with_context(|| format!("invalid session id {raw:?}"))?;
            SessionIdentity::store(&identity_path, &id)?;
            id
        }
        None => SessionIdentity::load_or_create(&identity_path)?,
    };
    let queue = Arc::new(OfflineQueue::open(offline_queue_path(&client_dir))?);
    for op in queue.snapshot() {
        tracing::info!(
            op_id = %op.id,
            session_id = %op.session_id,
            operation = ?op.operation,
            attempts = op.attempts,
            "pending offline operation"
        );
    }

    let config = SyncConfig {
        poll_interval: Duration::from_millis(poll_ms.max(100)),
        policy: if last_writer_wins {
            ConflictPolicy::LastWriterWins
        } else {
            ConflictPolicy::KeepUnconfirmedLocal
        },
        identity_path: Some(identity_path),
        ..SyncConfig::new(session_id)
    };
    let handle = SyncEngine::start(config, Arc::new(HttpRemote::new(server)?), queue).await;

    let mut changes = handle.subscribe();
    loop {
        {
            let snapshot = changes.borrow_and_update();
            tracing::info!(
                session_id = %snapshot.session_id,
                version = snapshot.state.meta.version,
                title = %snapshot.state.meta.title,
                severity = snapshot.state.meta.severity.as_str(),
                online = snapshot.online,
                queued = snapshot.queued,
                "session"
            );
        }
        if changes.changed().await.is_err() {
            break;
        }
    }
    Ok(())
}
