//! notes-server: realtime collaborative notes hub.
//!
//! Configuration comes from `NOTES_*` / `PORT` environment variables,
//! overridden by the flags below. `RUST_LOG` controls log output.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use notes_collab::{
    DocumentStore, MemoryStore, Note, NoteCatalog, NoteId, RocksStore, ServerConfig,
    SessionServer, StoreConfig, StoreError,
};

#[derive(Parser, Debug)]
#[command(name = "notes-server", version, about = "Realtime collaborative notes hub")]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<String>,

    /// RocksDB directory; notes are kept in memory when omitted
    #[arg(short, long, env = "NOTES_STORAGE_PATH")]
    storage: Option<PathBuf>,

    /// Admit every participant without consulting note permissions
    #[arg(long)]
    open_access: bool,

    /// Create an empty public note with this id at startup (repeatable)
    #[arg(long = "seed-note", value_name = "NOTE_ID")]
    seed_notes: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut config = ServerConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if args.storage.is_some() {
        config.storage_path = args.storage;
    }
    if args.open_access {
        config.enforce_access = false;
    }
    config.validate()?;

    match config.storage_path.clone() {
        Some(path) => {
            let store = Arc::new(RocksStore::open(StoreConfig::new(path))?);
            serve(config, store, &args.seed_notes).await
        }
        None => {
            log::warn!("No storage path configured, notes live in memory only");
            serve(config, Arc::new(MemoryStore::new()), &args.seed_notes).await
        }
    }
}

async fn serve<S>(
    config: ServerConfig,
    store: Arc<S>,
    seed_notes: &[String],
) -> Result<(), Box<dyn std::error::Error>>
where
    S: DocumentStore + NoteCatalog + 'static,
{
    for id in seed_notes {
        let note = Note::new(NoteId::from(id.as_str()), 0, id.as_str(), "", true);
        match store.insert(note).await {
            Ok(_) => log::info!("Seeded note {id}"),
            Err(StoreError::AlreadyExists(_)) => log::debug!("Note {id} already exists"),
            Err(e) => return Err(e.into()),
        }
    }

    let server = SessionServer::new(config, store);
    let listener = server.bind().await?;

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
            server.hub().shutdown().await;
        }
    }
    Ok(())
}
