//! Storage server binary
//!
//! Runs the engine behind the length-prefixed binary protocol on a TCP
//! socket. Configuration comes from the environment; single-shard by
//! default, sharded when NOEMA_NUM_SHARDS is above one.

use noema_storage::server::StorageServer;
use noema_storage::{Engine, EngineConfig, FsyncPolicy};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let storage_path: PathBuf = env::var("NOEMA_STORAGE_PATH")
        .unwrap_or_else(|_| "./storage".to_string())
        .into();
    let host = env::var("NOEMA_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env_or("NOEMA_PORT", 7070);

    let config = EngineConfig {
        storage_path,
        num_shards: env_or("NOEMA_NUM_SHARDS", 1),
        vector_dimension: env_or("NOEMA_VECTOR_DIMENSION", 768),
        memory_threshold: env_or("NOEMA_MEMORY_THRESHOLD", 50_000),
        hnsw_ef_search: env_or("NOEMA_EF_SEARCH", 100),
        wal_fsync: match env::var("NOEMA_WAL_FSYNC").as_deref() {
            Ok("batch") => FsyncPolicy::Batch,
            _ => FsyncPolicy::Always,
        },
        ..Default::default()
    };

    log::info!("starting noema storage server");
    log::info!("  storage path: {}", config.storage_path.display());
    log::info!("  shards: {}", config.num_shards);
    log::info!("  vector dimension: {}", config.vector_dimension);
    log::info!("  listen address: {}:{}", host, port);

    let engine = Arc::new(Engine::open(config)?);
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    StorageServer::new(engine).run(addr).await?;

    log::info!("storage server stopped");
    Ok(())
}
