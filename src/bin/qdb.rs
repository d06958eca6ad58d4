//! QDB server binary.
//!
//! Configuration comes from the environment (see `ServerConfig::from_env`).
//! `QDB_DATABASES` lists the databases to mount, comma separated; each is
//! opened from `{QDB_DATA_DIR}/{name}/{name}.db`, created if missing.
//!
//! ```bash
//! QDB_DATABASES=shop,blog QDB_BIND_ADDR=127.0.0.1:3000 RUST_LOG=qdb=debug qdb
//! ```

use qdb::{Qdb, QdbServer, ServerConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let names: Vec<String> = std::env::var("QDB_DATABASES")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect();

    if names.is_empty() {
        info!("QDB_DATABASES is empty; starting with no databases mounted");
    }

    let server = QdbServer::new(config.clone());
    for name in &names {
        let db = Qdb::open_with(name, &config.data_dir, &config.database, None).await?;
        server.mount_db(db, None, Vec::new())?;
    }

    let handle = server.listen().await?;
    info!(addr = %handle.local_addr(), "press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
    }

    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
