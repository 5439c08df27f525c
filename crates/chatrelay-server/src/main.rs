//! chatrelay: streaming chat relay in front of Dify and SiliconFlow.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

mod routes;
mod state;

use chatrelay_chat::{AdapterSet, ProviderSettings};
use chatrelay_core::{load_app_seed, RelayConfig};
use chatrelay_store::SqliteStore;
use state::AppState;

fn resolve_data_dir() -> PathBuf {
    std::env::var("CHATRELAY_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()));
            if let Some(dir) = exe_dir {
                let parent_data = dir.join("../data");
                if parent_data.exists() {
                    return parent_data;
                }
            }
            PathBuf::from("data")
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--help" | "-h" | "help" => {
                println!("chatrelay: streaming chat relay for Dify and SiliconFlow apps");
                println!();
                println!("Usage: chatrelay");
                println!();
                println!("Environment:");
                println!("  PORT                       HTTP port (default 3010)");
                println!("  CHATRELAY_DATA_DIR         Data directory (db/, apps.json, providers.json)");
                println!("  CHATRELAY_SYSTEM_USER_ID   Owner for anonymous turns (default 1)");
                println!("  SILICONFLOW_VLM_URL        Image+text endpoint override");
                println!("  RUST_LOG                   Log filter (default info)");
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: {}. Use 'chatrelay help' for usage.", other);
                std::process::exit(1);
            }
        }
    }

    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let config = RelayConfig::from_env(&data_dir)?;
    let port = config.port;

    let store = SqliteStore::open(&config.data_paths.db)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;
    let apps = load_app_seed(&config.data_paths.apps_file)?;
    let seeded = store.seed_apps(&apps)?;
    info!("App registry: {} apps seeded from {}", seeded, config.data_paths.apps_file.display());

    let settings = ProviderSettings::load(&config.data_paths.providers_file);
    let client = settings.build_client()?;
    let adapters = AdapterSet::http(client, &settings);

    let state = Arc::new(AppState::new(config, Arc::new(store), &settings, adapters));
    let app = routes::build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("chatrelay listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
