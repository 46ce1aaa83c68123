// Hub client entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file)
// 2. Load config
// 3. Open database, resolve the tournament
// 4. Assemble connection, router and registration components
// 5. Run the event loop until Ctrl+C, then unregister and save

use std::sync::Arc;
use std::time::Duration;

use dartplan_hub::api::HttpHubApi;
use dartplan_hub::app;
use dartplan_hub::config;
use dartplan_hub::transport::TungsteniteConnector;

use anyhow::Context;
use dartplan_core::store::SqliteStore;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("Hub client starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: tournament '{}', {} streaming endpoints",
        config.tournament.name,
        config.hub.endpoints.len()
    );

    // 3. Open database and resolve the tournament
    if let Some(parent) = config
        .db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db_path = config.db_path.to_string_lossy().to_string();
    let store = Arc::new(SqliteStore::open(&db_path).context("failed to open database")?);
    info!("Database opened at {db_path}");

    let tournament =
        app::resolve_tournament(&config, &store).context("failed to resolve tournament")?;
    info!(
        "Serving tournament {} ({} classes)",
        tournament.id,
        tournament.classes.len()
    );

    // 4. Assemble components
    let api = Arc::new(
        HttpHubApi::new(
            &config.hub.api_base_url,
            config.credentials.api_key.clone(),
            Duration::from_secs(config.connection.request_timeout_secs),
        )
        .context("failed to build Hub API client")?,
    );
    let hub = app::Hub::new(&config, tournament, Arc::new(TungsteniteConnector), api);

    // 5. Run until Ctrl+C
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
        }
    };
    app::run(
        hub,
        store,
        Duration::from_secs(config.connection.status_interval_secs),
        shutdown,
        true,
    )
    .await?;

    info!("Hub client shut down cleanly");
    Ok(())
}

/// Initialize tracing to log to `logs/dartplan-hub.log`.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("dartplan-hub.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("dartplan_hub=info,dartplan_core=info,warn")
            }),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
