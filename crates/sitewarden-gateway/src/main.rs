use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

mod app;
mod cli;
mod commands;
mod http;
mod shutdown;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sitewarden_gateway=info,sitewarden_scheduler=info,sitewarden_tasks=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    // load config: --config > SITEWARDEN_CONFIG env > ~/.sitewarden/sitewarden.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("SITEWARDEN_CONFIG").ok());
    let config = sitewarden_core::config::SitewardenConfig::load(config_path.as_deref())
        .unwrap_or_else(|e| {
            tracing::warn!("Config load failed ({}), using defaults", e);
            sitewarden_core::config::SitewardenConfig::default()
        });

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = sitewarden_scheduler::db::open(&db_path)?;

    let shutdown = shutdown::install();
    let state = Arc::new(app::AppState::new(config, db, shutdown)?);

    match cli.command {
        Command::Run {
            loop_if_idle,
            time_limit,
            verbose,
        } => commands::run(&state, loop_if_idle, time_limit, verbose).await,
        Command::Serve => serve(state).await,
        Command::List { site } => commands::list(&state, site),
        Command::Schedule(args) => commands::schedule(&state, args),
        Command::Enable { id } => commands::set_enabled(&state, id, true),
        Command::Disable { id } => commands::set_enabled(&state, id, false),
        Command::Delete { id } => commands::delete(&state, id),
        Command::RunNow { id } => commands::run_now(&state, id),
        Command::Pause => commands::set_paused(&state, true),
        Command::Resume => commands::set_paused(&state, false),
        Command::Status => commands::status(&state),
        Command::Bootstrap => commands::bootstrap(&state),
        Command::PurgeSite { site } => commands::purge_site(&state, site),
    }
}

async fn serve(state: Arc<app::AppState>) -> anyhow::Result<()> {
    let addr: SocketAddr =
        format!("{}:{}", state.config.gateway.bind, state.config.gateway.port).parse()?;
    let shutdown = state.shutdown.clone();
    let router = app::build_router(state);

    info!("Sitewarden gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
