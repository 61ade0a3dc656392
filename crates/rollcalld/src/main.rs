use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;
use rollcall_core::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod http;
mod store;
mod streaming;

#[derive(Parser)]
#[command(name = "rollcalld", about = "rollcall attendance daemon")]
struct Args {
    /// Configuration file (default: $ROLLCALL_CONFIG or /etc/rollcall/rollcall.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    // Create the schema up front so a broken database path fails at startup.
    store::SqliteStore::open(&config.paths.database).with_context(|| {
        format!("failed to open database {}", config.paths.database.display())
    })?;

    let bind = config.server.bind.clone();
    tracing::info!(
        bind = %bind,
        dataset = %config.paths.dataset_dir.display(),
        model = %config.paths.model_dir.display(),
        "rollcalld starting"
    );

    let state = web::Data::new(http::AppState::new(config));
    HttpServer::new(move || App::new().app_data(state.clone()).configure(http::routes))
        .bind(&bind)
        .with_context(|| format!("failed to bind {bind}"))?
        .run()
        .await?;

    tracing::info!("rollcalld shutting down");
    Ok(())
}
