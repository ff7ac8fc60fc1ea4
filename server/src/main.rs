use std::str::FromStr;

use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use server::config::Config;
use server::db::Database;
use server::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = Targets::from_str(std::env::var("RUST_LOG").as_deref().unwrap_or("info"))
        .expect("RUST_LOG should be a valid tracing filter");
    tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .finish()
        .with(filter)
        .try_init()?;

    let config = Config::from_env();
    info!("Database path: {}", config.db_path.display());

    let db = Database::open(config.db_path.clone()).await?;
    let bind_addr = config.bind_addr;
    let state = AppState::new(db, config);

    let router = server::build_router(state);

    info!("MoltDM relay listening at: {bind_addr}");
    let listener = TcpListener::bind(bind_addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
