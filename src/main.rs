use std::net::SocketAddr;

use backchat::{AppState, db, settings::Settings};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("backchat=debug,info")),
        )
        .init();

    let settings = Settings::from_env();
    let addr = settings.bind_addr;

    let db_pool = db::connect(&settings.database_url).await?;
    db::init(&db_pool).await?;

    let app = backchat::app(AppState::new(db_pool, settings))
        .into_make_service_with_connect_info::<SocketAddr>();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "chat gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
