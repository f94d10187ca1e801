use clientportal::{app, auth, config::Config, db, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,clientportal=debug")))
        .init();

    let config = Config::from_env()?;

    let db_pool = db::connect(&config.database_url, 16).await?;
    db::migrate(&db_pool).await?;

    let clients = match &config.client_secrets {
        Some(path) => auth::Clients::from_file(path, &config.public_url).await.map_err(|err| err.0)?,
        None => {
            tracing::warn!("PORTAL_CLIENT_SECRETS not set; sign-in is disabled");
            auth::Clients::default()
        }
    };

    let bind = config.bind;
    let app = app(AppState::new(db_pool, config, clients));

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
