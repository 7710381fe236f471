use anyhow::Result;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use waypost_session_service::build_router;
use waypost_session_service::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config);

    let bind_addr = config.bind_addr;
    let router = build_router(config)?;
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(target: "waypost.http", addr = %listener.local_addr()?, "session service listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(target: "waypost.http", "session service stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(target: "waypost.http", error = %error, "failed to listen for shutdown signal");
    }
}
