use mimalloc::MiMalloc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The server binary requires a real config file with a non-empty
    // proxy_api_key. (Library code uses `config::CONFIG` which is
    // best-effort and does not validate.)
    let cfg = kirogate::config::Config::from_toml();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.basic.loglevel.clone()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    let cfg = resolve_remote_creds(cfg).await;

    let pool = kirogate::db::connect(cfg.basic.database_url.as_str()).await?;
    let store = Arc::new(kirogate::db::SqliteStore::new(pool));

    let addr = SocketAddr::from((cfg.basic.listen_addr, cfg.basic.listen_port));
    let state = kirogate::server::GatewayState::new(cfg, store);
    let app = kirogate::server::gateway_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server has shut down gracefully.");
    Ok(())
}

/// `gateway.creds_file` may be an http(s) URL. Remote credentials are
/// fetched once at startup and folded into the config as seed values;
/// rotations are not written back to the remote location.
async fn resolve_remote_creds(mut cfg: kirogate::config::Config) -> kirogate::config::Config {
    let location = cfg.gateway.creds_file.clone();
    if !location.starts_with("http://") && !location.starts_with("https://") {
        return cfg;
    }

    match kirogate::auth::credentials::fetch_credentials_url(&reqwest::Client::new(), &location)
        .await
    {
        Ok(stored) => {
            if let Some(token) = stored.refresh_token {
                cfg.gateway.refresh_token = token;
            }
            if let Some(region) = stored.region {
                cfg.gateway.region = region;
            }
            if let Some(arn) = stored.profile_arn {
                cfg.gateway.profile_arn = arn;
            }
            info!("Credentials loaded from {}", location);
        }
        Err(e) => {
            tracing::warn!("Failed to fetch credentials from {}: {e}", location);
        }
    }
    cfg.gateway.creds_file = String::new();
    cfg
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
