use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tutor_signal::api;
use tutor_signal::clock::SystemClock;
use tutor_signal::config::{Config, LogFormat};
use tutor_signal::signaling::SignalingServer;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing(LogFormat::from_env());

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    let server = Arc::new(SignalingServer::new(
        config.rooms.clone(),
        Arc::new(SystemClock),
    ));
    let maintenance = server.spawn_maintenance();

    let routes = api::routes(server, config.ice.clone(), &config.server.cors_origin);
    let bind_address = config.bind_address();

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        cors_origin = %config.server.cors_origin,
        ttl_secs = config.rooms.ttl.as_secs(),
        grace_secs = config.rooms.grace_period.as_secs(),
        stun_servers = config.ice.stun_servers.len(),
        turn_servers = config.ice.turn_servers.len(),
        "Signaling server starting"
    );

    let (_, serving) = warp::serve(routes).bind_with_graceful_shutdown(bind_address, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown requested");
    });
    serving.await;

    maintenance.abort();
    tracing::info!("Signaling server stopped");
}
