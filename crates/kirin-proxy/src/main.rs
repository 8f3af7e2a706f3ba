use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kirin_proxy::{bootstrap, config::ProxyConfig, metrics::register_metrics, routes};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = ProxyConfig::from_env().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        std::io::Error::other(e.to_string())
    })?;
    let listen_addr = config.listen_addr;
    let allowed_origins = config.allowed_origins.clone();
    let rate_limit_rpm = config.rate_limit_rpm;

    tracing::info!("Starting kirin on {}", listen_addr);
    tracing::info!("Root key policy: {:?}", config.root_key_policy);
    tracing::info!(
        "Settlement check: {}",
        if config.verify_settlement {
            "preimage + payment backend"
        } else {
            "preimage only"
        }
    );
    if let Some(ref root) = config.static_root {
        tracing::info!("Serving static files from: {}", root);
    }

    let state = bootstrap::build_state(config).map_err(|e| {
        tracing::error!("Failed to initialize: {}", e);
        std::io::Error::other(e.to_string())
    })?;

    // Register Prometheus metrics
    register_metrics();

    // Drop quota counters of expired credentials
    state.authenticator.start_usage_cleanup();

    let state_data = web::Data::new(state);

    // Configure rate limiter
    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(rate_limit_rpm as u64)
        .finish()
        .ok_or_else(|| std::io::Error::other("invalid rate limiter configuration"))?;

    // Start HTTP server
    let server = HttpServer::new(move || {
        let cors = kirin_proxy::cors::build_cors(&allowed_origins);

        App::new()
            .app_data(state_data.clone())
            .app_data(web::PayloadConfig::new(10 * 1024 * 1024)) // 10MB body limit
            .wrap(Logger::default())
            .wrap(cors)
            .wrap(Governor::new(&governor_conf))
            .configure(routes::configure(&state_data))
            .default_service(web::to(routes::proxy::handle))
    })
    .bind(listen_addr)?
    .run();

    let result = server.await;
    tracing::info!("kirin stopped");
    result
}
