use crypto_ledger_api::config::Config;
use crypto_ledger_api::connection::MySqlConnector;
use crypto_ledger_api::environment::DatabaseRegistry;
use crypto_ledger_api::server::ApiServer;
use crypto_ledger_api::Result;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    // Load configuration first to get the log level
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt::init();
            error!("Failed to load configuration: {}", e.user_message());
            error!("Configuration error details: {}", e.detailed_message());
            return Err(e);
        }
    };

    init_tracing(&config);

    info!("Starting transactions API");
    info!("Log level set to: {}", config.server.log_level);
    info!("Request timeout: {}s", config.server.request_timeout_secs);
    info!(
        "Pool settings: max_open={} max_idle={} backoff={}ms",
        config.pool.max_open_connections,
        config.pool.max_idle_connections,
        config.pool.failure_backoff_ms
    );

    let registry = match DatabaseRegistry::from_env() {
        Ok(registry) => registry,
        Err(e) => {
            error!("Database configuration error: {}", e.detailed_message());
            return Err(e);
        }
    };

    for db in registry.configs() {
        info!(database_id = %db.id, "Configured database: {}", db.masked_connection_url());
    }

    let server = ApiServer::new(config, registry, MySqlConnector::new());

    match server.run(setup_shutdown_signal()).await {
        Ok(()) => {
            info!("Server stopped normally");
            Ok(())
        }
        Err(e) => {
            error!("Server failed: {}", e.user_message());
            error!("Server error details: {}", e.detailed_message());
            Err(e)
        }
    }
}

fn init_tracing(config: &Config) {
    let log_level = match config.server.log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    if config.server.log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(log_level)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_max_level(log_level).init();
    }
}

/// Set up graceful shutdown signal handling
async fn setup_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
