use anyhow::{Context, Result};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use fieldbook_session::auth::{AuthManager, CredentialStore, IdentityProvider};
use fieldbook_session::config::{Config, LogFormat};
use fieldbook_session::http_client::AuthorizedClient;
use fieldbook_session::{middleware, routes};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    init_logging(&config);

    tracing::info!("🚀 Fieldbook session companion starting...");
    tracing::info!(
        "Server configured: {}:{}",
        config.server_host,
        config.server_port
    );

    // Open persisted session
    tracing::info!(
        "Opening session store at {}",
        config.session_db_file.display()
    );
    let store = CredentialStore::open(&config.session_db_file).with_context(|| {
        format!(
            "Failed to open session store at {}",
            config.session_db_file.display()
        )
    })?;

    let provider = IdentityProvider::new(
        &config.provider_url,
        config.http_connect_timeout,
        config.http_request_timeout,
    )?;

    // Restores any persisted session and schedules its renewal
    let auth_manager = AuthManager::new(provider.clone(), store);
    match auth_manager.current_session() {
        Some(session) => tracing::info!(
            "✅ Restored session for {} ({:?})",
            session.email,
            session.role
        ),
        None => tracing::info!("No persisted session, starting signed out"),
    }

    let http_client = Arc::new(AuthorizedClient::new(
        auth_manager.clone(),
        config.http_connect_timeout,
        config.http_request_timeout,
    )?);
    tracing::info!("✅ HTTP client initialized");

    let app_state = routes::AppState {
        auth_manager: auth_manager.clone(),
        http_client,
        provider,
    };

    let app = build_app(app_state);

    // Bind to configured host and port
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    print_startup_banner(&config);

    tracing::info!("🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    auth_manager.shutdown();
    tracing::info!("👋 Server shutdown complete");

    Ok(())
}

/// Initialize tracing; RUST_LOG overrides the configured level
fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Build the application with all routes and middleware
fn build_app(state: routes::AppState) -> axum::Router {
    // Gates are applied per route group inside `routes::app`
    routes::app(state)
        .layer(middleware::cors_layer())
        .layer(TraceLayer::new_for_http())
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    let banner = r#"
╔═══════════════════════════════════════════════════════════╗
║                                                           ║
║              ⚽ Fieldbook Session Companion               ║
║                                                           ║
╚═══════════════════════════════════════════════════════════╝
"#;

    println!("{}", banner);
    println!("  Version:     {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Server:      http://{}:{}",
        config.server_host, config.server_port
    );
    println!("  Provider:    {}", config.provider_url);
    println!("  Session DB:  {}", config.session_db_file.display());
    println!("  Log Level:   {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
