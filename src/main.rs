mod auth;
mod clients;
mod config;
mod db;
mod docs;
mod handlers;
mod models;
mod routes;
mod services;
mod utils;
mod ws;

use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use routes::create_router;
use docs::ApiDoc;
use config::Config;
use clients::app_service_client::AppServiceClient;
use db::{dbcolab::DbColab, PersistenceGateway};
use services::access_service::{AccessChecker, AccessService};
use services::share_link::ShareLinkSigner;
use ws::manager::HubManager;
use tracing::{info, error, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use std::panic;
use std::sync::Arc;
use std::time::Duration;

/// Shared state handed to every handler
pub struct AppState {
    pub config: Arc<Config>,
    pub hubs: Arc<HubManager>,
    pub access: Arc<dyn AccessChecker>,
    pub share_links: Option<ShareLinkSigner>,
}

#[tokio::main]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "colabri_realtime=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    // Initialize database connection if URL is provided
    let persistence: Option<Arc<dyn PersistenceGateway>> = match &config.db_url {
        Some(db_url) => match DbColab::new(db_url).await {
            Ok(db) => {
                info!("Database initialized successfully");
                Some(Arc::new(db))
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Documents will not be loaded or saved");
                None
            }
        },
        None => {
            warn!("No database URL configured - documents will not be loaded or saved");
            None
        }
    };

    // Access checks go through the app service when one is configured
    let app_service = match (&config.app_service_url, &config.cloud_auth_jwt_secret) {
        (Some(url), Some(secret)) => {
            match AppServiceClient::new(url.clone(), secret.clone(), config.cloud_service_name.clone()) {
                Ok(client) => Some(client),
                Err(e) => {
                    error!("{}", e);
                    None
                }
            }
        }
        _ => None,
    };
    let access = AccessService::new(
        app_service,
        config.is_development(),
        Duration::from_secs(config.access_cache_ttl_secs),
    );

    let share_links = config.share_link_secret.as_deref().map(ShareLinkSigner::new);
    if share_links.is_none() {
        warn!("No share link secret configured - public document links are disabled");
    }

    let codec = config.codec_kind().build();
    info!("Relaying '{}' payloads", codec.name());
    let hubs = HubManager::new(codec, persistence, config.hub_settings());

    let cors = cors_layer(&config.cors_origin_list());
    let state = Arc::new(AppState {
        config: Arc::new(config),
        hubs: hubs.clone(),
        access: Arc::new(access),
        share_links,
    });
    let address = state.config.server_address();

    // Combine all routes
    let app_routes = create_router(state)
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        // Add tracing layer
        .layer(TraceLayer::new_for_http());

    // Start the HTTP/API server
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", address));

    info!("🚀 Server running on http://{}", address);
    info!("📡 WebSocket available at ws://{}/ws/documents/{{doc_id}}", address);
    info!("📚 Swagger UI available at http://{}/swagger", address);

    let shutdown_hubs = hubs.clone();
    axum::serve(listener, app_routes)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown requested, closing hubs");
            shutdown_hubs.close_all();
        })
        .await
        .expect("Server failed to start");

    hubs.shutdown(Duration::from_secs(10)).await;
    info!("Server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}
