use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::warn;

use crate::{
    config::AppConfig,
    handlers::{generate_jersey, health_check, test_status, upload_image},
    services::InferenceClient,
    storage::{Janitor, UploadStore, UPLOADS_ROUTE},
};

/// Shared, read-only per-process state. Requests never mutate it.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: UploadStore,
    pub client: InferenceClient,
    pub janitor: Janitor,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            store: UploadStore::new(config.upload_dir.clone()),
            client: InferenceClient::new(&config),
            janitor: Janitor::new(config.cleanup_delay),
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let config = state.config.clone();

    let api = Router::new()
        .route("/upload-image", post(upload_image))
        .route("/generate-jersey", post(generate_jersey))
        .route("/test", get(test_status));

    Router::new()
        .nest("/api", api)
        .route("/health", get(health_check))
        .nest_service(UPLOADS_ROUTE, ServeDir::new(&config.upload_dir))
        .nest_service("/catalogue", ServeDir::new(&config.catalogue_dir))
        .fallback_service(ServeDir::new(&config.public_dir))
        .layer(DefaultBodyLimit::max(config.body_limit_bytes))
        .layer(cors_layer(config.frontend_url.as_deref()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(frontend_url: Option<&str>) -> CorsLayer {
    let origin = frontend_url.and_then(|url| match HeaderValue::from_str(url) {
        Ok(origin) => Some(origin),
        Err(_) => {
            warn!("Ignoring FRONTEND_URL that is not a valid origin: {}", url);
            None
        }
    });

    match origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
            .allow_credentials(true),
        None => CorsLayer::permissive(),
    }
}
