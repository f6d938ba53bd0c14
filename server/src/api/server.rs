//! API server initialization

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::compression::CompressionLayer;

use super::auth::{AuthService, require_auth};
use super::middleware::{self, AllowedOrigins};
use super::routes::{admin, health, ingest, query, stream};
use crate::core::CoreApp;
use crate::core::constants::{DEFAULT_BODY_LIMIT, OTLP_BODY_LIMIT};

pub struct ApiServer {
    app: CoreApp,
    auth: Arc<AuthService>,
    allowed_origins: AllowedOrigins,
}

impl ApiServer {
    pub fn new(app: CoreApp) -> Self {
        let auth = app.auth.clone();
        let allowed_origins = AllowedOrigins::new(&app.config.server.host, app.config.server.port);

        Self {
            app,
            auth,
            allowed_origins,
        }
    }

    /// Returns CoreApp for graceful shutdown
    pub async fn start(self) -> Result<CoreApp> {
        let Self {
            app,
            auth,
            allowed_origins,
        } = self;

        let shutdown = app.shutdown.clone();

        let host = app.config.server.host.clone();
        let port = app.config.server.port;
        let addr = SocketAddr::new(host.parse()?, port);

        // OTLP ingestion: no bearer auth, larger bodies
        let otlp_routes = ingest::routes(app.store.clone(), app.gate.clone())
            .layer(DefaultBodyLimit::max(OTLP_BODY_LIMIT));

        // Query, stream and budget admin sit behind the bearer token;
        // fleet endpoints authenticate with the shared fleet key instead.
        let authed_routes = query::routes(app.store.clone(), app.budget.clone(), app.fleet.clone())
            .merge(stream::routes(
                app.store.clone(),
                app.hub.clone(),
                shutdown.subscribe(),
            ))
            .merge(admin::budget_routes(app.budget.clone(), app.gate.clone()))
            .layer(axum::middleware::from_fn_with_state(
                auth.clone(),
                require_auth,
            ));

        let api_v1 = authed_routes.merge(admin::fleet_routes(app.fleet.clone()));

        let router = Router::new()
            .route("/api/v1/health", get(health::health))
            .nest("/v1", otlp_routes)
            .nest("/api/v1", api_v1)
            .fallback(middleware::handle_404)
            .layer(CompressionLayer::new())
            .layer(middleware::cors(&allowed_origins))
            .layer(DefaultBodyLimit::max(DEFAULT_BODY_LIMIT));

        let listener = TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.wait())
        .await?;

        Ok(app)
    }
}
