use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{checkouts, handlers, middleware::metrics_middleware, ws};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // API routes
    let api_routes = Router::new()
        // Health and config
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        // Checkouts
        .route("/checkouts", post(checkouts::create_checkout))
        .route(
            "/checkouts/{id}",
            get(checkouts::get_checkout).delete(checkouts::delete_checkout),
        )
        .route("/checkouts/{id}/initialize", post(checkouts::initialize))
        .route("/checkouts/{id}/abort", post(checkouts::abort_checkout))
        .route("/checkouts/{id}/events", get(ws::ws_handler))
        // Readers
        .route(
            "/checkouts/{id}/readers/discover",
            post(checkouts::discover_readers),
        )
        .route(
            "/checkouts/{id}/readers/connect",
            post(checkouts::connect_reader),
        )
        .route(
            "/checkouts/{id}/readers/disconnect",
            post(checkouts::disconnect_reader),
        )
        // Payments
        .route("/checkouts/{id}/payments", post(checkouts::collect_payment))
        .route(
            "/checkouts/{id}/payments/{intent_id}/capture",
            post(checkouts::capture_payment),
        )
        .route(
            "/checkouts/{id}/payments/{intent_id}/cancel",
            post(checkouts::cancel_payment),
        )
        .route(
            "/checkouts/{id}/collection/cancel",
            post(checkouts::cancel_collection),
        );

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(metrics_middleware)),
        )
}
