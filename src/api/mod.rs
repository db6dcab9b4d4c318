mod base;
mod networks;

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    error_handling::HandleErrorLayer, http::StatusCode, response::IntoResponse, routing, Router,
};
use tokio::time::Duration;
use tower::{BoxError, ServiceBuilder};
use tower_http::trace::TraceLayer;

pub mod paths;

pub use networks::{EntryBody, EntryResponse};

use crate::error::Result;
use crate::networkdb::NetworkDb;

/// Build the driver API over a running store
pub async fn api(db: Arc<NetworkDb>) -> Result<Router> {
    let api = Router::new()
        .route(paths::base::ROOT, routing::get(base::root))
        .route(paths::base::HEALTH, routing::get(base::health))
        .route(paths::base::ABOUT, routing::get(base::about))
        .route(paths::PEERS, routing::get(networks::cluster_peers))
        // Network membership
        .route(
            paths::networks::NETWORK,
            routing::post(networks::join_network).delete(networks::leave_network),
        )
        .route(paths::networks::PEERS, routing::get(networks::network_peers))
        // Table entries
        .route(paths::networks::TABLE, routing::get(networks::get_table))
        .route(
            paths::networks::ENTRY,
            routing::get(networks::get_entry)
                .post(networks::create_entry)
                .put(networks::update_entry)
                .delete(networks::delete_entry),
        )
        .layer(
            ServiceBuilder::new()
                // Handle errors from middleware
                .layer(HandleErrorLayer::new(handle_error))
                .load_shed()
                .timeout(Duration::from_secs(10)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(db);

    Ok(api)
}

async fn handle_error(error: BoxError) -> impl IntoResponse {
    if error.is::<tower::timeout::error::Elapsed>() {
        return (StatusCode::REQUEST_TIMEOUT, Cow::from("request timed out"));
    }

    if error.is::<tower::load_shed::error::Overloaded>() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Cow::from("service is overloaded, try again later"),
        );
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Cow::from(format!("Unhandled internal error: {}", error)),
    )
}
