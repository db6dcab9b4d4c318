//! Liveness and identity endpoints
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::networks::SharedDb;
use crate::error::Result;
use crate::settings::{APP_NAME, APP_VERSION};

pub async fn root(State(db): State<SharedDb>) -> String {
    format!("{} node {}", APP_NAME, db.node_name())
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Health {
    pub status: String,
    pub node: String,
    /// Active cluster members, this node included
    pub peers: usize,
}

pub async fn health(State(db): State<SharedDb>) -> Result<Json<Health>> {
    let peers = db.cluster_peers()?.len();
    Ok(Json(Health {
        status: "ok".to_string(),
        node: db.node_name().to_string(),
        peers,
    }))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NodeInfo {
    pub app: String,
    pub version: String,
    pub node: String,
    pub advertise_addr: String,
}

#[instrument(skip(db))]
pub async fn about(State(db): State<SharedDb>) -> Json<NodeInfo> {
    Json(NodeInfo {
        app: APP_NAME.to_string(),
        version: APP_VERSION.to_string(),
        node: db.node_name().to_string(),
        advertise_addr: db.config().advertise_addr.to_string(),
    })
}
