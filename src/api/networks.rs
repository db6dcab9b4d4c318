//! Network membership and table entry handlers
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::Result;
use crate::networkdb::{NetworkDb, PeerInfo};

pub type SharedDb = Arc<NetworkDb>;

/// Request body for creating or updating an entry.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EntryBody {
    pub value: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EntryResponse {
    pub key: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[instrument(skip(db))]
pub async fn cluster_peers(State(db): State<SharedDb>) -> Result<Json<Vec<PeerInfo>>> {
    Ok(Json(db.cluster_peers()?))
}

#[instrument(skip(db))]
pub async fn join_network(
    State(db): State<SharedDb>,
    Path(network_id): Path<String>,
) -> Result<StatusCode> {
    db.join_network(&network_id).await?;
    Ok(StatusCode::CREATED)
}

#[instrument(skip(db))]
pub async fn leave_network(
    State(db): State<SharedDb>,
    Path(network_id): Path<String>,
) -> Result<StatusCode> {
    db.leave_network(&network_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(db))]
pub async fn network_peers(
    State(db): State<SharedDb>,
    Path(network_id): Path<String>,
) -> Result<Json<Vec<PeerInfo>>> {
    Ok(Json(db.peers(&network_id)?))
}

#[instrument(skip(db))]
pub async fn get_table(
    State(db): State<SharedDb>,
    Path((network_id, table)): Path<(String, String)>,
) -> Result<Json<Vec<EntryResponse>>> {
    let mut entries: Vec<EntryResponse> = db
        .get_table_by_network(&table, &network_id)?
        .into_iter()
        .map(|(key, elem)| EntryResponse {
            key,
            value: String::from_utf8_lossy(&elem.value).into_owned(),
            owner: Some(elem.owner),
        })
        .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(Json(entries))
}

#[instrument(skip(db))]
pub async fn get_entry(
    State(db): State<SharedDb>,
    Path((network_id, table, key)): Path<(String, String, String)>,
) -> Result<Json<EntryResponse>> {
    let value = db.get_entry(&table, &network_id, &key)?;
    Ok(Json(EntryResponse {
        key,
        value: String::from_utf8_lossy(&value).into_owned(),
        owner: None,
    }))
}

#[instrument(skip(db, body))]
pub async fn create_entry(
    State(db): State<SharedDb>,
    Path((network_id, table, key)): Path<(String, String, String)>,
    Json(body): Json<EntryBody>,
) -> Result<StatusCode> {
    db.create_entry(&table, &network_id, &key, body.value.into_bytes())?;
    Ok(StatusCode::CREATED)
}

#[instrument(skip(db, body))]
pub async fn update_entry(
    State(db): State<SharedDb>,
    Path((network_id, table, key)): Path<(String, String, String)>,
    Json(body): Json<EntryBody>,
) -> Result<StatusCode> {
    db.update_entry(&table, &network_id, &key, body.value.into_bytes())?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(db))]
pub async fn delete_entry(
    State(db): State<SharedDb>,
    Path((network_id, table, key)): Path<(String, String, String)>,
) -> Result<StatusCode> {
    db.delete_entry(&table, &network_id, &key)?;
    Ok(StatusCode::NO_CONTENT)
}
