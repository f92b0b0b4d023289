//! # HTTP Status API
//!
//! The axum router for a running node's local HTTP interface.
//!
//! ## Endpoints
//!
//! | Method | Path            | Description                                  |
//! |--------|-----------------|----------------------------------------------|
//! | GET    | `/health`       | Liveness check                               |
//! | GET    | `/status`       | Node, peer group and storage summary         |
//! | GET    | `/peers`        | Current connections                          |
//! | GET    | `/items/:kind`  | Live items of one kind                       |
//! | POST   | `/notes`        | Publish a text note with the node's key      |
//! | DELETE | `/notes`        | Take down a note published with that key     |

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tessera_network::crypto::KeyPair;
use tessera_network::data::{AuthError, DataServiceError};
use tessera_network::peer_group::Direction;
use tessera_network::{Address, BroadcastResult, ServiceNode, TransportType};

use crate::metrics::SharedMetrics;
use crate::note::TextNote;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for all handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub node: Arc<ServiceNode>,
    /// Key for notes published through this API.
    pub keypair: Arc<KeyPair>,
    pub metrics: SharedMetrics,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/peers", get(peers_handler))
        .route("/items/:kind", get(items_handler))
        .route(
            "/notes",
            axum::routing::post(publish_handler).delete(remove_handler),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub node_id: String,
    pub transport: TransportType,
    pub address: Address,
    pub connections: usize,
    pub min_connections: usize,
    pub max_connections: usize,
    pub kinds: Vec<KindStatus>,
    /// RFC 3339 timestamp of the response.
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KindStatus {
    pub kind: String,
    pub items: usize,
    pub max_items: usize,
    pub ttl_millis: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub connection_id: String,
    pub address: Address,
    pub node_id: String,
    pub direction: Direction,
    /// Substrate-reported endpoint of an inbound peer. `address` is only
    /// what the peer claimed in that case.
    pub remote: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ItemInfo {
    pub id: String,
    pub owner: String,
    pub size: usize,
    pub created_at_millis: u64,
    pub sequence_number: u64,
}

#[derive(Debug, Deserialize)]
pub struct NoteRequest {
    pub text: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let node = &state.node;
    let peer_group = node.peer_group();
    let storage = node.data_service().storage();

    let mut kinds: Vec<KindStatus> = storage
        .kinds()
        .into_iter()
        .filter_map(|kind| storage.get_store(&kind))
        .map(|store| KindStatus {
            kind: store.meta_data().class_name().to_string(),
            items: store.len(),
            max_items: store.meta_data().max_map_size(),
            ttl_millis: store.meta_data().ttl_millis(),
        })
        .collect();
    kinds.sort_by(|a, b| a.kind.cmp(&b.kind));

    let connections = peer_group.num_connections();
    state.metrics.connected_peers.set(connections as i64);

    Json(StatusResponse {
        version: state.version.clone(),
        node_id: node.config().node_id.clone(),
        transport: node.config().transport_type,
        address: node.address().clone(),
        connections,
        min_connections: peer_group.config().min_connections,
        max_connections: peer_group.config().max_connections,
        kinds,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn peers_handler(State(state): State<AppState>) -> impl IntoResponse {
    let peers: Vec<PeerInfo> = state
        .node
        .peer_group()
        .all_connections()
        .iter()
        .map(|connection| PeerInfo {
            connection_id: connection.id().to_string(),
            address: connection.peer_address().clone(),
            node_id: connection.peer_node_id().to_string(),
            direction: connection.direction(),
            remote: connection.remote().map(str::to_string),
        })
        .collect();
    Json(peers)
}

async fn items_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> impl IntoResponse {
    let items: Vec<ItemInfo> = state
        .node
        .data_service()
        .items_of_kind(&kind)
        .iter()
        .map(|data| ItemInfo {
            id: data.id().to_hex(),
            owner: data.owner().to_hex(),
            size: data.item.payload_size(),
            created_at_millis: data.item.created_at_millis(),
            sequence_number: data.item.sequence_number(),
        })
        .collect();
    Json(items)
}

async fn publish_handler(
    State(state): State<AppState>,
    Json(request): Json<NoteRequest>,
) -> Response {
    let started = Instant::now();
    let result = state
        .node
        .data_service()
        .add_network_payload(&TextNote::new(request.text), &state.keypair)
        .await;
    state
        .metrics
        .publish_latency_seconds
        .observe(started.elapsed().as_secs_f64());
    broadcast_response(&state, result)
}

async fn remove_handler(
    State(state): State<AppState>,
    Json(request): Json<NoteRequest>,
) -> Response {
    let result = state
        .node
        .data_service()
        .remove_network_payload(&TextNote::new(request.text), &state.keypair)
        .await;
    broadcast_response(&state, result)
}

fn broadcast_response(
    state: &AppState,
    result: Result<BroadcastResult, DataServiceError>,
) -> Response {
    match result {
        Ok(result) => {
            state.metrics.record_broadcast(&result);
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(e) => {
            let status = match &e {
                DataServiceError::Auth(AuthError::NotOwner) => StatusCode::FORBIDDEN,
                DataServiceError::Storage(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::debug!(error = %e, "note request failed");
            (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tessera_network::{IoPool, NetworkConfig};
    use tower::ServiceExt;

    use crate::metrics::NodeMetrics;

    async fn test_app_state() -> AppState {
        let mut config = NetworkConfig {
            node_id: "api-test".to_string(),
            port: 0,
            ..NetworkConfig::default()
        };
        config.data.pow_difficulty = 4;
        let io_pool = Arc::new(IoPool::new("api-test", 16));
        let node = ServiceNode::start_with_kinds(config, io_pool, vec![TextNote::policy()])
            .await
            .unwrap();

        AppState {
            version: "0.1.0-test".into(),
            node: Arc::new(node),
            keypair: Arc::new(KeyPair::generate()),
            metrics: Arc::new(NodeMetrics::new().unwrap()),
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        send(router, req).await
    }

    async fn note(router: &Router, method: &str, text: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri("/notes")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&serde_json::json!({ "text": text })).unwrap(),
            ))
            .unwrap();
        send(router, req).await
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let state = test_app_state().await;
        let router = create_router(state.clone());
        let (status, json) = get(&router, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        state.node.shutdown().await;
    }

    #[tokio::test]
    async fn status_reports_node_and_peer_group() {
        let state = test_app_state().await;
        let router = create_router(state.clone());
        let (status, json) = get(&router, "/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["node_id"], "api-test");
        assert_eq!(json["transport"], "clear");
        assert_eq!(json["connections"], 0);
        assert_eq!(json["kinds"][0]["kind"], "TextNote");
        assert_eq!(json["kinds"][0]["items"], 0);
        assert_eq!(json["kinds"][0]["max_items"], 10_000);
        state.node.shutdown().await;
    }

    #[tokio::test]
    async fn published_note_is_listed() {
        let state = test_app_state().await;
        let router = create_router(state.clone());

        let (status, json) = note(&router, "POST", "hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["num_success"], 0);
        assert_eq!(json["num_failure"], 0);

        let (_, items) = get(&router, "/items/TextNote").await;
        let items = items.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["owner"], state.keypair.public_key().to_hex());

        let (_, status_json) = get(&router, "/status").await;
        assert_eq!(status_json["kinds"][0]["kind"], "TextNote");
        assert_eq!(status_json["kinds"][0]["items"], 1);
        state.node.shutdown().await;
    }

    #[tokio::test]
    async fn removed_note_disappears() {
        let state = test_app_state().await;
        let router = create_router(state.clone());

        note(&router, "POST", "short lived").await;
        let (status, _) = note(&router, "DELETE", "short lived").await;
        assert_eq!(status, StatusCode::OK);

        let (_, items) = get(&router, "/items/TextNote").await;
        assert!(items.as_array().unwrap().is_empty());
        state.node.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_kind_has_no_items() {
        let state = test_app_state().await;
        let router = create_router(state.clone());
        let (status, items) = get(&router, "/items/Nothing").await;

        assert_eq!(status, StatusCode::OK);
        assert!(items.as_array().unwrap().is_empty());
        state.node.shutdown().await;
    }
}
