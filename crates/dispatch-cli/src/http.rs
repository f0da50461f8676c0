//! Client/worker HTTP surface (§6). Thin handlers: every request is
//! translated into an [`IngressEvent`] pushed onto the bounded queue owned
//! by the tick loop, and the handler does nothing with tree state itself
//! beyond filtering/projecting the read-only snapshots it gets back.
//!
//! Grounded on the teacher's `serve_cmd.rs` (`AppError` -> `IntoResponse`,
//! `build_router`/`run_serve` with graceful shutdown, tower-`oneshot` test
//! style); query/edit semantics follow `wsQuery.py`/`wsEdit.py`/
//! `poolshares.py` from the original source.

use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;

use dispatch_core::ingress::{AdminEdit, IngressEvent, IngressSender};
use dispatch_core::model::{CommandId, CommandStatus, Node, NodeId, NodeStatus, PoolShareId};
use dispatch_core::tree::GraphSubmission;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }

    /// Maps a rejected mutation (`anyhow::Error` from a tree method) onto a
    /// status code by sniffing its message, mirroring the teacher's
    /// pragmatic `AppError::internal`/`not_found` split -- the tree's own
    /// methods return plain `anyhow::Result`, not a typed error enum, so
    /// there is nothing finer-grained to match on.
    fn from_rejection(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        if message.contains("unknown") {
            Self {
                status: StatusCode::NOT_FOUND,
                message,
            }
        } else {
            Self {
                status: StatusCode::BAD_REQUEST,
                message,
            }
        }
    }

    /// A full ingress queue (spec §5 backpressure policy): the caller
    /// should retry, so this maps to 503 rather than 500.
    fn queue_full() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "ingress queue is full".to_string(),
        }
    }

    /// The tick loop dropped the reply channel -- only possible during
    /// shutdown.
    fn loop_gone() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "dispatch loop is shutting down".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub ingress: IngressSender,
}

/// Sends an event built around a fresh oneshot reply pair, returning the
/// receiver's answer. Centralizes the "queue full" / "loop gone" mapping
/// every handler would otherwise repeat.
async fn call<T>(
    ingress: &IngressSender,
    build: impl FnOnce(oneshot::Sender<T>) -> IngressEvent,
) -> Result<T, AppError> {
    let (tx, rx) = oneshot::channel();
    ingress
        .send(build(tx))
        .await
        .map_err(|_| AppError::queue_full())?;
    rx.await.map_err(|_| AppError::loop_gone())
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(ingress: IngressSender) -> Router {
    Router::new()
        .route("/graphs/", axum::routing::post(submit_graph))
        .route("/query", get(query_nodes))
        .route("/edit", put(edit_nodes))
        .route("/pause", put(pause_nodes))
        .route("/resume", put(resume_nodes))
        .route(
            "/poolshares/",
            get(list_pool_shares).post(create_pool_share),
        )
        .route("/poolshares/{id}/", get(get_pool_share))
        .route("/nodes/{id}/dispatchKey/", put(set_dispatch_key))
        .route("/nodes/{id}/maxRN/", put(set_max_rn))
        .route(
            "/rendernodes/{name}/commands/{id}/",
            put(command_status_update),
        )
        .route("/rendernodes/{name}/", put(heartbeat))
        .layer(CorsLayer::permissive())
        .with_state(AppState { ingress })
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(ingress: IngressSender, bind: &str, port: u16) -> Result<()> {
    let app = build_router(ingress);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("dispatchd serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("dispatchd serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Query / filtering helpers
// ---------------------------------------------------------------------------

/// A node serialized to JSON, filtered by `constraint_<field>=<value>` and
/// projected down to `attr=<field>` if any were given. Filtering and
/// projection happen here, not in `dispatch-core` -- presentation logic
/// over a read-only snapshot, not tree-mutation business logic.
fn constraints_from(params: &[(String, String)]) -> Vec<(String, String)> {
    params
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix("constraint_")
                .map(|field| (field.to_string(), v.clone()))
        })
        .collect()
}

fn attrs_from(params: &[(String, String)]) -> Vec<String> {
    params
        .iter()
        .filter(|(k, _)| k == "attr")
        .map(|(_, v)| v.clone())
        .collect()
}

fn json_value_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        Value::Bool(b) => expected.parse::<bool>().map(|e| *b == e).unwrap_or(false),
        Value::Number(n) => expected
            .parse::<f64>()
            .ok()
            .and_then(|e| n.as_f64().map(|nv| nv == e))
            .unwrap_or(false),
        Value::Null => expected.is_empty(),
        other => other.to_string() == expected,
    }
}

fn passes_constraints(node: &Value, constraints: &[(String, String)]) -> bool {
    constraints.iter().all(|(field, expected)| {
        node.get(field)
            .map(|v| json_value_matches(v, expected))
            .unwrap_or(false)
    })
}

fn project(node: Value, attrs: &[String]) -> Value {
    if attrs.is_empty() {
        return node;
    }
    let Value::Object(fields) = node else {
        return node;
    };
    let mut projected = serde_json::Map::new();
    for attr in attrs {
        if let Some(v) = fields.get(attr) {
            projected.insert(attr.clone(), v.clone());
        }
    }
    Value::Object(projected)
}

/// Fetches the full node snapshot and returns the ids passing the given
/// constraints, for the bulk `/edit`, `/pause`, `/resume` endpoints.
async fn matching_node_ids(
    ingress: &IngressSender,
    constraints: &[(String, String)],
) -> Result<Vec<NodeId>, AppError> {
    let nodes: Vec<Node> = call(ingress, |reply| IngressEvent::Query { reply }).await?;
    let matched = nodes
        .into_iter()
        .filter(|n| {
            let value = serde_json::to_value(n).unwrap_or(Value::Null);
            passes_constraints(&value, constraints)
        })
        .map(|n| n.id)
        .collect();
    Ok(matched)
}

// ---------------------------------------------------------------------------
// Handlers -- client-facing
// ---------------------------------------------------------------------------

async fn submit_graph(
    State(state): State<AppState>,
    Json(submission): Json<GraphSubmission>,
) -> Result<axum::response::Response, AppError> {
    let ids = call(&state.ingress, |reply| IngressEvent::SubmitGraph {
        submission,
        reply,
    })
    .await?
    .map_err(AppError::from_rejection)?;

    Ok((StatusCode::CREATED, Json(ids)).into_response())
}

async fn query_nodes(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<axum::response::Response, AppError> {
    let constraints = constraints_from(&params);
    let attrs = attrs_from(&params);

    let nodes: Vec<Node> = call(&state.ingress, |reply| IngressEvent::Query { reply }).await?;
    let results: Vec<Value> = nodes
        .iter()
        .map(|n| serde_json::to_value(n).unwrap_or(Value::Null))
        .filter(|v| passes_constraints(v, &constraints))
        .map(|v| project(v, &attrs))
        .collect();

    Ok(Json(results).into_response())
}

/// Parses `update_status` as either the status's canonical name
/// (`"ready"`, `"blocked"`, ...) or its declaration-order ordinal, since
/// the spec's `<int>` and the model's string-keyed `NodeStatus` disagree
/// and the model is what actually exists (see DESIGN.md Open Question
/// decisions).
fn parse_node_status(raw: &str) -> Result<NodeStatus, AppError> {
    if let Ok(status) = raw.parse::<NodeStatus>() {
        return Ok(status);
    }
    if let Ok(ordinal) = raw.parse::<u8>() {
        const ORDER: [NodeStatus; 7] = [
            NodeStatus::Blocked,
            NodeStatus::Ready,
            NodeStatus::Running,
            NodeStatus::Done,
            NodeStatus::Error,
            NodeStatus::Canceled,
            NodeStatus::Paused,
        ];
        if let Some(status) = ORDER.get(ordinal as usize) {
            return Ok(*status);
        }
    }
    Err(AppError::bad_request(format!(
        "invalid update_status value: {raw}"
    )))
}

async fn edit_nodes(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<axum::response::Response, AppError> {
    let update_status = params
        .iter()
        .find(|(k, _)| k == "update_status")
        .map(|(_, v)| v.clone())
        .ok_or_else(|| AppError::bad_request("missing update_status"))?;
    let status = parse_node_status(&update_status)?;

    let constraints: Vec<(String, String)> = params
        .into_iter()
        .filter(|(k, _)| k != "update_status")
        .filter(|(k, _)| k.starts_with("constraint_"))
        .map(|(k, v)| (k.strip_prefix("constraint_").unwrap().to_string(), v))
        .collect();

    let ids = matching_node_ids(&state.ingress, &constraints).await?;
    for node in &ids {
        call(&state.ingress, |reply| IngressEvent::AdminEdit {
            edit: AdminEdit::SetStatus {
                node: *node,
                status,
            },
            reply,
        })
        .await?
        .map_err(AppError::from_rejection)?;
    }

    Ok(Json(serde_json::json!({ "updated": ids })).into_response())
}

async fn set_paused(
    state: AppState,
    params: Vec<(String, String)>,
    paused: bool,
) -> Result<axum::response::Response, AppError> {
    let constraints = constraints_from(&params);
    let ids = matching_node_ids(&state.ingress, &constraints).await?;
    for node in &ids {
        call(&state.ingress, |reply| IngressEvent::AdminEdit {
            edit: AdminEdit::SetPaused {
                node: *node,
                paused,
            },
            reply,
        })
        .await?
        .map_err(AppError::from_rejection)?;
    }
    Ok(Json(serde_json::json!({ "updated": ids })).into_response())
}

async fn pause_nodes(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<axum::response::Response, AppError> {
    set_paused(state, params, true).await
}

async fn resume_nodes(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<axum::response::Response, AppError> {
    set_paused(state, params, false).await
}

#[derive(Debug, Deserialize)]
struct CreatePoolShareBody {
    pool: String,
    node: u64,
    #[serde(rename = "maxRN")]
    max_rn: i64,
}

async fn list_pool_shares(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let shares = call(&state.ingress, |reply| IngressEvent::ListPoolShares { reply }).await?;
    Ok(Json(shares).into_response())
}

async fn get_pool_share(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<axum::response::Response, AppError> {
    let shares = call(&state.ingress, |reply| IngressEvent::ListPoolShares { reply }).await?;
    shares
        .into_iter()
        .find(|s| s.id == PoolShareId(id))
        .map(|s| Json(s).into_response())
        .ok_or_else(|| AppError::not_found(format!("pool share {id} not found")))
}

async fn create_pool_share(
    State(state): State<AppState>,
    Json(body): Json<CreatePoolShareBody>,
) -> Result<axum::response::Response, AppError> {
    let id = call(&state.ingress, |reply| IngressEvent::CreatePoolShare {
        pool: body.pool,
        node: NodeId(body.node),
        max_rn: body.max_rn,
        reply,
    })
    .await?
    .map_err(AppError::from_rejection)?;

    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id.0 }))).into_response())
}

#[derive(Debug, Deserialize)]
struct DispatchKeyBody {
    #[serde(rename = "dispatchKey")]
    dispatch_key: i64,
}

async fn set_dispatch_key(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<DispatchKeyBody>,
) -> Result<axum::response::Response, AppError> {
    call(&state.ingress, |reply| IngressEvent::AdminEdit {
        edit: AdminEdit::SetDispatchKey {
            node: NodeId(id),
            dispatch_key: body.dispatch_key,
        },
        reply,
    })
    .await?
    .map_err(AppError::from_rejection)?;

    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, Deserialize)]
struct MaxRnBody {
    #[serde(rename = "maxRN")]
    max_rn: i64,
}

async fn set_max_rn(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<MaxRnBody>,
) -> Result<axum::response::Response, AppError> {
    let node_id = NodeId(id);
    let nodes: Vec<Node> = call(&state.ingress, |reply| IngressEvent::Query { reply }).await?;
    let node = nodes
        .into_iter()
        .find(|n| n.id == node_id)
        .ok_or_else(|| AppError::not_found(format!("node {id} not found")))?;

    let mut share_ids = node.pool_shares.values().copied();
    let pool_share = share_ids
        .next()
        .ok_or_else(|| AppError::bad_request(format!("node {id} belongs to no pool")))?;
    if share_ids.next().is_some() {
        return Err(AppError::bad_request(format!(
            "node {id} belongs to more than one pool; use /poolshares/<id>/ instead"
        )));
    }

    call(&state.ingress, |reply| IngressEvent::AdminEdit {
        edit: AdminEdit::SetMaxRn {
            pool_share,
            max_rn: body.max_rn,
        },
        reply,
    })
    .await?
    .map_err(AppError::from_rejection)?;

    Ok(StatusCode::OK.into_response())
}

// ---------------------------------------------------------------------------
// Handlers -- worker-initiated
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CommandStatusUpdateBody {
    status: CommandStatus,
    completion: f64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    stats: Option<Value>,
}

async fn command_status_update(
    State(state): State<AppState>,
    Path((render_node, id)): Path<(String, u64)>,
    Json(body): Json<CommandStatusUpdateBody>,
) -> Result<axum::response::Response, AppError> {
    call(&state.ingress, |reply| IngressEvent::CommandStatusUpdate {
        render_node,
        command: CommandId(id),
        status: body.status,
        completion: body.completion,
        message: body.message,
        stats: body.stats,
        reply,
    })
    .await?
    .map_err(AppError::from_rejection)?;

    Ok(StatusCode::OK.into_response())
}

/// Heartbeat endpoint. The spec describes the effect ("updating
/// `last_alive_time`") without naming a path; `PUT /rendernodes/<name>/`
/// was chosen as the natural REST spelling of "refresh this render node's
/// liveness", documented in DESIGN.md.
async fn heartbeat(
    State(state): State<AppState>,
    Path(render_node): Path<String>,
) -> Result<axum::response::Response, AppError> {
    state
        .ingress
        .send(IngressEvent::Heartbeat {
            render_node,
            at: chrono::Utc::now(),
        })
        .await
        .map_err(|_| AppError::queue_full())?;

    Ok(StatusCode::OK.into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use dispatch_core::ingress;
    use dispatch_core::loop_driver::DispatchLoop;
    use dispatch_core::model::LicenseManager;
    use dispatch_core::persistence::NullPersistence;
    use dispatch_core::tree::{DispatchTree, SubmittedNode};

    use super::*;

    fn spawn_loop() -> (IngressSender, tokio::task::JoinHandle<()>, tokio_util::sync::CancellationToken) {
        let (tx, rx) = ingress::channel(16);
        let cancel = tokio_util::sync::CancellationToken::new();
        let loop_driver = DispatchLoop::new(
            DispatchTree::new(),
            LicenseManager::new(),
            std::sync::Arc::new(NullPersistence),
            dispatch_core::DispatchConfig::default(),
        );
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            let _ = loop_driver.run(rx, cancel_clone).await;
        });
        (tx, handle, cancel)
    }

    async fn send_request(app: Router, request: Request<Body>) -> axum::response::Response {
        app.oneshot(request).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn simple_submission(name: &str) -> GraphSubmission {
        GraphSubmission {
            name: name.to_string(),
            pool: "farm-a".to_string(),
            max_rn: None,
            tags: Default::default(),
            root: SubmittedNode::Task {
                name: "render".to_string(),
                dispatch_key: 0,
                runner: "maya".to_string(),
                arguments: Default::default(),
                environment: Default::default(),
                requirements: Default::default(),
                min_cores: 1,
                max_cores: 1,
                ram_use: 1,
                license: None,
                validation_expression: None,
                start: 1,
                end: 1,
                packet_size: 1,
                dependencies: Vec::new(),
                paused: false,
            },
        }
    }

    #[tokio::test]
    async fn submit_graph_returns_created_node_ids() {
        let (ingress, handle, cancel) = spawn_loop();
        let app = build_router(ingress);

        let body = serde_json::to_vec(&simple_submission("shot_010")).unwrap();
        let resp = send_request(
            app,
            Request::builder()
                .method("POST")
                .uri("/graphs/")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = body_json(resp).await;
        assert!(json.as_array().unwrap().len() >= 1);

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn query_returns_submitted_nodes() {
        let (ingress, handle, cancel) = spawn_loop();
        let app = build_router(ingress.clone());

        let body = serde_json::to_vec(&simple_submission("shot_011")).unwrap();
        let _ = send_request(
            app.clone(),
            Request::builder()
                .method("POST")
                .uri("/graphs/")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await;

        let resp = send_request(
            app,
            Request::builder()
                .uri("/query")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let nodes = json.as_array().unwrap();
        assert!(nodes.iter().any(|n| n["name"] == "shot_011"));

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn query_constraint_filters_by_field() {
        let (ingress, handle, cancel) = spawn_loop();
        let app = build_router(ingress.clone());

        let _ = send_request(
            app.clone(),
            Request::builder()
                .method("POST")
                .uri("/graphs/")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&simple_submission("shot_012")).unwrap(),
                ))
                .unwrap(),
        )
        .await;

        let resp = send_request(
            app,
            Request::builder()
                .uri("/query?constraint_name=nonexistent")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let json = body_json(resp).await;
        assert_eq!(json.as_array().unwrap().len(), 0);

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn command_status_update_rejects_unknown_render_node() {
        let (ingress, handle, cancel) = spawn_loop();
        let app = build_router(ingress);

        let resp = send_request(
            app,
            Request::builder()
                .method("PUT")
                .uri("/rendernodes/rn99:3000/commands/1/")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "status": "running",
                        "completion": 0.5,
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn pool_share_not_found_is_404() {
        let (ingress, handle, cancel) = spawn_loop();
        let app = build_router(ingress);

        let resp = send_request(
            app,
            Request::builder()
                .uri("/poolshares/999/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        cancel.cancel();
        let _ = handle.await;
    }
}
