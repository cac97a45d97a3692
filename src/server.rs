//! Read-only HTTP query surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/documents` | All documents |
//! | `GET`  | `/documents/{key}` | Document with its versions (`?at=YYYY-MM-DD`) |
//! | `GET`  | `/documents/{key}/nodes` | Nodes of the version in force (`?at=`, `?tag=`) |
//! | `GET`  | `/nodes/{id}` | Node with its references and their resolutions |
//! | `GET`  | `/search` | Full-text search (`?q=`, `?limit=`) |
//! | `GET`  | `/conflicts` | Conflict events (`?status=pending`) |
//!
//! `{key}` is a canonical document key (`legge:212:2000`) or a document id.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use normattiva_core::models::{ConflictEvent, Document, Node};
use normattiva_core::store::Store;

use crate::config::Config;
use crate::conflicts::parse_status;
use crate::get::{document_view, node_view, version_nodes, DocumentView, NodeView, VersionSummary};
use crate::search::{search, SearchResult};
use crate::sqlite_store::SqliteStore;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Arc<Config>,
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let store = SqliteStore::open(config).await?;
    let state = AppState {
        store: Arc::new(store),
        config: Arc::new(config.clone()),
    };

    let app = router(state);

    println!("Normattiva KB server listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/documents", get(handle_list_documents))
        .route("/documents/{key}", get(handle_get_document))
        .route("/documents/{key}/nodes", get(handle_document_nodes))
        .route("/nodes/{id}", get(handle_get_node))
        .route("/search", get(handle_search))
        .route("/conflicts", get(handle_list_conflicts))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Map lookup errors onto status codes by message: lookups signal a missing
/// entity with "not found" and bad input with "must not be empty",
/// "must be at least" or "unknown".
fn classify_error(err: anyhow::Error) -> AppError {
    let msg = format!("{err:#}");
    if msg.contains("not found") {
        not_found(msg)
    } else if msg.contains("must not be empty")
        || msg.contains("must be at least")
        || msg.contains("unknown")
    {
        bad_request(msg)
    } else {
        tracing::error!(error = %msg, "request failed");
        internal(msg)
    }
}

fn parse_at(at: Option<&str>) -> Result<NaiveDate, AppError> {
    match at {
        None => Ok(Utc::now().date_naive()),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|_| bad_request(format!("invalid date '{s}', expected YYYY-MM-DD"))),
    }
}

// ============ Handlers ============

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Serialize)]
struct DocumentListResponse {
    documents: Vec<Document>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = state.store.list_documents().await.map_err(classify_error)?;
    Ok(Json(DocumentListResponse { documents }))
}

#[derive(Debug, Default, Deserialize)]
pub struct AtQuery {
    pub at: Option<String>,
    pub tag: Option<String>,
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<AtQuery>,
) -> Result<Json<DocumentView>, AppError> {
    let date = parse_at(q.at.as_deref())?;
    document_view(state.store.as_ref(), &key, date)
        .await
        .map(Json)
        .map_err(classify_error)
}

#[derive(Debug, Serialize)]
struct NodeListResponse {
    version: VersionSummary,
    nodes: Vec<Node>,
}

async fn handle_document_nodes(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<AtQuery>,
) -> Result<Json<NodeListResponse>, AppError> {
    let date = parse_at(q.at.as_deref())?;
    let (version, nodes) = version_nodes(state.store.as_ref(), &key, q.tag.as_deref(), date)
        .await
        .map_err(classify_error)?;
    Ok(Json(NodeListResponse {
        version: VersionSummary::of(&version),
        nodes,
    }))
}

async fn handle_get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NodeView>, AppError> {
    node_view(state.store.as_ref(), &id)
        .await
        .map(Json)
        .map_err(classify_error)
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, AppError> {
    let query = q.q.unwrap_or_default();
    let limit = q.limit.unwrap_or(state.config.server.search_limit);
    let results = search(state.store.as_ref(), &query, limit)
        .await
        .map_err(classify_error)?;
    Ok(Json(SearchResponse { results }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ConflictQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConflictListResponse {
    conflicts: Vec<ConflictEvent>,
}

async fn handle_list_conflicts(
    State(state): State<AppState>,
    Query(q): Query<ConflictQuery>,
) -> Result<Json<ConflictListResponse>, AppError> {
    let status = q
        .status
        .as_deref()
        .map(parse_status)
        .transpose()
        .map_err(classify_error)?;
    let conflicts = state
        .store
        .list_conflicts(status)
        .await
        .map_err(classify_error)?;
    Ok(Json(ConflictListResponse { conflicts }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ingest_units, IngestSettings};
    use crate::scan::RawUnit;
    use normattiva_core::store::memory::InMemoryStore;

    const LEGGE: &str = r#"<atto><meta><doc_type>legge</doc_type><number>212</number><year>2000</year>
        <title>Statuto dei diritti del contribuente</title><valid_from>2000-08-01</valid_from></meta>
        <articolo num="1"><comma num="1">Il contribuente ha diritto di essere informato.</comma></articolo></atto>"#;

    async fn state() -> AppState {
        let store = InMemoryStore::new();
        ingest_units(
            &store,
            &IngestSettings::default(),
            vec![RawUnit {
                origin: "l.xml".into(),
                bytes: LEGGE.as_bytes().to_vec(),
            }],
            0,
        )
        .await
        .unwrap();
        AppState {
            store: Arc::new(store),
            config: Arc::new(Config::for_db("unused.sqlite")),
        }
    }

    #[tokio::test]
    async fn test_health() {
        let Json(body) = handle_health().await;
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn test_document_lookup_by_canonical_key() {
        let state = state().await;
        let Json(view) = handle_get_document(
            State(state.clone()),
            Path("legge:212:2000".to_string()),
            Query(AtQuery {
                at: Some("2010-01-01".into()),
                tag: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(view.versions.len(), 1);
        assert!(view.in_force.is_some());

        let Json(nodes) = handle_document_nodes(
            State(state),
            Path("legge:212:2000".to_string()),
            Query(AtQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(nodes.nodes.len(), 1);
        assert_eq!(nodes.nodes[0].canonical_path, "art1/co1");
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let state = state().await;
        let err = handle_get_document(
            State(state.clone()),
            Path("legge:1:1900".to_string()),
            Query(AtQuery::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "not_found");

        let err = handle_search(State(state.clone()), Query(SearchQuery::default()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = handle_get_document(
            State(state.clone()),
            Path("legge:212:2000".to_string()),
            Query(AtQuery {
                at: Some("ieri".into()),
                tag: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = handle_list_conflicts(
            State(state),
            Query(ConflictQuery {
                status: Some("open".into()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_search_endpoint() {
        let state = state().await;
        let Json(resp) = handle_search(
            State(state),
            Query(SearchQuery {
                q: Some("contribuente".into()),
                limit: Some(5),
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.results[0].document, "legge:212:2000");
    }

    #[test]
    fn test_router_builds() {
        let state = AppState {
            store: Arc::new(InMemoryStore::new()),
            config: Arc::new(Config::for_db("unused.sqlite")),
        };
        let _ = router(state);
    }
}
