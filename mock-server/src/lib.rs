//! In-process test server for the dispatch engine.
//!
//! # Design
//! One axum `Router` serves every endpoint. It is exposed over plain HTTP via
//! `axum::serve` and over the framed binary protocol via [`vst::serve`],
//! which decodes each message into an `http::Request` and hands it to the
//! same router. Both front ends share one document store.
//!
//! Routes are mounted at the root and again under `/_db/_system`. Payloads
//! are JSON; the binary front end forwards whatever bytes arrive.
//!
//! Wire structures are defined independently from `courier-core`;
//! integration tests catch drift.

pub mod vst;

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, Method, StatusCode},
    routing::{any, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

pub const SERVER_VERSION: &str = "3.11.0";
pub const DEFAULT_DATABASE: &str = "_system";

const ERROR_BAD_PARAMETER: u32 = 10;
const ERROR_QUERY_EMPTY: u32 = 1502;
const ERROR_DOCUMENT_NOT_FOUND: u32 = 1202;
const ERROR_CORRUPTED_JSON: u32 = 600;

/// Upper bound for `/_admin/delay/{ms}`.
const MAX_DELAY_MS: u64 = 60_000;

/// collection name -> document key -> document
pub type Store = Arc<RwLock<HashMap<String, HashMap<String, Value>>>>;

#[derive(Debug, Deserialize)]
pub struct CursorRequest {
    pub query: String,
    #[serde(default, rename = "bindVars")]
    pub bind_vars: serde_json::Map<String, Value>,
}

type Reply = (StatusCode, Json<Value>);

pub fn app() -> Router {
    let store: Store = Arc::new(RwLock::new(HashMap::new()));
    let api = Router::new()
        .route("/_api/version", get(version))
        .route("/_api/cursor", post(cursor))
        .route("/_api/document/{collection}", post(create_document))
        .route(
            "/_api/document/{collection}/{key}",
            get(get_document).delete(delete_document),
        )
        .route("/_admin/delay/{ms}", get(delay))
        .route("/_admin/echo", any(echo))
        .with_state(store);
    Router::new()
        .nest(&format!("/_db/{DEFAULT_DATABASE}"), api.clone())
        .merge(api)
}

/// Serve HTTP only.
pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// Serve HTTP and the binary protocol from one shared router.
pub async fn serve(http: TcpListener, binary: TcpListener) -> Result<(), std::io::Error> {
    let app = app();
    tokio::try_join!(
        async { axum::serve(http, app.clone()).await },
        vst::serve(binary, app.clone(), vst::DEFAULT_MAX_CHUNK_SIZE),
    )?;
    Ok(())
}

fn error_reply(status: StatusCode, error_num: u32, message: impl Into<String>) -> Reply {
    (
        status,
        Json(json!({
            "error": true,
            "code": status.as_u16(),
            "errorNum": error_num,
            "errorMessage": message.into(),
        })),
    )
}

async fn version() -> Json<Value> {
    Json(json!({
        "server": "mock",
        "version": SERVER_VERSION,
        "license": "community",
    }))
}

/// Echoes the query back as the single result row.
async fn cursor(body: Bytes) -> Reply {
    let input: CursorRequest = match serde_json::from_slice(&body) {
        Ok(input) => input,
        Err(e) => return error_reply(StatusCode::BAD_REQUEST, ERROR_CORRUPTED_JSON, e.to_string()),
    };
    if input.query.trim().is_empty() {
        return error_reply(StatusCode::BAD_REQUEST, ERROR_QUERY_EMPTY, "query is empty");
    }
    (
        StatusCode::CREATED,
        Json(json!({
            "result": [{ "query": input.query, "bindVars": input.bind_vars }],
            "hasMore": false,
            "error": false,
            "code": 201,
        })),
    )
}

async fn create_document(
    State(store): State<Store>,
    Path(collection): Path<String>,
    body: Bytes,
) -> Reply {
    let mut document = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(document)) => document,
        Ok(_) => {
            return error_reply(StatusCode::BAD_REQUEST, ERROR_BAD_PARAMETER, "document must be an object")
        }
        Err(e) => return error_reply(StatusCode::BAD_REQUEST, ERROR_CORRUPTED_JSON, e.to_string()),
    };
    let key = match document.get("_key").and_then(Value::as_str) {
        Some(key) => key.to_string(),
        None => Uuid::new_v4().simple().to_string(),
    };
    let id = format!("{collection}/{key}");
    document.insert("_key".into(), Value::String(key.clone()));
    document.insert("_id".into(), Value::String(id.clone()));

    store
        .write()
        .await
        .entry(collection)
        .or_default()
        .insert(key.clone(), Value::Object(document));
    (StatusCode::CREATED, Json(json!({ "_id": id, "_key": key })))
}

async fn get_document(
    State(store): State<Store>,
    Path((collection, key)): Path<(String, String)>,
) -> Reply {
    let store = store.read().await;
    match store.get(&collection).and_then(|docs| docs.get(&key)) {
        Some(document) => (StatusCode::OK, Json(document.clone())),
        None => error_reply(StatusCode::NOT_FOUND, ERROR_DOCUMENT_NOT_FOUND, "document not found"),
    }
}

async fn delete_document(
    State(store): State<Store>,
    Path((collection, key)): Path<(String, String)>,
) -> Reply {
    let mut store = store.write().await;
    match store.get_mut(&collection).and_then(|docs| docs.remove(&key)) {
        Some(_) => (
            StatusCode::OK,
            Json(json!({ "_id": format!("{collection}/{key}"), "_key": key })),
        ),
        None => error_reply(StatusCode::NOT_FOUND, ERROR_DOCUMENT_NOT_FOUND, "document not found"),
    }
}

async fn delay(Path(ms): Path<u64>) -> Reply {
    if ms > MAX_DELAY_MS {
        return error_reply(StatusCode::BAD_REQUEST, ERROR_BAD_PARAMETER, "delay too long");
    }
    tokio::time::sleep(Duration::from_millis(ms)).await;
    (StatusCode::OK, Json(json!({ "slept": ms })))
}

/// Reports what arrived, for checking request encoding.
async fn echo(method: Method, OriginalUri(uri): OriginalUri, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let headers: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect();
    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "query": uri.query(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}
