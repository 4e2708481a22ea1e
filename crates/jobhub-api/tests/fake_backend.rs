//! Runs the client against a small axum app standing in for the backend.

use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, patch},
};
use serde_json::{Value, json};

use jobhub_api::{ApiClient, ApiError};
use jobhub_realtime::UnreadStrategy;
use jobhub_store::{Database, StorageKey};
use jobhub_types::UserId;

struct Backend {
    /// Body served by `GET /messages/` without a contact
    inbox: Value,
    calls: Vec<String>,
}

type Shared = Arc<Mutex<Backend>>;

fn authorized(headers: &HeaderMap) -> Result<(), StatusCode> {
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some("Bearer tok") => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn notifications(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    Ok(Json(json!({"results": [
        {"id": 1, "user_id": 42, "message": "Application viewed", "seen": false},
        {"id": "2", "user_id": "42", "title": "Interview", "message": "Tomorrow", "seen": true}
    ]})))
}

async fn delete_all(State(backend): State<Shared>, headers: HeaderMap) -> Result<StatusCode, StatusCode> {
    authorized(&headers)?;
    backend.lock().unwrap().calls.push("delete-all".into());
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(backend): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<std::collections::HashMap<String, String>>,
) -> Result<String, StatusCode> {
    authorized(&headers)?;
    match query.get("contact").map(String::as_str) {
        Some("7") => Ok(json!([
            {"id": 10, "sender_id": 7, "receiver_id": 42, "content": "hi", "seen": false}
        ])
        .to_string()),
        // Not JSON at all
        Some(_) => Ok("<html>oops</html>".into()),
        None => Ok(backend.lock().unwrap().inbox.to_string()),
    }
}

async fn post_message(headers: HeaderMap, Json(body): Json<Value>) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    Ok(Json(json!({
        "id": 11,
        "sender_id": 42,
        "receiver_id": body["receiver_id"],
        "content": body["content"]
    })))
}

async fn patch_message(
    State(backend): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Result<StatusCode, StatusCode> {
    authorized(&headers)?;
    backend
        .lock()
        .unwrap()
        .calls
        .push(format!("patch {} {}", id, body));
    Ok(StatusCode::OK)
}

async fn delete_message(Path(id): Path<i64>, headers: HeaderMap) -> Result<StatusCode, StatusCode> {
    authorized(&headers)?;
    if id == 404 {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn user(Path(id): Path<i64>, headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    Ok(Json(json!({
        "id": id, "username": "jdoe", "first_name": "Jane", "last_name": "Doe", "role": "graduate"
    })))
}

async fn serve(inbox: Value) -> (String, Shared) {
    let backend = Arc::new(Mutex::new(Backend {
        inbox,
        calls: Vec::new(),
    }));
    let app = Router::new()
        .route("/notifications/", get(notifications))
        .route("/notifications/delete-all/", delete(delete_all))
        .route("/messages/", get(list_messages).post(post_message))
        .route("/messages/{id}/", patch(patch_message).delete(delete_message))
        .route("/users/{id}/", get(user))
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), backend)
}

fn signed_in_store() -> Arc<Database> {
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.set(StorageKey::AccessToken, "tok").unwrap();
    db.set(StorageKey::UserId, "42").unwrap();
    db
}

fn uid(n: i64) -> UserId {
    UserId::new(n).unwrap()
}

#[tokio::test]
async fn fetches_notifications_in_either_shape() {
    let (url, _) = serve(json!([])).await;
    let client = ApiClient::new(&url, signed_in_store());

    let rows = client.notifications().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id, "1");
    assert!(!rows[0].seen);
    assert_eq!(rows[1].title.as_deref(), Some("Interview"));
    assert_eq!(rows[1].user_id, uid(42));
}

#[tokio::test]
async fn message_endpoints_round_trip() {
    let (url, backend) = serve(json!([])).await;
    let client = ApiClient::new(&url, signed_in_store());

    let convo = client.messages_with(uid(7)).await.unwrap();
    assert_eq!(convo.len(), 1);
    assert_eq!(convo[0].sender_id, uid(7));

    // Malformed bodies default to empty
    assert!(client.messages_with(uid(8)).await.unwrap().is_empty());

    let sent = client.send_message(uid(7), "hello").await.unwrap();
    assert_eq!(sent.id, 11);
    assert_eq!(sent.receiver_id, uid(7));
    assert_eq!(sent.content, "hello");

    client.mark_read(10).await.unwrap();
    client.delete_message(10).await.unwrap();
    client.delete_all_notifications().await.unwrap();

    let calls = backend.lock().unwrap().calls.clone();
    assert_eq!(calls, vec![r#"patch 10 {"seen":true}"#.to_string(), "delete-all".into()]);
}

#[tokio::test]
async fn error_statuses_surface_as_api_errors() {
    let (url, _) = serve(json!([])).await;
    let client = ApiClient::new(&url, signed_in_store());

    match client.delete_message(404).await {
        Err(ApiError::Status { status, .. }) => assert_eq!(status.as_u16(), 404),
        other => panic!("expected status error, got {:?}", other),
    }

    let profile = client.user_profile(uid(7)).await.unwrap();
    assert_eq!(profile.display_name(), "Jane Doe");
}

#[tokio::test]
async fn requests_without_token_fail_fast() {
    let (url, _) = serve(json!([])).await;
    let db = Arc::new(Database::open_in_memory().unwrap());
    let client = ApiClient::new(&url, db.clone());
    assert!(matches!(client.notifications().await, Err(ApiError::NoToken)));

    db.set(StorageKey::AccessToken, "wrong").unwrap();
    match client.notifications().await {
        Err(ApiError::Status { status, .. }) => assert_eq!(status.as_u16(), 401),
        other => panic!("expected 401, got {:?}", other),
    }
}

#[tokio::test]
async fn negotiates_flag_based_when_rows_carry_read_marker() {
    let (url, _) = serve(json!([
        {"id": 1, "sender_id": 7, "receiver_id": 42, "content": "hi", "seen": false}
    ]))
    .await;
    let client = ApiClient::new(&url, signed_in_store());
    assert_eq!(
        client.negotiate_strategy(uid(42)).await.unwrap(),
        UnreadStrategy::FlagBased
    );
}

#[tokio::test]
async fn negotiates_timestamp_based_otherwise() {
    let (url, _) = serve(json!({"results": [
        {"id": 1, "sender_id": 7, "receiver_id": 42, "content": "hi"}
    ]}))
    .await;
    let store = signed_in_store();
    let last_open = chrono::DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    store.set_last_chat_open(uid(42), last_open).unwrap();
    let client = ApiClient::new(&url, store);

    assert_eq!(
        client.negotiate_strategy(uid(42)).await.unwrap(),
        UnreadStrategy::TimestampBased {
            last_seen: Some(last_open)
        }
    );
}
