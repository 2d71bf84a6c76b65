//! HTTP API for friends and message history.
//!
//! Requests carry `Authorization: Bearer <credential>`, checked by the same
//! verifier as WebSocket connections. A numeric credential is a claimed user
//! id, anything else a signed token.
//!
//! - `GET    /api/friends`                     friends with live presence
//! - `POST   /api/friends`                     send a friend request
//! - `GET    /api/friends/requests`            incoming pending requests
//! - `POST   /api/friends/:friendId/accept`    accept a pending request
//! - `DELETE /api/friends/:friendId`           remove a friend or request
//! - `GET    /api/conversations/:friendId`     recent history with a friend
//! - `PUT    /api/messages/:id/read`           mark a received message read
//! - `DELETE /api/messages/:id`                delete a sent message
//! - `GET    /api/unread-count`                unread messages for the caller

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::protocol::{Credential, MessageRecord, UserId};
use crate::state::RelayState;
use crate::store::DEFAULT_CONVERSATION_LIMIT;

/// Upper bound on a single history page.
const MAX_CONVERSATION_LIMIT: usize = 200;

// ── Response Types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendEntry {
    pub user_id: UserId,
    pub online: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    pub count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestBody {
    pub friend_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    pub limit: Option<usize>,
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn ok_response<T: Serialize>(status: StatusCode, data: T) -> ApiResult<T> {
    (
        status,
        Json(ApiResponse {
            ok: true,
            data: Some(data),
            error: None,
        }),
    )
}

fn error_response<T: Serialize>(status: StatusCode, msg: &str) -> ApiResult<T> {
    (
        status,
        Json(ApiResponse {
            ok: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn store_error<T: Serialize>(e: Error) -> ApiResult<T> {
    match e {
        Error::Authorization(reason) => error_response(StatusCode::BAD_REQUEST, &reason),
        other => {
            tracing::error!(error = %other, "API storage failure");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

/// Resolve the caller from the bearer header.
async fn caller(state: &RelayState, headers: &HeaderMap) -> Option<UserId> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let raw = value.strip_prefix("Bearer ")?.trim();
    let credential = match raw.parse::<i64>() {
        Ok(id) => Credential::Claim(UserId(id)),
        Err(_) => Credential::Token(raw.to_string()),
    };

    match state.verifier.verify(&credential).await {
        Ok(user) => Some(user),
        Err(e) => {
            tracing::debug!(error = %e, "API request rejected");
            None
        }
    }
}

macro_rules! require_caller {
    ($state:expr, $headers:expr) => {
        match caller(&$state, &$headers).await {
            Some(user) => user,
            None => return error_response(StatusCode::UNAUTHORIZED, "Authentication required"),
        }
    };
}

/// Routes mounted under `/api`.
pub fn routes() -> Router<RelayState> {
    Router::new()
        .route("/api/friends", get(list_friends).post(request_friend))
        .route("/api/friends/requests", get(list_requests))
        .route("/api/friends/:friend_id/accept", post(accept_friend))
        .route("/api/friends/:friend_id", delete(remove_friend))
        .route("/api/conversations/:friend_id", get(conversation))
        .route("/api/messages/:id/read", put(mark_read))
        .route("/api/messages/:id", delete(delete_message))
        .route("/api/unread-count", get(unread_count))
}

// ── Friends ──────────────────────────────────────────────────────────────────

/// GET /api/friends
pub async fn list_friends(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> ApiResult<Vec<FriendEntry>> {
    let user = require_caller!(state, headers);

    match state.store.friends_of(user) {
        Ok(friends) => {
            let entries = friends
                .into_iter()
                .map(|friend| FriendEntry {
                    user_id: friend,
                    online: state.registry.is_online(friend),
                })
                .collect();
            ok_response(StatusCode::OK, entries)
        }
        Err(e) => store_error(e),
    }
}

/// GET /api/friends/requests
pub async fn list_requests(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> ApiResult<Vec<UserId>> {
    let user = require_caller!(state, headers);

    match state.store.pending_requests(user) {
        Ok(requesters) => ok_response(StatusCode::OK, requesters),
        Err(e) => store_error(e),
    }
}

/// POST /api/friends
pub async fn request_friend(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(body): Json<FriendRequestBody>,
) -> ApiResult<bool> {
    let user = require_caller!(state, headers);

    match state.store.add_friend_request(user, body.friend_id) {
        Ok(()) => {
            tracing::info!(from = %user, to = %body.friend_id, "Friend request sent");
            ok_response(StatusCode::CREATED, true)
        }
        Err(e) => store_error(e),
    }
}

/// POST /api/friends/:friendId/accept
pub async fn accept_friend(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(friend_id): Path<i64>,
) -> ApiResult<bool> {
    let user = require_caller!(state, headers);

    match state.store.accept_friend(user, UserId(friend_id)) {
        Ok(true) => ok_response(StatusCode::OK, true),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "No pending request from that user"),
        Err(e) => store_error(e),
    }
}

/// DELETE /api/friends/:friendId
pub async fn remove_friend(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(friend_id): Path<i64>,
) -> ApiResult<bool> {
    let user = require_caller!(state, headers);

    match state.store.remove_friend(user, UserId(friend_id)) {
        Ok(true) => ok_response(StatusCode::OK, true),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Not friends"),
        Err(e) => store_error(e),
    }
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// GET /api/conversations/:friendId?limit=N
///
/// Oldest first. Only available between accepted friends.
pub async fn conversation(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(friend_id): Path<i64>,
    Query(query): Query<ConversationQuery>,
) -> ApiResult<Vec<MessageRecord>> {
    let user = require_caller!(state, headers);
    let friend = UserId(friend_id);

    match state.store.friends_of(user) {
        Ok(friends) if friends.contains(&friend) => {}
        Ok(_) => return error_response(StatusCode::FORBIDDEN, "You can only view conversations with friends"),
        Err(e) => return store_error(e),
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_CONVERSATION_LIMIT)
        .clamp(1, MAX_CONVERSATION_LIMIT);

    match state.store.fetch_conversation(user, friend, limit) {
        Ok(messages) => ok_response(StatusCode::OK, messages),
        Err(e) => store_error(e),
    }
}

/// PUT /api/messages/:id/read
pub async fn mark_read(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<bool> {
    let user = require_caller!(state, headers);

    match state.store.mark_read(id, user) {
        Ok(true) => ok_response(StatusCode::OK, true),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Message not found"),
        Err(e) => store_error(e),
    }
}

/// DELETE /api/messages/:id
pub async fn delete_message(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<bool> {
    let user = require_caller!(state, headers);

    match state.store.delete_message(id, user) {
        Ok(true) => ok_response(StatusCode::OK, true),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Message not found"),
        Err(e) => store_error(e),
    }
}

/// GET /api/unread-count
pub async fn unread_count(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> ApiResult<UnreadCount> {
    let user = require_caller!(state, headers);

    match state.store.unread_count(user) {
        Ok(count) => ok_response(StatusCode::OK, UnreadCount { count }),
        Err(e) => store_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::state::RelayConfig;
    use crate::store::MessageStore;

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);

    fn state() -> RelayState {
        RelayState::new(RelayConfig::default()).unwrap()
    }

    async fn call(
        state: &RelayState,
        method: Method,
        uri: &str,
        user: Option<UserId>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", user));
        }
        let req = match body {
            Some(json) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let resp = routes().with_state(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_requires_authorization() {
        let state = state();
        let (status, body) = call(&state, Method::GET, "/api/friends", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["ok"], false);

        let (status, _) = call(&state, Method::GET, "/api/friends", Some(UserId(0)), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_friend_request_flow_with_presence() {
        let state = state();

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/friends",
            Some(ALICE),
            Some(serde_json::json!({ "friendId": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, body) = call(&state, Method::GET, "/api/friends/requests", Some(BOB), None).await;
        assert_eq!(body["data"], serde_json::json!([1]));

        let (status, _) =
            call(&state, Method::POST, "/api/friends/1/accept", Some(BOB), None).await;
        assert_eq!(status, StatusCode::OK);

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state
            .registry
            .bind(
                BOB,
                crate::presence::ConnectionHandle::new(crate::protocol::ConnectionId::new(), tx),
            )
            .unwrap();

        let (_, body) = call(&state, Method::GET, "/api/friends", Some(ALICE), None).await;
        assert_eq!(
            body["data"],
            serde_json::json!([{ "userId": 2, "online": true }])
        );

        let (status, _) = call(&state, Method::DELETE, "/api/friends/2", Some(ALICE), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&state, Method::GET, "/api/friends", Some(ALICE), None).await;
        assert_eq!(body["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_self_friend_request_is_bad_request() {
        let state = state();
        let (status, body) = call(
            &state,
            Method::POST,
            "/api/friends",
            Some(ALICE),
            Some(serde_json::json!({ "friendId": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_request_to_existing_friend_is_bad_request() {
        let state = state();
        state.store.add_friend_request(ALICE, BOB).unwrap();
        state.store.accept_friend(BOB, ALICE).unwrap();

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/friends",
            Some(BOB),
            Some(serde_json::json!({ "friendId": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Already friends");

        let (_, body) = call(&state, Method::GET, "/api/friends/requests", Some(ALICE), None).await;
        assert_eq!(body["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_conversation_requires_friendship() {
        let state = state();
        let (status, _) =
            call(&state, Method::GET, "/api/conversations/2", Some(ALICE), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_conversation_read_and_delete() {
        let state = state();
        state.store.add_friend_request(ALICE, BOB).unwrap();
        state.store.accept_friend(BOB, ALICE).unwrap();
        let first = state.store.save(ALICE, BOB, "one").await.unwrap();
        state.store.save(BOB, ALICE, "two").await.unwrap();
        state.store.save(ALICE, BOB, "three").await.unwrap();

        let (status, body) = call(
            &state,
            Method::GET,
            "/api/conversations/2?limit=2",
            Some(ALICE),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let contents: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["two", "three"]);

        let (_, body) = call(&state, Method::GET, "/api/unread-count", Some(BOB), None).await;
        assert_eq!(body["data"]["count"], 2);

        // Only the recipient may mark a message read.
        let uri = format!("/api/messages/{}/read", first.id);
        let (status, _) = call(&state, Method::PUT, &uri, Some(ALICE), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&state, Method::PUT, &uri, Some(BOB), None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&state, Method::GET, "/api/unread-count", Some(BOB), None).await;
        assert_eq!(body["data"]["count"], 1);

        // Only the sender may delete a message.
        let uri = format!("/api/messages/{}", first.id);
        let (status, _) = call(&state, Method::DELETE, &uri, Some(BOB), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&state, Method::DELETE, &uri, Some(ALICE), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.store.get_message(first.id).unwrap().is_none());
    }
}
