//! Session pairing endpoints.

use crate::error::{ApiError, ApiResult};
use crate::server::Relay;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::Path;
use axum::{Extension, Json};
use rqr_types::{
    CreateSessionRequest, CreateSessionResponse, JoinSessionRequest, JoinSessionResponse,
    ReceiverKeyRequest, SessionCode, SessionStatus, SessionStatusResponse,
};
use serde::Serialize;
use std::sync::Arc;

/// Map a JSON extractor rejection onto the relay's error body.
pub(super) fn json_rejection(rejection: JsonRejection) -> ApiError {
    if rejection.status() == axum::http::StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(rejection.body_text())
    } else {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// `POST /api/session/create`
///
/// The body is optional; an empty body creates a session without a key.
pub async fn create_handler(
    Extension(relay): Extension<Arc<Relay>>,
    body: Bytes,
) -> ApiResult<Json<CreateSessionResponse>> {
    let request: CreateSessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))?
    };

    let ticket = relay.create_session(request.initiator_public_key)?;
    let base_url = relay
        .config()
        .server
        .base_url
        .trim_end_matches('/')
        .to_string();
    let join_url = format!("{}/join?code={}", base_url, ticket.code);

    Ok(Json(CreateSessionResponse {
        code: ticket.code,
        ws_token: ticket.receiver_token.clone(),
        receiver_token: ticket.receiver_token,
        base_url,
        join_url,
        expires_at: ticket.expires_at_ms,
    }))
}

/// `POST /api/session/join`
pub async fn join_handler(
    Extension(relay): Extension<Arc<Relay>>,
    payload: Result<Json<JoinSessionRequest>, JsonRejection>,
) -> ApiResult<Json<JoinSessionResponse>> {
    let Json(request) = payload.map_err(json_rejection)?;
    let joined = relay.join_session(&request.code, request.responder_public_key)?;

    Ok(Json(JoinSessionResponse {
        success: true,
        code: request.code,
        initiator_public_key: joined.initiator_public_key,
        responder_public_key: joined.responder_public_key,
        ws_token: joined.sender_token.clone(),
        sender_token: joined.sender_token,
    }))
}

/// `{"success": true}`
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    success: bool,
}

/// `POST /api/session/key`: receiver publishes its key after creation.
pub async fn receiver_key_handler(
    Extension(relay): Extension<Arc<Relay>>,
    payload: Result<Json<ReceiverKeyRequest>, JsonRejection>,
) -> ApiResult<Json<SuccessResponse>> {
    let Json(request) = payload.map_err(json_rejection)?;
    relay.set_receiver_key(&request.code, &request.token, request.initiator_public_key)?;
    Ok(Json(SuccessResponse { success: true }))
}

/// `GET /api/session/status/:code`
pub async fn status_handler(
    Extension(relay): Extension<Arc<Relay>>,
    Path(code): Path<String>,
) -> ApiResult<Json<SessionStatusResponse>> {
    let code = SessionCode::parse(&code)?;
    let snapshot = relay.status(&code)?;

    let status = if snapshot.responder_public_key.is_some() {
        SessionStatus::Established
    } else {
        SessionStatus::Waiting
    };
    Ok(Json(SessionStatusResponse {
        status,
        initiator_public_key: snapshot.initiator_public_key,
        responder_public_key: snapshot.responder_public_key,
        expires_at: snapshot.expires_at_ms,
    }))
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::http::build_router;
    use crate::server::Relay;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use axum::Router;
    use rqr_types::{CreateSessionResponse, JoinSessionResponse, SessionStatusResponse};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    fn app() -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.upload_dir = dir.path().join("uploads");
        config.server.base_url = "https://share.example.org/".into();
        let relay = Arc::new(Relay::new(config).unwrap());
        (dir, build_router(relay))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn create(app: &Router, body: Option<Value>) -> CreateSessionResponse {
        let (status, value) = send(app, Method::POST, "/api/session/create", body).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn create_with_empty_body() {
        let (_dir, app) = app();
        let created = create(&app, None).await;

        assert_eq!(created.base_url, "https://share.example.org");
        assert_eq!(
            created.join_url,
            format!("https://share.example.org/join?code={}", created.code)
        );
        assert_eq!(created.ws_token.expose(), created.receiver_token.expose());
    }

    #[tokio::test]
    async fn create_rejects_malformed_body() {
        let (_dir, app) = app();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/session/create")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn join_flow_and_conflict() {
        let (_dir, app) = app();
        let created = create(&app, Some(json!({ "initiatorDhPublicKey": "04aa" }))).await;

        let (status, value) = send(
            &app,
            Method::POST,
            "/api/session/join",
            Some(json!({ "code": created.code.as_str().to_lowercase(), "responderPublicKey": "04bb" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let joined: JoinSessionResponse = serde_json::from_value(value).unwrap();
        assert!(joined.success);
        assert_eq!(joined.code, created.code);
        assert_eq!(joined.initiator_public_key.as_deref(), Some("04aa"));

        let (status, value) = send(
            &app,
            Method::POST,
            "/api/session/join",
            Some(json!({ "code": created.code.as_str() })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(value["error"], "Another sender is already connected");
    }

    #[tokio::test]
    async fn join_unknown_or_invalid_code() {
        let (_dir, app) = app();

        let (status, value) = send(
            &app,
            Method::POST,
            "/api/session/join",
            Some(json!({ "code": "ZZZZZZ" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(value["error"], "Connection not found");

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/session/join",
            Some(json!({ "code": "../../x" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_moves_from_waiting_to_established() {
        let (_dir, app) = app();
        let created = create(&app, Some(json!({ "initiatorPublicKey": "04aa" }))).await;
        let uri = format!("/api/session/status/{}", created.code);

        let (_, value) = send(&app, Method::GET, &uri, None).await;
        let status: SessionStatusResponse = serde_json::from_value(value).unwrap();
        assert_eq!(status.status, rqr_types::SessionStatus::Waiting);
        assert_eq!(status.expires_at, created.expires_at);

        send(
            &app,
            Method::POST,
            "/api/session/join",
            Some(json!({ "code": created.code.as_str(), "responderPublicKey": "04bb" })),
        )
        .await;
        let (_, value) = send(&app, Method::GET, &uri, None).await;
        let status: SessionStatusResponse = serde_json::from_value(value).unwrap();
        assert_eq!(status.status, rqr_types::SessionStatus::Established);
        assert_eq!(status.responder_public_key.as_deref(), Some("04bb"));
    }

    #[tokio::test]
    async fn receiver_key_requires_receiver_token() {
        let (_dir, app) = app();
        let created = create(&app, None).await;

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/session/key",
            Some(json!({ "code": created.code.as_str(), "token": "wrong", "initiatorPublicKey": "04aa" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, value) = send(
            &app,
            Method::POST,
            "/api/session/key",
            Some(json!({
                "code": created.code.as_str(),
                "token": created.receiver_token.expose(),
                "initiatorPublicKey": "04aa"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["success"], true);
    }
}
