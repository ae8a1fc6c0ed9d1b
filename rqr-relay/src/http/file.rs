//! File download endpoint.

use crate::error::{ApiError, ApiResult};
use crate::server::Relay;
use axum::body::Body;
use axum::extract::Path;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::response::Response;
use axum::Extension;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// `GET /api/file/download/:filename`
///
/// Streams the stored ciphertext. The blob is protected from the retention
/// sweep until the body has been fully sent or the client goes away.
pub async fn download_handler(
    Extension(relay): Extension<Arc<Relay>>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    let download = relay.blobs().open_download(&filename).await?;
    relay
        .metrics()
        .downloads_started
        .fetch_add(1, Ordering::Relaxed);
    tracing::debug!("Download of {} started ({} bytes)", filename, download.size());

    let size = download.size();
    Response::builder()
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, size)
        .body(Body::from_stream(download.into_stream()))
        .map_err(|e| ApiError::Internal(e.to_string()))
}
