//! Message mailbox endpoints.
//!
//! `send` accepts multipart form data (required for files), JSON, or a plain
//! urlencoded form. Whatever the encoding, fields are normalized into one
//! [`SendForm`] before anything touches the session.

use crate::error::{ApiError, ApiResult};
use crate::server::Relay;
use crate::storage::BlobBatch;
use axum::extract::{FromRequest, Multipart, Path, Request};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::{Extension, Form, Json};
use rqr_types::{
    FileEntry, FilesPayload, MessageKind, MessagePayload, RetrieveMessagesResponse,
    SendMessageResponse, SendTextRequest, SessionCode, TextPayload,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Send request after decoding, with any uploaded blobs.
struct SendForm {
    fields: SendTextRequest,
    file_ivs: Vec<String>,
    file_names: Vec<String>,
    file_name_ivs: Vec<String>,
    batch: BlobBatch,
}

impl SendForm {
    fn new(fields: SendTextRequest, batch: BlobBatch) -> Self {
        Self {
            fields,
            file_ivs: Vec::new(),
            file_names: Vec::new(),
            file_name_ivs: Vec::new(),
            batch,
        }
    }
}

fn rejection(status: StatusCode, text: String) -> ApiError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(text)
    } else {
        ApiError::BadRequest(text)
    }
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    rejection(err.status(), err.body_text())
}

/// Code field as a session code; 400 when missing or malformed.
fn required_code(raw: &str) -> ApiResult<SessionCode> {
    if raw.trim().is_empty() {
        return Err(ApiError::BadRequest("Code is required".to_string()));
    }
    Ok(SessionCode::parse(raw)?)
}

/// Stream every multipart field, writing `files` parts to blob storage.
async fn read_multipart(relay: &Relay, mut multipart: Multipart) -> ApiResult<SendForm> {
    let mut form = SendForm::new(SendTextRequest::default(), relay.blobs().batch());
    let mut session_checked = false;

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field
            .name()
            .unwrap_or_default()
            .trim_end_matches("[]")
            .to_string();

        if name == "files" {
            // Fail before storing anything when the code is already known to be bad.
            if !session_checked && !form.fields.code.is_empty() {
                relay.status(&required_code(&form.fields.code)?)?;
                session_checked = true;
            }

            let mut writer = relay.blobs().begin_upload().await?;
            while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                writer.write_chunk(&chunk).await?;
            }
            form.batch.push(writer.finish().await?);
            continue;
        }

        let value = field.text().await.map_err(multipart_error)?;
        match name.as_str() {
            "code" => form.fields.code = value,
            "messageType" => form.fields.message_type = Some(value),
            "ciphertext" => form.fields.ciphertext = value,
            "iv" => form.fields.iv = value,
            "authTag" => form.fields.auth_tag = value,
            "hash" => form.fields.hash = value,
            "text" => form.fields.text = Some(value),
            "fileIvs" => form.file_ivs.push(value),
            "fileNames" => form.file_names.push(value),
            "fileNameIvs" => form.file_name_ivs.push(value),
            other => tracing::debug!("Ignoring form field {:?}", other),
        }
    }

    Ok(form)
}

/// Decode the request body according to its content type.
async fn read_send_form(relay: &Relay, req: Request) -> ApiResult<SendForm> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(req, &())
            .await
            .map_err(|r| rejection(r.status(), r.body_text()))?;
        read_multipart(relay, multipart).await
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(fields) = Form::<SendTextRequest>::from_request(req, &())
            .await
            .map_err(|r| rejection(r.status(), r.body_text()))?;
        Ok(SendForm::new(fields, relay.blobs().batch()))
    } else {
        let Json(fields) = Json::<SendTextRequest>::from_request(req, &())
            .await
            .map_err(super::session::json_rejection)?;
        Ok(SendForm::new(fields, relay.blobs().batch()))
    }
}

/// `POST /api/message/send`
pub async fn send_handler(
    Extension(relay): Extension<Arc<Relay>>,
    req: Request,
) -> ApiResult<Json<SendMessageResponse>> {
    let form = read_send_form(&relay, req).await?;
    let SendForm {
        fields,
        file_ivs,
        file_names,
        file_name_ivs,
        batch,
    } = form;

    let code = required_code(&fields.code)?;
    let kind = match fields.message_type.as_deref().filter(|t| !t.is_empty()) {
        Some(raw) => raw.parse::<MessageKind>()?,
        None => MessageKind::Text,
    };

    let payload = match kind {
        MessageKind::Text => MessagePayload::Text(TextPayload {
            ciphertext: fields.ciphertext,
            iv: fields.iv,
            auth_tag: fields.auth_tag,
            hash: fields.hash,
            text: fields.text,
        }),
        MessageKind::Files => {
            if batch.is_empty() {
                return Err(ApiError::BadRequest("No files provided".to_string()));
            }
            let files = batch
                .blobs()
                .iter()
                .enumerate()
                .map(|(i, blob)| FileEntry {
                    filename: blob.name.clone(),
                    size: blob.size,
                    iv: file_ivs.get(i).cloned(),
                    encrypted_name: file_names.get(i).cloned(),
                    name_iv: file_name_ivs.get(i).cloned(),
                })
                .collect();
            MessagePayload::Files(FilesPayload {
                files,
                hash: fields.hash,
            })
        }
    };

    // An error here drops the batch, which deletes its blobs.
    let message = relay.post_message(&code, payload)?;

    if kind == MessageKind::Files {
        let blobs = batch.commit();
        let bytes: u64 = blobs.iter().map(|b| b.size).sum();
        let metrics = relay.metrics();
        metrics
            .files_uploaded
            .fetch_add(blobs.len() as u64, Ordering::Relaxed);
        metrics.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    } else if !batch.is_empty() {
        tracing::debug!(
            "Discarding {} files sent with a text message to {}",
            batch.len(),
            code
        );
    }

    Ok(Json(SendMessageResponse {
        success: true,
        message_id: message.message_id,
    }))
}

/// `GET /api/message/retrieve/:code`
pub async fn retrieve_handler(
    Extension(relay): Extension<Arc<Relay>>,
    Path(code): Path<String>,
) -> ApiResult<Json<RetrieveMessagesResponse>> {
    let code = SessionCode::parse(&code)?;
    let messages = relay.messages(&code)?;
    Ok(Json(RetrieveMessagesResponse { messages }))
}
