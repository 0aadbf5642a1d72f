//! HTTP handlers for upload registration, part storage, info, download, and
//! deletion. Bodies are streamed both ways — the handlers never buffer part
//! payloads in memory — and all storage concerns are delegated to
//! `UploadService`.

use crate::{
    errors::AppError,
    models::upload::Upload,
    routes::routes::AppState,
    services::upload_service::UploadInfo,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

/// Request body for `PUT /init/`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadReq {
    pub code: String,
    pub filename: String,
}

/// Response body for `GET /info/`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadListResp {
    pub uploads: Vec<Upload>,
}

fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    if (state.check_auth)(headers) {
        Ok(())
    } else {
        Err(AppError::forbidden())
    }
}

/// PUT `/init/` — register an upload from a JSON `{code, filename}` body and
/// echo the created record.
pub async fn init_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InitUploadReq>,
) -> Result<Json<Upload>, AppError> {
    require_auth(&state, &headers)?;
    let upload = state
        .service
        .register_upload(&req.code, &req.filename)
        .await?;
    Ok(Json(upload))
}

/// PUT `/upload/{code}/{part}` — write a part's bytes from the request body.
///
/// Unauthenticated by design: part pushers only need to know a registered
/// upload code, which acts as the capability.
pub async fn store_part(
    State(state): State<AppState>,
    Path((code, part)): Path<(String, String)>,
    body: Body,
) -> Result<StatusCode, AppError> {
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)));

    state.service.store_part_stream(&code, &part, stream).await?;
    Ok(StatusCode::OK)
}

/// GET `/info/{code}` — upload metadata plus its ordered part list.
pub async fn get_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<Json<UploadInfo>, AppError> {
    require_auth(&state, &headers)?;
    let info = state.service.upload_info(&code).await?;
    Ok(Json(info))
}

/// GET `/info/` — every registered upload.
pub async fn get_info_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UploadListResp>, AppError> {
    require_auth(&state, &headers)?;
    let uploads = state.service.list_uploads().await?;
    Ok(Json(UploadListResp { uploads }))
}

/// GET `/download/{code}/{part}` — stream a single part as an attachment
/// named `{filename}.{partCode}`.
pub async fn download_part(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((code, part)): Path<(String, String)>,
) -> Result<Response, AppError> {
    require_auth(&state, &headers)?;
    let (upload, part, file, size) = state.service.part_reader(&code, &part).await?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let name = format!("{}.{}", upload.filename, part.part_code);
    set_attachment_headers(response.headers_mut(), &name, size);
    Ok(response)
}

/// GET `/download/{code}` — stream the whole reconstructed file.
///
/// Parts are concatenated in ascending part-code order; every part is
/// stat'd before the first byte goes out so `Content-Length` is exact.
/// Each part file is only opened once the stream reaches it.
pub async fn download_whole(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<Response, AppError> {
    require_auth(&state, &headers)?;
    let (upload, paths, total) = state.service.whole_file(&code).await?;

    let concatenated = stream::iter(paths)
        .then(|path| async move { File::open(path).await.map(ReaderStream::new) })
        .try_flatten();

    let mut response = Response::new(Body::from_stream(concatenated));
    set_attachment_headers(response.headers_mut(), &upload.filename, total);
    Ok(response)
}

/// DELETE `/delete/{code}` — remove the upload and all of its parts.
pub async fn delete_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<StatusCode, AppError> {
    require_auth(&state, &headers)?;
    state.service.delete_upload(&code).await?;
    Ok(StatusCode::OK)
}

fn set_attachment_headers(headers: &mut HeaderMap, filename: &str, size: i64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&size.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    // Filenames are sanitized, so this never fails in practice.
    let disposition = format!("attachment; filename={}", filename);
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}
