//! Defines routes for the chunked-upload file store.
//!
//! ## Structure
//! - `PUT    /init/` — register an upload (auth)
//! - `PUT    /upload/{code}/{part}` — write a part's bytes (open by design)
//! - `GET    /info/` — list all uploads (auth)
//! - `GET    /info/{code}` — upload metadata + ordered part list (auth)
//! - `GET    /download/{code}/{part}` — stream one part (auth)
//! - `GET    /download/{code}` — stream the reconstructed file (auth)
//! - `DELETE /delete/{code}` — delete an upload and all parts (auth)
//!
//! Health endpoints (`/healthz`, `/readyz`) are mounted at the root and are
//! never behind the auth predicate.

use crate::{
    auth::CheckAuth,
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{
            delete_upload, download_part, download_whole, get_info, get_info_list, init_upload,
            store_part,
        },
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    routing::{delete, get, put},
};

/// Shared state carried by the router to every handler: the storage service
/// and the injected authorization predicate.
#[derive(Clone)]
pub struct AppState {
    pub service: UploadService,
    pub check_auth: CheckAuth,
}

/// Build and return the router for all upload-store routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload lifecycle
        .route("/init/", put(init_upload))
        .route("/upload/{code}/{part}", put(store_part))
        .route("/info/", get(get_info_list))
        .route("/info/{code}", get(get_info))
        .route("/download/{code}/{part}", get(download_part))
        .route("/download/{code}", get(download_whole))
        .route("/delete/{code}", delete(delete_upload))
}
