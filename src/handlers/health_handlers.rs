//! Health & readiness handlers.
//!
//! - GET /healthz -> simple liveness ("ok")
//! - GET /readyz  -> readiness that checks DB connectivity and disk I/O

use crate::routes::routes::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness probe — always 200 OK, no I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe: a `SELECT 1` against SQLite and a best-effort
/// write/read/delete of a temp file under the storage directory. 200 when
/// both pass, 503 otherwise, with per-check detail in the body.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.service.db)
        .await
    {
        Ok(1) => (true, None::<String>),
        Ok(v) => (false, Some(format!("unexpected result: {}", v))),
        Err(e) => (false, Some(format!("error: {}", e))),
    };

    let tmp_path = state
        .service
        .storage_dir
        .join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = match fs::write(&tmp_path, b"readyz").await {
        Ok(_) => match fs::read(&tmp_path).await {
            Ok(bytes) if bytes == b"readyz" => match fs::remove_file(&tmp_path).await {
                Ok(_) => (true, None::<String>),
                Err(e) => (true, Some(format!("could not remove tmp file: {}", e))),
            },
            Ok(_) => {
                let _ = fs::remove_file(&tmp_path).await;
                (false, Some("file content mismatch".to_string()))
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                (false, Some(format!("could not read tmp file: {}", e)))
            }
        },
        Err(e) => (false, Some(format!("could not write tmp file: {}", e))),
    };

    let overall_ok = sqlite_check.0 && disk_check.0;
    let mut checks = HashMap::new();
    checks.insert(
        "sqlite",
        CheckStatus {
            ok: sqlite_check.0,
            error: sqlite_check.1,
        },
    );
    checks.insert(
        "disk",
        CheckStatus {
            ok: disk_check.0,
            error: disk_check.1,
        },
    );

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
