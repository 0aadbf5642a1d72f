//! src/services/upload_service.rs
//!
//! UploadService — the part-tracking and reconstruction engine. SQLite holds
//! the durable metadata (uploads and their parts); part payloads live on
//! local disk as `storage_dir/{uploadCode}.{partCode}`. This file contains
//! the sanitizer, the upload registry, the part store, the reconstruction
//! ordering rules, and the deletion coordinator.

use crate::models::{part::Part, upload::Upload};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("identifier must not be empty")]
    EmptyIdentifier,
    #[error("upload `{0}` not found")]
    UploadNotFound(String),
    #[error("part `{part}` not found in upload `{upload}`")]
    PartNotFound { upload: String, part: String },
    #[error("upload `{0}` already exists")]
    UploadAlreadyExists(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Response shape for the per-upload info endpoint: the upload itself, its
/// parts in reassembly (part-code) order, and the `created_at` of the
/// code-sorted last part. `last_upload` is omitted when there are no parts.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadInfo {
    pub upload: Upload,
    pub parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_upload: Option<DateTime<Utc>>,
}

/// UploadService provides the store's core operations:
/// - Register an upload (insert metadata, unique by code)
/// - Store a part (stream bytes to disk, then upsert its metadata row)
/// - Read back one part or the whole reconstructed file
/// - Delete an upload together with all of its parts
///
/// The struct is cheap to clone and carries no locking of its own; SQLite
/// provides atomic single-row operations and concurrent part writes only
/// race at the final rename.
#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Directory on disk where part payloads are stored.
    pub storage_dir: PathBuf,
}

/// Strip every character outside `[A-Za-z0-9-_.]` from `name`.
///
/// Total and idempotent; applied to every externally supplied code or
/// filename before it becomes a path component or stored identifier, so a
/// traversal attempt like `../../etc/passwd` collapses to `....etc.passwd`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect()
}

/// Sanitize an identifier and reject it if nothing survives.
fn clean_identifier(name: &str) -> UploadResult<String> {
    let cleaned = sanitize_name(name);
    if cleaned.is_empty() {
        return Err(UploadError::EmptyIdentifier);
    }
    Ok(cleaned)
}

/// Apply the embedded schema. Statements are idempotent, so this runs at
/// every startup and in tests.
pub async fn apply_migrations(db: &SqlitePool) -> Result<(), sqlx::Error> {
    let sql = include_str!("../../migrations/0001_init.sql");
    for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}

impl UploadService {
    /// Create a new UploadService backed by the provided SQLite pool and
    /// using `storage_dir` as the root directory for part payloads.
    pub fn new(db: Arc<SqlitePool>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            storage_dir: storage_dir.into(),
        }
    }

    /// Physical path of a part's payload. Both components are sanitized
    /// before they reach this point.
    fn part_path(&self, upload_code: &str, part_code: &str) -> PathBuf {
        self.storage_dir
            .join(format!("{}.{}", upload_code, part_code))
    }

    /// Register a new upload under a unique sanitized code.
    ///
    /// Returns `UploadAlreadyExists` when the code is taken and
    /// `EmptyIdentifier` when either field sanitizes to nothing.
    pub async fn register_upload(&self, code: &str, filename: &str) -> UploadResult<Upload> {
        let code = clean_identifier(code)?;
        let filename = clean_identifier(filename)?;

        let result = sqlx::query_as::<_, Upload>(
            "INSERT INTO uploads (code, filename, created_at) VALUES (?, ?, ?)
             RETURNING id, code, filename, created_at",
        )
        .bind(&code)
        .bind(&filename)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match result {
            Ok(upload) => Ok(upload),
            Err(err) if is_unique_violation(&err) => Err(UploadError::UploadAlreadyExists(code)),
            Err(err) => Err(UploadError::Sqlx(err)),
        }
    }

    /// Look up a registered upload by its (sanitized) code.
    pub async fn fetch_upload(&self, code: &str) -> UploadResult<Upload> {
        let code = clean_identifier(code)?;
        sqlx::query_as::<_, Upload>(
            "SELECT id, code, filename, created_at FROM uploads WHERE code = ?",
        )
        .bind(&code)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::UploadNotFound(code),
            other => UploadError::Sqlx(other),
        })
    }

    /// All registered uploads.
    pub async fn list_uploads(&self) -> UploadResult<Vec<Upload>> {
        let uploads = sqlx::query_as::<_, Upload>(
            "SELECT id, code, filename, created_at FROM uploads ORDER BY code ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(uploads)
    }

    /// All parts of `upload`, ordered by ascending part code.
    ///
    /// The ordering is lexicographic, not numeric, and it is what determines
    /// reassembly order: callers pick part codes that sort the way they want
    /// the file stitched together (zero-padded sequence numbers, usually).
    pub async fn list_parts(&self, upload: &Upload) -> UploadResult<Vec<Part>> {
        let parts = sqlx::query_as::<_, Part>(
            "SELECT id, upload_id, part_code, created_at FROM parts
             WHERE upload_id = ? ORDER BY part_code ASC",
        )
        .bind(upload.id)
        .fetch_all(&*self.db)
        .await?;
        Ok(parts)
    }

    /// Resolve one part of `upload` by exact (sanitized) code match.
    pub async fn fetch_part(&self, upload: &Upload, part_code: &str) -> UploadResult<Part> {
        let part_code = clean_identifier(part_code)?;
        sqlx::query_as::<_, Part>(
            "SELECT id, upload_id, part_code, created_at FROM parts
             WHERE upload_id = ? AND part_code = ?",
        )
        .bind(upload.id)
        .bind(&part_code)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::PartNotFound {
                upload: upload.code.clone(),
                part: part_code,
            },
            other => UploadError::Sqlx(other),
        })
    }

    /// Stream a part's bytes to disk and record its metadata.
    ///
    /// The upload must already be registered; an unknown code fails before
    /// any file is created. Bytes are staged into a temp file, fsynced, and
    /// renamed over the final path, so re-storing an existing part code
    /// replaces its content whole (no stale trailing bytes) and the metadata
    /// row is upserted with a fresh `created_at`. If the metadata write
    /// fails the just-renamed file is removed best-effort.
    ///
    /// Returns the part record and the number of bytes written.
    pub async fn store_part_stream<S>(
        &self,
        code: &str,
        part_code: &str,
        stream: S,
    ) -> UploadResult<(Part, i64)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let part_code = clean_identifier(part_code)?;
        let upload = self.fetch_upload(code).await?;

        fs::create_dir_all(&self.storage_dir).await?;
        let tmp_path = self.storage_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(UploadError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }

        let file_path = self.part_path(&upload.code, &part_code);
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Io(err));
            }
        }

        let insert_result = sqlx::query_as::<_, Part>(
            "INSERT INTO parts (upload_id, part_code, created_at) VALUES (?, ?, ?)
             ON CONFLICT(upload_id, part_code) DO UPDATE SET
                 created_at = excluded.created_at
             RETURNING id, upload_id, part_code, created_at",
        )
        .bind(upload.id)
        .bind(&part_code)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(part) => {
                debug!(
                    "stored part {} of upload {} ({} bytes)",
                    part.part_code, upload.code, size_bytes
                );
                Ok((part, size_bytes))
            }
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(UploadError::Sqlx(err))
            }
        }
    }

    /// Open one part for reading.
    ///
    /// Size is stat'd up front so callers can emit `Content-Length` before
    /// streaming begins. A metadata row whose file has gone missing reports
    /// `PartNotFound` rather than a bare I/O error.
    pub async fn part_reader(
        &self,
        code: &str,
        part_code: &str,
    ) -> UploadResult<(Upload, Part, File, i64)> {
        let upload = self.fetch_upload(code).await?;
        let part = self.fetch_part(&upload, part_code).await?;

        let path = self.part_path(&upload.code, &part.part_code);
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                UploadError::PartNotFound {
                    upload: upload.code.clone(),
                    part: part.part_code.clone(),
                }
            } else {
                UploadError::Io(err)
            }
        })?;
        let size = file.metadata().await?.len() as i64;

        Ok((upload, part, file, size))
    }

    /// Plan a whole-file download: the upload, its part payload paths in
    /// reassembly order, and the total size.
    ///
    /// Every part is stat'd before any byte is sent; a missing or unreadable
    /// payload fails the whole request up front rather than mid-stream.
    /// Draining the paths in order yields the exact concatenation of the
    /// parts' bytes.
    pub async fn whole_file(&self, code: &str) -> UploadResult<(Upload, Vec<PathBuf>, i64)> {
        let upload = self.fetch_upload(code).await?;
        let parts = self.list_parts(&upload).await?;

        let mut total: i64 = 0;
        let mut paths = Vec::with_capacity(parts.len());
        for part in &parts {
            let path = self.part_path(&upload.code, &part.part_code);
            let meta = fs::metadata(&path).await?;
            total += meta.len() as i64;
            paths.push(path);
        }

        Ok((upload, paths, total))
    }

    /// Upload metadata plus its ordered part list.
    ///
    /// `last_upload` is the `created_at` of the last part in part-code order
    /// (not the chronologically newest part), and is `None` for an upload
    /// with no parts yet.
    pub async fn upload_info(&self, code: &str) -> UploadResult<UploadInfo> {
        let upload = self.fetch_upload(code).await?;
        let parts = self.list_parts(&upload).await?;
        let last_upload = parts.last().map(|part| part.created_at);

        Ok(UploadInfo {
            upload,
            parts,
            last_upload,
        })
    }

    /// Delete an upload together with all of its parts.
    ///
    /// For each part the payload file is removed best-effort (a missing file
    /// is fine, other failures are logged and skipped), then its metadata
    /// row is deleted permanently; the upload row goes last so no part ever
    /// outlives its upload. The steps are not wrapped in one transaction,
    /// but each is idempotent, so a retry after partial failure converges.
    pub async fn delete_upload(&self, code: &str) -> UploadResult<()> {
        let upload = self.fetch_upload(code).await?;
        let parts = self.list_parts(&upload).await?;

        for part in &parts {
            let path = self.part_path(&upload.code, &part.part_code);
            match fs::remove_file(&path).await {
                Ok(_) => debug!("removed part file {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("part file {} already missing", path.display());
                }
                Err(err) => {
                    debug!("leaving part file {} behind: {}", path.display(), err);
                }
            }

            sqlx::query("DELETE FROM parts WHERE id = ?")
                .bind(part.id)
                .execute(&*self.db)
                .await?;
        }

        sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(upload.id)
            .execute(&*self.db)
            .await?;

        debug!("deleted upload {} ({} parts)", upload.code, parts.len());
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn test_service(dir: &TempDir) -> UploadService {
        // A single connection keeps the in-memory database shared.
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_migrations(&db).await.unwrap();
        UploadService::new(Arc::new(db), dir.path())
    }

    fn byte_stream(data: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        stream::iter(vec![Ok(Bytes::from_static(data))])
    }

    #[test]
    fn sanitize_strips_disallowed_characters() {
        assert_eq!(sanitize_name("../../etc/passwd"), "....etcpasswd");
        assert_eq!(sanitize_name("a b\tc\nd"), "abcd");
        assert_eq!(sanitize_name("report (1).pdf"), "report1.pdf");
        assert!(
            sanitize_name("x7/\\:*?\"<>|")
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        );
    }

    #[test]
    fn sanitize_is_idempotent_and_total() {
        assert_eq!(sanitize_name(""), "");
        let clean = "Ab-9_c.d";
        assert_eq!(sanitize_name(clean), clean);
        let once = sanitize_name("héllo wörld!.bin");
        assert_eq!(sanitize_name(&once), once);
    }

    #[tokio::test]
    async fn register_twice_conflicts() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir).await;

        service.register_upload("abc", "report.pdf").await.unwrap();
        let err = service
            .register_upload("abc", "other.pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::UploadAlreadyExists(code) if code == "abc"));
    }

    #[tokio::test]
    async fn lookup_unknown_code_is_not_found() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir).await;

        let err = service.fetch_upload("nope").await.unwrap_err();
        assert!(matches!(err, UploadError::UploadNotFound(code) if code == "nope"));
    }

    #[tokio::test]
    async fn empty_identifiers_are_rejected() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir).await;

        // "///" sanitizes to nothing.
        let err = service.register_upload("///", "file").await.unwrap_err();
        assert!(matches!(err, UploadError::EmptyIdentifier));
        let err = service.fetch_upload("   ").await.unwrap_err();
        assert!(matches!(err, UploadError::EmptyIdentifier));
    }

    #[tokio::test]
    async fn store_to_unregistered_upload_creates_no_file() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir).await;

        let err = service
            .store_part_stream("ghost", "1", byte_stream(b"data"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::UploadNotFound(_)));

        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_none(), "no file should have been created");
    }

    #[tokio::test]
    async fn part_round_trip() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir).await;
        service.register_upload("abc", "report.pdf").await.unwrap();

        let (part, size) = service
            .store_part_stream("abc", "1", byte_stream(b"hello"))
            .await
            .unwrap();
        assert_eq!(part.part_code, "1");
        assert_eq!(size, 5);

        let (upload, part, mut file, size) = service.part_reader("abc", "1").await.unwrap();
        assert_eq!(upload.filename, "report.pdf");
        assert_eq!(part.part_code, "1");
        assert_eq!(size, 5);

        let mut content = Vec::new();
        file.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn parts_list_in_lexicographic_order() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir).await;
        let upload = service.register_upload("abc", "report.pdf").await.unwrap();

        for code in ["2", "0", "10"] {
            service
                .store_part_stream("abc", code, byte_stream(b"x"))
                .await
                .unwrap();
        }

        let parts = service.list_parts(&upload).await.unwrap();
        let codes: Vec<&str> = parts.iter().map(|p| p.part_code.as_str()).collect();
        // Lexicographic, not numeric: "10" sorts before "2".
        assert_eq!(codes, ["0", "10", "2"]);
    }

    #[tokio::test]
    async fn whole_file_sums_sizes_in_part_order() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir).await;
        service.register_upload("abc", "report.pdf").await.unwrap();

        service
            .store_part_stream("abc", "1", byte_stream(b"hello"))
            .await
            .unwrap();
        service
            .store_part_stream("abc", "2", byte_stream(b"world"))
            .await
            .unwrap();

        let (upload, paths, total) = service.whole_file("abc").await.unwrap();
        assert_eq!(upload.filename, "report.pdf");
        assert_eq!(total, 10);

        let mut reassembled = Vec::new();
        for path in paths {
            reassembled.extend(std::fs::read(path).unwrap());
        }
        assert_eq!(reassembled, b"helloworld");
    }

    #[tokio::test]
    async fn restoring_a_part_overwrites_whole() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir).await;
        service.register_upload("abc", "report.pdf").await.unwrap();

        service
            .store_part_stream("abc", "1", byte_stream(b"a much longer first version"))
            .await
            .unwrap();
        let (_, size) = service
            .store_part_stream("abc", "1", byte_stream(b"short"))
            .await
            .unwrap();
        assert_eq!(size, 5);

        // No stale tail from the longer first write.
        let (_, _, mut file, size) = service.part_reader("abc", "1").await.unwrap();
        assert_eq!(size, 5);
        let mut content = Vec::new();
        file.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"short");

        let upload = service.fetch_upload("abc").await.unwrap();
        assert_eq!(service.list_parts(&upload).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn info_reports_code_sorted_last_part() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir).await;
        service.register_upload("abc", "report.pdf").await.unwrap();

        let info = service.upload_info("abc").await.unwrap();
        assert!(info.parts.is_empty());
        assert!(info.last_upload.is_none());

        // "2" is written first but sorts last, so its timestamp wins.
        let (two, _) = service
            .store_part_stream("abc", "2", byte_stream(b"world"))
            .await
            .unwrap();
        service
            .store_part_stream("abc", "1", byte_stream(b"hello"))
            .await
            .unwrap();

        let info = service.upload_info("abc").await.unwrap();
        assert_eq!(info.parts.len(), 2);
        assert_eq!(info.last_upload, Some(two.created_at));
    }

    #[tokio::test]
    async fn delete_removes_files_and_frees_the_code() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir).await;
        service.register_upload("abc", "report.pdf").await.unwrap();
        service
            .store_part_stream("abc", "1", byte_stream(b"hello"))
            .await
            .unwrap();
        service
            .store_part_stream("abc", "2", byte_stream(b"world"))
            .await
            .unwrap();

        service.delete_upload("abc").await.unwrap();

        assert!(!dir.path().join("abc.1").exists());
        assert!(!dir.path().join("abc.2").exists());
        let err = service.fetch_upload("abc").await.unwrap_err();
        assert!(matches!(err, UploadError::UploadNotFound(_)));

        // The code is free again.
        service.register_upload("abc", "report.pdf").await.unwrap();
    }

    #[tokio::test]
    async fn delete_survives_an_already_missing_part_file() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir).await;
        service.register_upload("abc", "report.pdf").await.unwrap();
        service
            .store_part_stream("abc", "1", byte_stream(b"hello"))
            .await
            .unwrap();

        std::fs::remove_file(dir.path().join("abc.1")).unwrap();
        service.delete_upload("abc").await.unwrap();
        assert!(matches!(
            service.fetch_upload("abc").await.unwrap_err(),
            UploadError::UploadNotFound(_)
        ));
    }
}
