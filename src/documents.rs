//! URDF 文档处理：重写网格引用并返回资源列表，以及保存编辑后的文档。

use axum::extract::{Extension, Json, Query};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::info;

use crate::atomic::AtomicFile;
use crate::error::ApiError;
use crate::locking::{LOCK_WAIT_TIMEOUT, LockManager};
use crate::resources::ResourceConfig;
use crate::rewrite::rewrite;
use crate::storage::Storage;

const URDF_EXTENSION: &str = "urdf";

#[derive(Deserialize)]
pub(crate) struct DocumentQuery {
    path: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProcessedDocument {
    content: String,
    resources: Vec<String>,
    status: u16,
}

#[derive(Deserialize)]
pub(crate) struct SaveDocumentRequest {
    filename: String,
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SavedDocument {
    filename: String,
    path: String,
}

/// 返回重写后的 URDF 内容与已解析的资源路径。
pub async fn get_processed_document(
    Query(DocumentQuery { path }): Query<DocumentQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(resources): Extension<Arc<ResourceConfig>>,
) -> Result<JsonResponse<ProcessedDocument>, ApiError> {
    if path.trim().is_empty() {
        return Err(ApiError::BadRequest("path is required".into()));
    }
    let document = storage.resolve_path_checked(&path, false).await?;
    if fs::metadata(&document)
        .await
        .map_err(ApiError::from_io)?
        .is_dir()
    {
        return Err(ApiError::BadRequest("path is not a file".into()));
    }

    let root = storage.root_path().to_path_buf();
    let base_url = resources.base_url.clone();
    let rewritten = tokio::task::spawn_blocking(move || rewrite(&document, &root, &base_url))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))??;

    info!(
        path,
        resources = rewritten.resources.len(),
        "processed urdf"
    );
    Ok(JsonResponse(ProcessedDocument {
        content: rewritten.content,
        resources: rewritten.resources,
        status: StatusCode::OK.as_u16(),
    }))
}

/// 保存 URDF 内容；同名文件已存在时追加时间戳。
pub async fn save_document(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(lock_manager): Extension<Arc<LockManager>>,
    Json(payload): Json<SaveDocumentRequest>,
) -> Result<(StatusCode, JsonResponse<SavedDocument>), ApiError> {
    let requested = payload.filename.trim().trim_start_matches(['/', '\\']);
    if requested.is_empty() {
        return Err(ApiError::BadRequest("filename is required".into()));
    }
    let requested = with_urdf_extension(requested);

    let _guard = lock_manager
        .lock_path(&requested, LOCK_WAIT_TIMEOUT)
        .await
        .map_err(|_| ApiError::Conflict("path locked".into()))?;
    let mut relative = requested.clone();
    let mut target = storage.resolve_path_checked(&relative, true).await?;
    if fs::try_exists(&target).await.map_err(ApiError::from_io)? {
        relative = timestamped(&requested, &Local::now().format("%Y%m%d_%H%M%S").to_string());
        target = storage.resolve_path_checked(&relative, true).await?;
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
    }

    let mut atomic = AtomicFile::new(&target).await?;
    if let Err(err) = atomic.write_all(payload.content.as_bytes()).await {
        atomic.cleanup().await;
        return Err(err.into());
    }
    atomic.finalize().await?;

    let filename = file_name_of(&target);
    info!(path = relative, size = payload.content.len(), "save urdf");
    Ok((
        StatusCode::CREATED,
        JsonResponse(SavedDocument {
            filename,
            path: relative,
        }),
    ))
}

fn with_urdf_extension(name: &str) -> String {
    let has_extension = Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(URDF_EXTENSION));
    if has_extension {
        name.to_string()
    } else {
        format!("{name}.{URDF_EXTENSION}")
    }
}

/// `models/robot.urdf` + stamp -> `models/robot_<stamp>.urdf`.
fn timestamped(relative: &str, stamp: &str) -> String {
    let path = Path::new(relative);
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default();
    let mut name = format!("{stem}_{stamp}");
    if let Some(ext) = path.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    match path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        Some(parent) => PathBuf::from(parent)
            .join(name)
            .to_string_lossy()
            .replace('\\', "/"),
        None => name,
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}
