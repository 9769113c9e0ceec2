//! 文件列表、下载与上传处理器。

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, Multipart, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::atomic::AtomicFile;
use crate::error::ApiError;
use crate::locking::{LOCK_WAIT_TIMEOUT, LockManager};
use crate::storage::{FileEntry, Storage};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 200;

#[derive(Debug)]
pub struct UploadConfig {
    pub max_content_length: u64,
    /// Lowercase, without the leading dot.
    pub allowed_extensions: Vec<String>,
}

impl UploadConfig {
    pub fn is_allowed(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.allowed_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListQuery {
    path: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Deserialize)]
pub(crate) struct RequiredPathQuery {
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct FolderQuery {
    dir: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileListing {
    entries: Vec<FileEntry>,
    total: usize,
    page: usize,
    page_size: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadResult {
    saved: Vec<String>,
}

/// 分页列出目录内容（目录优先）。
pub async fn list_files(
    Query(query): Query<ListQuery>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<FileListing>, ApiError> {
    let entries = storage.list_dir(query.path.as_deref()).await?;
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let total = entries.len();
    let entries: Vec<FileEntry> = entries
        .into_iter()
        .skip((page - 1).saturating_mul(page_size))
        .take(page_size)
        .collect();
    info!(
        path = query.path.as_deref().unwrap_or(""),
        total,
        page,
        "list files"
    );
    Ok(JsonResponse(FileListing {
        entries,
        total,
        page,
        page_size,
    }))
}

/// 下载原始文件。
pub async fn download_file(
    Query(RequiredPathQuery { path }): Query<RequiredPathQuery>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let target = storage.resolve_path_checked(&path, false).await?;
    let metadata = fs::metadata(&target).await.map_err(ApiError::from_io)?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest("path is not a file".into()));
    }
    let mime = mime_guess::from_path(&target).first_or_octet_stream();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("无效的 MIME 类型".into()))?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    let file = File::open(&target).await.map_err(ApiError::from_io)?;
    info!(path, size = metadata.len(), "download file");
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// 上传单个文件（请求体即文件内容），扩展名需在白名单内。
pub async fn upload_file(
    Query(RequiredPathQuery { path }): Query<RequiredPathQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(lock_manager): Extension<Arc<LockManager>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    body: AxumBody,
) -> Result<(StatusCode, JsonResponse<UploadResult>), ApiError> {
    if path.trim().is_empty() {
        return Err(ApiError::BadRequest("path is required".into()));
    }
    if !upload.is_allowed(&path) {
        return Err(ApiError::BadRequest("file type not allowed".into()));
    }

    let _guard = lock_manager
        .lock_path(&path, LOCK_WAIT_TIMEOUT)
        .await
        .map_err(|_| ApiError::Conflict("path locked".into()))?;
    let target = storage.resolve_path_checked(&path, true).await?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
    }

    let mut atomic = AtomicFile::new(&target).await?;
    let write_result: Result<u64, ApiError> = async {
        let mut data_stream = BodyExt::into_data_stream(body);
        let mut total_written: u64 = 0;
        while let Some(chunk) = data_stream.next().await {
            let chunk = chunk.map_err(|err: AxumError| ApiError::BadRequest(err.to_string()))?;
            total_written += chunk.len() as u64;
            if total_written > upload.max_content_length {
                return Err(ApiError::PayloadTooLarge(upload.max_content_length));
            }
            atomic.write_all(&chunk).await?;
        }
        Ok(total_written)
    }
    .await;
    let size = match write_result {
        Ok(size) => size,
        Err(err) => {
            atomic.cleanup().await;
            return Err(err);
        }
    };
    atomic.finalize().await?;

    info!(path, size, "upload file");
    Ok((
        StatusCode::CREATED,
        JsonResponse(UploadResult { saved: vec![path] }),
    ))
}

/// 上传整个文件夹：每个分片的文件名是相对路径，保留目录结构。
pub async fn upload_folder(
    Query(FolderQuery { dir }): Query<FolderQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(lock_manager): Extension<Arc<LockManager>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, JsonResponse<UploadResult>), ApiError> {
    let prefix = dir.unwrap_or_default();
    let prefix = prefix.trim().trim_matches(['/', '\\']);
    let mut saved = Vec::new();
    let mut total_written: u64 = 0;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let name = name.trim().trim_start_matches(['/', '\\']).replace('\\', "/");
        if name.is_empty() {
            continue;
        }
        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };

        let _guard = lock_manager
            .lock_path(&relative, LOCK_WAIT_TIMEOUT)
            .await
            .map_err(|_| ApiError::Conflict("path locked".into()))?;
        let target = storage.resolve_path_checked(&relative, true).await?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
        }

        let mut atomic = AtomicFile::new(&target).await?;
        let write_result: Result<(), ApiError> = async {
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|err| ApiError::BadRequest(err.to_string()))?
            {
                total_written += chunk.len() as u64;
                if total_written > upload.max_content_length {
                    return Err(ApiError::PayloadTooLarge(upload.max_content_length));
                }
                atomic.write_all(&chunk).await?;
            }
            Ok(())
        }
        .await;
        if let Err(err) = write_result {
            warn!(path = relative, "folder upload aborted");
            atomic.cleanup().await;
            return Err(err);
        }
        atomic.finalize().await?;
        saved.push(relative);
    }

    if saved.is_empty() {
        return Err(ApiError::BadRequest("no files in upload".into()));
    }
    info!(dir = prefix, count = saved.len(), total_written, "upload folder");
    Ok((StatusCode::CREATED, JsonResponse(UploadResult { saved })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::extract::FromRequest;
    use axum::http::Request;
    use tempfile::tempdir;

    fn make_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("uploads");
        std::fs::create_dir_all(&root).expect("create storage root");
        (temp, Arc::new(Storage::new(root)))
    }

    fn make_upload_config(max_content_length: u64) -> Arc<UploadConfig> {
        Arc::new(UploadConfig {
            max_content_length,
            allowed_extensions: vec!["urdf".into(), "txt".into(), "pdf".into()],
        })
    }

    async fn multipart_body(parts: &[(&str, &str)]) -> Multipart {
        let boundary = "urdfboundary";
        let mut body = String::new();
        for (file_name, contents) in parts {
            body.push_str(&format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n{contents}\r\n"
            ));
        }
        body.push_str(&format!("--{boundary}--\r\n"));
        let request = Request::builder()
            .method("POST")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(AxumBody::from(body))
            .expect("request");
        Multipart::from_request(request, &())
            .await
            .unwrap_or_else(|_| panic!("multipart extractor"))
    }

    #[test]
    fn extension_allow_list_is_case_insensitive() {
        let upload = make_upload_config(1024);
        assert!(upload.is_allowed("robots/arm.URDF"));
        assert!(upload.is_allowed("notes.txt"));
        assert!(!upload.is_allowed("meshes/arm.stl"));
        assert!(!upload.is_allowed("Makefile"));
    }

    #[tokio::test]
    async fn upload_file_rejects_traversal_path() {
        let (_temp, storage) = make_storage();
        let result = upload_file(
            Query(RequiredPathQuery {
                path: "../secret.urdf".to_string(),
            }),
            Extension(storage),
            Extension(Arc::new(LockManager::new())),
            Extension(make_upload_config(1024)),
            AxumBody::from("<robot/>"),
        )
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn upload_file_rejects_disallowed_extension() {
        let (_temp, storage) = make_storage();
        let result = upload_file(
            Query(RequiredPathQuery {
                path: "payload.exe".to_string(),
            }),
            Extension(storage),
            Extension(Arc::new(LockManager::new())),
            Extension(make_upload_config(1024)),
            AxumBody::from("MZ"),
        )
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn upload_file_rejects_oversize_body_and_leaves_nothing() {
        let (_temp, storage) = make_storage();
        let result = upload_file(
            Query(RequiredPathQuery {
                path: "big.urdf".to_string(),
            }),
            Extension(storage.clone()),
            Extension(Arc::new(LockManager::new())),
            Extension(make_upload_config(4)),
            AxumBody::from("<robot/>"),
        )
        .await;

        assert!(matches!(result, Err(ApiError::PayloadTooLarge(4))));
        let remaining = std::fs::read_dir(storage.root_path())
            .expect("read dir")
            .count();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn upload_file_writes_nested_path() {
        let (_temp, storage) = make_storage();
        let (status, _) = upload_file(
            Query(RequiredPathQuery {
                path: "robots/arm.urdf".to_string(),
            }),
            Extension(storage.clone()),
            Extension(Arc::new(LockManager::new())),
            Extension(make_upload_config(1024)),
            AxumBody::from("<robot name=\"arm\"/>"),
        )
        .await
        .unwrap_or_else(|_| panic!("upload failed"));

        assert_eq!(status, StatusCode::CREATED);
        let contents = std::fs::read(storage.root_path().join("robots/arm.urdf")).expect("read");
        assert_eq!(contents, b"<robot name=\"arm\"/>");
    }

    #[tokio::test]
    async fn upload_folder_preserves_structure() {
        let (_temp, storage) = make_storage();
        let multipart = multipart_body(&[
            ("pkgA/urdf/robot.urdf", "<robot/>"),
            ("pkgA/meshes/box.stl", "solid box"),
        ])
        .await;

        let (_, JsonResponse(result)) = upload_folder(
            Query(FolderQuery {
                dir: Some("uploads1".into()),
            }),
            Extension(storage.clone()),
            Extension(Arc::new(LockManager::new())),
            Extension(make_upload_config(1024)),
            multipart,
        )
        .await
        .unwrap_or_else(|_| panic!("folder upload failed"));

        assert_eq!(
            result.saved,
            ["uploads1/pkgA/urdf/robot.urdf", "uploads1/pkgA/meshes/box.stl"]
        );
        let mesh = std::fs::read(storage.root_path().join("uploads1/pkgA/meshes/box.stl"))
            .expect("read mesh");
        assert_eq!(mesh, b"solid box");
    }

    #[tokio::test]
    async fn upload_folder_rejects_traversal() {
        let (_temp, storage) = make_storage();
        let multipart = multipart_body(&[("../../evil.stl", "solid evil")]).await;

        let result = upload_folder(
            Query(FolderQuery { dir: None }),
            Extension(storage),
            Extension(Arc::new(LockManager::new())),
            Extension(make_upload_config(1024)),
            multipart,
        )
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn list_files_paginates_folders_first() {
        let (_temp, storage) = make_storage();
        let root = storage.root_path();
        std::fs::create_dir_all(root.join("pkgB")).expect("mkdir");
        std::fs::create_dir_all(root.join("pkgA")).expect("mkdir");
        std::fs::write(root.join("a.urdf"), b"<robot/>").expect("write");

        let JsonResponse(listing) = list_files(
            Query(ListQuery {
                path: None,
                page: Some(1),
                page_size: Some(2),
            }),
            Extension(storage.clone()),
        )
        .await
        .unwrap_or_else(|_| panic!("list failed"));
        let names: Vec<_> = listing.entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, ["pkgA", "pkgB"]);
        assert_eq!(listing.total, 3);

        let JsonResponse(listing) = list_files(
            Query(ListQuery {
                path: None,
                page: Some(2),
                page_size: Some(2),
            }),
            Extension(storage),
        )
        .await
        .unwrap_or_else(|_| panic!("list failed"));
        let names: Vec<_> = listing.entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, ["a.urdf"]);
    }

    #[tokio::test]
    async fn download_file_guesses_content_type() {
        let (_temp, storage) = make_storage();
        std::fs::write(storage.root_path().join("notes.txt"), b"hello").expect("write");

        let response = download_file(
            Query(RequiredPathQuery {
                path: "notes.txt".to_string(),
            }),
            Extension(storage),
        )
        .await
        .unwrap_or_else(|_| panic!("download failed"));

        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/plain"))
        );
        let body = to_bytes(response.into_body(), 1024).await.expect("body");
        assert_eq!(&body[..], b"hello");
    }
}
