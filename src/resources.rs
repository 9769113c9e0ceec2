//! Serves resolved mesh resources to the renderer.

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path as UrlPath};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::fmt_http_date;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::ApiError;
use crate::storage::Storage;

pub const STL_CONTENT_TYPE: &str = "application/sla";
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Settings the rewriter and the resource route have to agree on.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub base_url: String,
}

impl ResourceConfig {
    /// Router path serving the URLs written under `base_url`.
    ///
    /// An absolute base such as `https://cdn.example/meshes` is served at the
    /// path part of the URL.
    pub fn route(&self) -> String {
        let path = match self.base_url.split_once("://") {
            Some((_, rest)) => rest.find('/').map_or("", |index| &rest[index..]),
            None => self.base_url.as_str(),
        };
        let path = path.trim_matches('/');
        if path.is_empty() {
            "/{*path}".to_string()
        } else {
            format!("/{path}/{{*path}}")
        }
    }
}

/// Content type for a mesh resource, keyed on its extension.
pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("stl") => STL_CONTENT_TYPE,
        _ => FALLBACK_CONTENT_TYPE,
    }
}

/// Streams a resource by its path relative to the upload root.
pub async fn get_resource(
    UrlPath(path): UrlPath<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let target = storage.resolve_path_checked(&path, false).await?;
    let metadata = fs::metadata(&target).await.map_err(ApiError::from_io)?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest("path is not a file".into()));
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&target)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    if let Ok(modified) = metadata.modified()
        && let Ok(value) = HeaderValue::from_str(&fmt_http_date(modified))
    {
        headers.insert(header::LAST_MODIFIED, value);
    }

    let file = File::open(&target).await.map_err(ApiError::from_io)?;
    debug!(path, size = metadata.len(), "serve resource");
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
