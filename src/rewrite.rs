//! URDF mesh reference rewriting.
//!
//! Every `<mesh filename="...">` that points at an uploaded file, either as a
//! `package://` reference or relative to the document, is replaced by a URL
//! under the resource base so a browser-side renderer can fetch it. References
//! that cannot be resolved are left as they are; a partially renderable robot
//! is more useful than an error.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::debug;
use xmltree::{Element, EmitterConfig, XMLNode};

use crate::resolver;
use crate::sandbox::{relative_to, sandbox_check};
use crate::storage::StorageError;

const PACKAGE_SCHEME: &str = "package://";
const MESH_TAG: &str = "mesh";
const FILENAME_ATTR: &str = "filename";

#[derive(Debug, thiserror::Error)]
pub enum UrdfError {
    #[error("failed to read urdf: {0}")]
    Io(#[from] io::Error),
    #[error("urdf document is outside the upload root")]
    OutsideRoot,
    #[error("malformed urdf: {0}")]
    Parse(String),
    #[error("failed to serialize urdf: {0}")]
    Serialize(String),
}

/// A rewritten document and the resources it now points at, in document order.
#[derive(Debug)]
pub struct Rewritten {
    pub content: String,
    pub resources: Vec<String>,
}

impl From<StorageError> for UrdfError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => UrdfError::OutsideRoot,
            StorageError::Io(err) => UrdfError::Io(err),
        }
    }
}

/// Rewrites the mesh references of the URDF at `document_path`.
pub fn rewrite(
    document_path: &Path,
    root: &Path,
    resource_base_url: &str,
) -> Result<Rewritten, UrdfError> {
    let root = std::path::absolute(root)?;
    let document_path = sandbox_check(&root, &std::path::absolute(document_path)?)?;
    let reader = BufReader::new(File::open(&document_path)?);
    let mut document = Element::parse(reader).map_err(|err| UrdfError::Parse(err.to_string()))?;

    let mut rewriter = MeshRewriter {
        root: root.clone(),
        canonical_root: root.canonicalize()?,
        document_dir: document_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
        base_url: resource_base_url.trim_end_matches('/'),
        resources: Vec::new(),
    };
    rewriter.visit(&mut document);

    let mut buffer = Vec::new();
    document
        .write_with_config(&mut buffer, EmitterConfig::new().perform_indent(true))
        .map_err(|err| UrdfError::Serialize(err.to_string()))?;
    let content = String::from_utf8(buffer).map_err(|err| UrdfError::Serialize(err.to_string()))?;

    Ok(Rewritten {
        content,
        resources: rewriter.resources,
    })
}

struct MeshRewriter<'a> {
    root: PathBuf,
    canonical_root: PathBuf,
    document_dir: PathBuf,
    base_url: &'a str,
    resources: Vec<String>,
}

impl MeshRewriter<'_> {
    fn visit(&mut self, element: &mut Element) {
        if element.name == MESH_TAG
            && let Some(value) = element.attributes.get(FILENAME_ATTR)
        {
            if let Some(relative) = self.resolve_reference(value) {
                let url = format!("{}/{}", self.base_url, relative);
                debug!(reference = %value, url, "mesh reference rewritten");
                element.attributes.insert(FILENAME_ATTR.to_string(), url);
                self.resources.push(relative);
            } else {
                debug!(reference = %value, "mesh reference left unresolved");
            }
        }

        for child in element.children.iter_mut() {
            if let XMLNode::Element(child) = child {
                self.visit(child);
            }
        }
    }

    fn resolve_reference(&self, value: &str) -> Option<String> {
        let value = value.trim();
        if value.is_empty() || (!self.base_url.is_empty() && value.starts_with(self.base_url)) {
            return None;
        }

        let resolved = if let Some(target) = value.strip_prefix(PACKAGE_SCHEME) {
            resolver::resolve(&self.root, target)?
        } else if value.contains("://") {
            return None;
        } else {
            sandbox_check(&self.root, &self.document_dir.join(value)).ok()?
        };
        relative_to(&self.canonical_root, &resolved)
    }
}
