//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_MAX_CONTENT_LENGTH: u64 = 100 * 1024 * 1024;
pub const DEFAULT_ALLOWED_EXTENSIONS: &str = "urdf,txt,pdf";
pub const DEFAULT_RESOURCE_BASE_URL: &str = "/api/resources";
pub const DEFAULT_VIEWER_CMD: &str = "urdf-viz";
pub const DEFAULT_VIEWER_STOP_TIMEOUT_SECS: u64 = 5;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "urdf-hub", version = VERSION_INFO, about = "URDF upload and resource server")]
pub struct Args {
    #[arg(
        short = 'r',
        long,
        env = "URDF_UPLOAD_ROOT",
        default_value = ".urdf-hub/uploads",
        help = "Base directory for uploaded files"
    )]
    pub upload_root: String,
    #[arg(
        long,
        env = "URDF_MAX_CONTENT_LENGTH",
        default_value_t = DEFAULT_MAX_CONTENT_LENGTH,
        help = "Reject request bodies larger than this many bytes"
    )]
    pub max_content_length: u64,
    #[arg(
        long,
        env = "URDF_ALLOWED_EXTENSIONS",
        default_value = DEFAULT_ALLOWED_EXTENSIONS,
        help = "Comma separated extensions accepted by single-file upload"
    )]
    pub allowed_extensions: String,
    #[arg(
        long,
        env = "URDF_RESOURCE_BASE_URL",
        default_value = DEFAULT_RESOURCE_BASE_URL,
        help = "URL prefix written into rewritten mesh references; its path part is also where resources are served"
    )]
    pub resource_base_url: String,
    #[arg(
        short = 'b',
        long,
        env = "URDF_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "URDF_PORT",
        default_value_t = 5000,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "URDF_CORS_ORIGINS",
        help = "Comma separated CORS origins, or * for any"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "URDF_VIEWER_CMD",
        default_value = DEFAULT_VIEWER_CMD,
        help = "External viewer program, invoked with the URDF path as last argument"
    )]
    pub viewer_cmd: String,
    #[arg(long = "viewer-arg", help = "Extra argument for the viewer (repeatable)")]
    pub viewer_args: Vec<String>,
    #[arg(
        long,
        env = "URDF_VIEWER_STOP_TIMEOUT_SECS",
        default_value_t = DEFAULT_VIEWER_STOP_TIMEOUT_SECS,
        help = "Seconds to wait for a viewer to exit after being killed"
    )]
    pub viewer_stop_timeout_secs: u64,
}

/// Splits `urdf, .STL,,txt` into `["urdf", "stl", "txt"]`.
pub fn parse_extensions(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}
