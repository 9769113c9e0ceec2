//! 外部可视化进程管理：同一时间只运行一个查看器。

use axum::extract::{Extension, Json};
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::storage::Storage;

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error("failed to launch viewer `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("viewer is not running")]
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerHandle {
    pub id: Uuid,
    pub pid: Option<u32>,
    pub document: String,
}

struct RunningViewer {
    handle: ViewerHandle,
    child: Child,
}

/// Owns the single viewer slot. Starting a viewer stops the previous one first.
pub struct ViewerSupervisor {
    program: String,
    args: Vec<String>,
    stop_timeout: Duration,
    slot: Mutex<Option<RunningViewer>>,
}

impl ViewerSupervisor {
    pub fn new(program: String, args: Vec<String>, stop_timeout: Duration) -> Self {
        Self {
            program,
            args,
            stop_timeout,
            slot: Mutex::new(None),
        }
    }

    /// Launches `program args... <path>`, replacing whatever was running.
    pub async fn start(&self, path: &Path, document: String) -> Result<ViewerHandle, ViewerError> {
        let mut slot = self.slot.lock().await;
        if let Some(previous) = slot.take() {
            self.terminate(previous).await;
        }

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ViewerError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let handle = ViewerHandle {
            id: Uuid::new_v4(),
            pid: child.id(),
            document,
        };
        info!(id = %handle.id, pid = ?handle.pid, document = handle.document, "viewer started");
        *slot = Some(RunningViewer {
            handle: handle.clone(),
            child,
        });
        Ok(handle)
    }

    pub async fn stop(&self, id: Uuid) -> Result<(), ViewerError> {
        let mut slot = self.slot.lock().await;
        match slot.take() {
            Some(running) if running.handle.id == id => {
                self.terminate(running).await;
                Ok(())
            }
            other => {
                *slot = other;
                Err(ViewerError::NotRunning)
            }
        }
    }

    /// The running viewer, if its process is still alive.
    pub async fn current(&self) -> Option<ViewerHandle> {
        let mut slot = self.slot.lock().await;
        let exited = match slot.as_mut() {
            Some(running) => !matches!(running.child.try_wait(), Ok(None)),
            None => return None,
        };
        if exited {
            if let Some(running) = slot.take() {
                info!(id = %running.handle.id, "viewer exited on its own");
            }
            return None;
        }
        slot.as_ref().map(|running| running.handle.clone())
    }

    /// Kills the process and waits a bounded time; it counts as stopped either way.
    async fn terminate(&self, mut running: RunningViewer) {
        let id = running.handle.id;
        if let Err(err) = running.child.start_kill() {
            warn!(%id, error = %err, "failed to signal viewer");
        }
        match time::timeout(self.stop_timeout, running.child.wait()).await {
            Ok(Ok(status)) => info!(%id, %status, "viewer stopped"),
            Ok(Err(err)) => warn!(%id, error = %err, "failed to reap viewer"),
            Err(_) => warn!(%id, "viewer did not exit in time, treating as stopped"),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct StartViewerRequest {
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct StopViewerRequest {
    id: Uuid,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ViewerStatus {
    running: Option<ViewerHandle>,
}

/// 启动查看器并打开指定的 URDF 文件。
pub async fn start_viewer(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(supervisor): Extension<Arc<ViewerSupervisor>>,
    Json(payload): Json<StartViewerRequest>,
) -> Result<JsonResponse<ViewerHandle>, ApiError> {
    if payload.path.trim().is_empty() {
        return Err(ApiError::BadRequest("path is required".into()));
    }
    let target: PathBuf = storage.resolve_path_checked(&payload.path, false).await?;
    if !tokio::fs::metadata(&target)
        .await
        .map_err(ApiError::from_io)?
        .is_file()
    {
        return Err(ApiError::BadRequest("path is not a file".into()));
    }
    let target = tokio::fs::canonicalize(&target)
        .await
        .map_err(ApiError::from_io)?;
    let handle = supervisor.start(&target, payload.path).await?;
    Ok(JsonResponse(handle))
}

/// 停止正在运行的查看器。
pub async fn stop_viewer(
    Extension(supervisor): Extension<Arc<ViewerSupervisor>>,
    Json(payload): Json<StopViewerRequest>,
) -> Result<JsonResponse<ViewerStatus>, ApiError> {
    supervisor.stop(payload.id).await?;
    Ok(JsonResponse(ViewerStatus {
        running: supervisor.current().await,
    }))
}

pub async fn viewer_status(
    Extension(supervisor): Extension<Arc<ViewerSupervisor>>,
) -> JsonResponse<ViewerStatus> {
    JsonResponse(ViewerStatus {
        running: supervisor.current().await,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sleeper() -> ViewerSupervisor {
        ViewerSupervisor::new(
            "sh".to_string(),
            vec!["-c".to_string(), "sleep 30".to_string(), "viewer".to_string()],
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn start_replaces_running_viewer() {
        let supervisor = sleeper();
        let first = supervisor
            .start(Path::new("/tmp/a.urdf"), "a.urdf".into())
            .await
            .expect("first start");
        let second = supervisor
            .start(Path::new("/tmp/b.urdf"), "b.urdf".into())
            .await
            .expect("second start");

        assert_ne!(first.id, second.id);
        assert_eq!(supervisor.current().await, Some(second.clone()));
        assert!(matches!(
            supervisor.stop(first.id).await,
            Err(ViewerError::NotRunning)
        ));
        supervisor.stop(second.id).await.expect("stop");
        assert_eq!(supervisor.current().await, None);
    }

    #[tokio::test]
    async fn stop_without_viewer_fails() {
        let supervisor = sleeper();
        assert!(matches!(
            supervisor.stop(Uuid::new_v4()).await,
            Err(ViewerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn exited_viewer_is_cleared() {
        let supervisor = ViewerSupervisor::new("true".to_string(), Vec::new(), Duration::from_secs(5));
        supervisor
            .start(Path::new("/tmp/a.urdf"), "a.urdf".into())
            .await
            .expect("start");
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(supervisor.current().await, None);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let supervisor = ViewerSupervisor::new(
            "definitely-not-a-viewer-binary".to_string(),
            Vec::new(),
            Duration::from_secs(1),
        );
        let result = supervisor.start(Path::new("/tmp/a.urdf"), "a.urdf".into()).await;
        assert!(matches!(result, Err(ViewerError::Spawn { .. })));
    }

    #[tokio::test]
    async fn start_handler_rejects_traversal() {
        let temp = tempdir().expect("tempdir");
        let storage = Arc::new(Storage::new(temp.path().to_path_buf()));
        let result = start_viewer(
            Extension(storage),
            Extension(Arc::new(sleeper())),
            Json(StartViewerRequest {
                path: "../robot.urdf".into(),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn start_handler_passes_absolute_path() {
        let cwd = std::env::current_dir().expect("cwd");
        let temp = tempfile::Builder::new()
            .prefix(".viewer-test")
            .tempdir_in(&cwd)
            .expect("tempdir");
        let relative_root = temp.path().strip_prefix(&cwd).expect("below cwd");
        assert!(relative_root.is_relative());
        std::fs::create_dir_all(temp.path().join("pkgA")).expect("mkdir");
        std::fs::write(temp.path().join("pkgA/robot.urdf"), b"<robot/>").expect("write");
        let seen = temp.path().join("seen.txt");

        let supervisor = Arc::new(ViewerSupervisor::new(
            "sh".to_string(),
            vec![
                "-c".to_string(),
                format!("printf %s \"$1\" > '{}'; sleep 30", seen.display()),
                "viewer".to_string(),
            ],
            Duration::from_secs(5),
        ));
        let storage = Arc::new(Storage::new(relative_root.to_path_buf()));
        let JsonResponse(handle) = start_viewer(
            Extension(storage),
            Extension(supervisor.clone()),
            Json(StartViewerRequest {
                path: "pkgA/robot.urdf".into(),
            }),
        )
        .await
        .expect("start");

        let mut argument = String::new();
        for _ in 0..50 {
            argument = std::fs::read_to_string(&seen).unwrap_or_default();
            if !argument.is_empty() {
                break;
            }
            time::sleep(Duration::from_millis(50)).await;
        }
        supervisor.stop(handle.id).await.expect("stop");

        let expected = temp
            .path()
            .join("pkgA/robot.urdf")
            .canonicalize()
            .expect("canonical");
        assert_eq!(PathBuf::from(argument), expected);
    }
}
