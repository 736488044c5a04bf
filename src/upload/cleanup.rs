//! Removal of temporary uploads once the response has gone out.

use axum::body::Body;
use axum::response::Response;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Deletes its files, after a short delay, when dropped
#[derive(Debug)]
pub struct CleanupGuard {
    paths: Vec<PathBuf>,
    delay: Duration,
}

impl CleanupGuard {
    pub fn new(paths: Vec<PathBuf>, delay: Duration) -> Self {
        Self { paths, delay }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let paths = std::mem::take(&mut self.paths);
        if paths.is_empty() {
            return;
        }
        let delay = self.delay;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    for path in paths {
                        if let Err(e) = tokio::fs::remove_file(&path).await {
                            log_failure(&path, &e);
                        }
                    }
                });
            }
            Err(_) => {
                for path in paths {
                    remove_now(&path);
                }
            }
        }
    }
}

/// Synchronous removal for drops outside a runtime
fn remove_now(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log_failure(path, &e);
    }
}

fn log_failure(path: &Path, err: &std::io::Error) {
    if err.kind() != std::io::ErrorKind::NotFound {
        tracing::warn!("Failed to clean up upload {}: {}", path.display(), err);
    }
}

/// Tie the guard to the response body, so deletion starts once the body has
/// been fully written or the connection is gone
pub fn attach_cleanup(response: Response, guard: CleanupGuard) -> Response {
    if guard.is_empty() {
        return response;
    }
    let (parts, body) = response.into_parts();
    let stream = body.into_data_stream().map(move |chunk| {
        let _held = &guard;
        chunk
    });
    Response::from_parts(parts, Body::from_stream(stream))
}
