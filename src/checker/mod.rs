//! Stream health checking
//!
//! Probes a stream URL by asking ffmpeg to capture a single scaled-down
//! frame, then fans a batch of probes out under a semaphore so at most
//! `limit` subprocesses run at once. The capture backend sits behind a
//! trait so batch behavior can be tested without ffmpeg installed.

use async_trait::async_trait;
use base64::Engine;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

const CAPTURE_USER_AGENT: &str = "AptvPlayer/1.4.1";
const ANALYZE_WINDOW_SECS: &str = "5";
const THUMBNAIL_WIDTH: &str = "320";

/// Outcome of a single frame capture attempt.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub ok: bool,
    /// Base64 `data:image/jpeg;base64,…` thumbnail when the capture worked.
    pub image: Option<String>,
    pub error: Option<String>,
}

impl CaptureResult {
    pub fn success(image: String) -> Self {
        Self {
            ok: true,
            image: Some(image),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            image: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait FrameCapture: Send + Sync {
    async fn capture(&self, url: &str) -> CaptureResult;
}

/// ffmpeg-backed capture: one frame, scaled to 320px wide, with a hard
/// timeout on the whole subprocess.
pub struct FfmpegCapture {
    command: String,
    timeout: Duration,
}

impl FfmpegCapture {
    pub fn new(command: String, timeout_seconds: u64) -> Self {
        Self {
            command,
            timeout: Duration::from_secs(timeout_seconds),
        }
    }

    fn temp_frame_path() -> PathBuf {
        std::env::temp_dir().join(format!("m3u-hub-check-{}.jpg", Uuid::new_v4()))
    }
}

#[async_trait]
impl FrameCapture for FfmpegCapture {
    async fn capture(&self, url: &str) -> CaptureResult {
        let frame_path = Self::temp_frame_path();

        let mut command = tokio::process::Command::new(&self.command);
        command
            .arg("-y")
            .arg("-hide_banner")
            .args(["-loglevel", "error"])
            .args(["-t", ANALYZE_WINDOW_SECS])
            .args(["-user_agent", CAPTURE_USER_AGENT])
            .args(["-i", url])
            .arg("-an")
            .arg("-sn")
            .args(["-frames:v", "1"])
            .args(["-vf", &format!("scale={THUMBNAIL_WIDTH}:-1")])
            .args(["-f", "image2"])
            .args(["-c:v", "mjpeg"])
            .arg(&frame_path)
            .kill_on_drop(true);

        let result = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => {
                if output.status.success() && frame_path.exists() {
                    match std::fs::read(&frame_path) {
                        Ok(bytes) => {
                            let encoded =
                                base64::engine::general_purpose::STANDARD.encode(&bytes);
                            CaptureResult::success(format!("data:image/jpeg;base64,{encoded}"))
                        }
                        Err(e) => CaptureResult::failure(format!("Failed to read frame: {e}")),
                    }
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let message = stderr.trim();
                    CaptureResult::failure(if message.is_empty() {
                        "No video frame captured".to_string()
                    } else {
                        message.to_string()
                    })
                }
            }
            Ok(Err(e)) => CaptureResult::failure(format!("Failed to run {}: {}", self.command, e)),
            Err(_) => CaptureResult::failure(format!(
                "Timed out after {}s",
                self.timeout.as_secs()
            )),
        };

        if frame_path.exists() {
            if let Err(e) = std::fs::remove_file(&frame_path) {
                debug!("Failed to remove temp frame {}: {}", frame_path.display(), e);
            }
        }

        result
    }
}

/// One stream to probe, identified by its channel id.
#[derive(Debug, Clone)]
pub struct CheckItem {
    pub channel_id: Uuid,
    pub url: String,
    pub is_enabled: bool,
}

/// What auto-toggling decided for a channel, if anything.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ToggleAction {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub channel_id: Uuid,
    pub passed: bool,
    pub thumbnail: Option<String>,
    pub error: Option<String>,
    pub action: Option<ToggleAction>,
}

pub struct StreamChecker {
    capture: Arc<dyn FrameCapture>,
}

impl StreamChecker {
    pub fn new(capture: Arc<dyn FrameCapture>) -> Self {
        Self { capture }
    }

    /// Probe every item with at most `limit` captures in flight. When
    /// `auto_toggle` is set, a failing enabled channel reports a Disabled
    /// action and a passing disabled channel reports Enabled; persisting
    /// the toggle is the caller's job.
    pub async fn check_batch(
        &self,
        items: Vec<CheckItem>,
        limit: usize,
        auto_toggle: bool,
    ) -> Vec<CheckOutcome> {
        let semaphore = Arc::new(Semaphore::new(limit.max(1)));

        let futures = items.into_iter().map(|item| {
            let semaphore = semaphore.clone();
            let capture = self.capture.clone();
            async move {
                // Closed only if the semaphore is dropped, which it is not.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return CheckOutcome {
                            channel_id: item.channel_id,
                            passed: false,
                            thumbnail: None,
                            error: Some("Checker shut down".to_string()),
                            action: None,
                        }
                    }
                };

                let result = capture.capture(&item.url).await;
                if !result.ok {
                    warn!(
                        "Stream check failed for channel {}: {}",
                        item.channel_id,
                        result.error.as_deref().unwrap_or("unknown")
                    );
                }

                let action = if auto_toggle {
                    match (result.ok, item.is_enabled) {
                        (true, false) => Some(ToggleAction::Enabled),
                        (false, true) => Some(ToggleAction::Disabled),
                        _ => None,
                    }
                } else {
                    None
                };

                CheckOutcome {
                    channel_id: item.channel_id,
                    passed: result.ok,
                    thumbnail: result.image,
                    error: result.error,
                    action,
                }
            }
        });

        join_all(futures).await
    }
}
