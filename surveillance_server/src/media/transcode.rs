use super::{MediaError, MediaResult};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::process::Command;

/// Best-effort H.264 re-encode of the intermediate output for browser
/// playback.
pub struct Transcoder {
    ffmpeg: Option<PathBuf>,
    timeout: Duration,
}

impl Transcoder {
    pub fn new(ffmpeg: Option<PathBuf>, timeout: Duration) -> Self {
        Self { ffmpeg, timeout }
    }

    /// Uses `ffmpeg` from `PATH`; without it every call fails and callers
    /// keep the intermediate file.
    pub fn detect(timeout: Duration) -> Self {
        let ffmpeg = which::which("ffmpeg").ok();
        if ffmpeg.is_none() {
            tracing::warn!("ffmpeg not found, annotated videos will stay MPEG-4");
        }
        Self::new(ffmpeg, timeout)
    }

    pub async fn to_h264(&self, input: &Path, output: &Path) -> MediaResult<()> {
        let ffmpeg = self.ffmpeg.as_ref().ok_or(MediaError::FfmpegNotFound)?;
        let child = Command::new(ffmpeg)
            .args(["-y", "-v", "error", "-i"])
            .arg(input)
            .args(["-c:v", "libx264", "-preset", "fast", "-crf", "23"])
            .args(["-pix_fmt", "yuv420p", "-movflags", "+faststart"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(MediaError::Timeout(self.timeout.as_secs())),
        };

        if !result.status.success() {
            return Err(MediaError::FfmpegFailed {
                message: format!("libx264 encode exited with {}", result.status),
                stderr: Some(String::from_utf8_lossy(&result.stderr).trim().to_string()),
            });
        }

        let size = tokio::fs::metadata(output).await?.len();
        if size == 0 {
            return Err(MediaError::FfmpegFailed {
                message: "libx264 encode produced an empty file".to_string(),
                stderr: None,
            });
        }
        Ok(())
    }
}
