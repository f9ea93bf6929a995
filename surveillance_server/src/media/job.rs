use super::{MediaError, MediaResult, Transcoder, VideoBackend};
use crate::error::ApiResult;
use bytes::Bytes;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempPath;
use threat_detection::{VideoOptions, VideoPipeline, VideoReport};

pub struct EncodedVideo {
    pub report: VideoReport,
    pub bytes: Vec<u8>,
    /// `h264` after a successful re-encode, `mpeg4` otherwise.
    pub codec: &'static str,
}

/// Runs one uploaded video through decode, analysis, encode and transcode.
/// Every file it creates is a [`TempPath`] owned by this call, so all of
/// them are removed however the call ends.
pub struct VideoJob {
    backend: Arc<dyn VideoBackend>,
    transcoder: Arc<Transcoder>,
    temp_dir: PathBuf,
}

fn temp_path(dir: &Path, prefix: &str, suffix: &str) -> MediaResult<TempPath> {
    Ok(tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)?
        .into_temp_path())
}

/// Keeps the uploaded extension so container sniffing still works.
fn upload_suffix(filename: Option<&str>) -> String {
    filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_else(|| ".mp4".to_string())
}

impl VideoJob {
    pub fn new(backend: Arc<dyn VideoBackend>, transcoder: Arc<Transcoder>, temp_dir: PathBuf) -> Self {
        Self {
            backend,
            transcoder,
            temp_dir,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn run(
        &self,
        pipeline: VideoPipeline,
        upload: Bytes,
        filename: Option<&str>,
        options: VideoOptions,
    ) -> ApiResult<EncodedVideo> {
        options.validate()?;
        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(MediaError::from)?;

        let input = temp_path(&self.temp_dir, "upload-", &upload_suffix(filename))?;
        tokio::fs::write(&input, &upload)
            .await
            .map_err(MediaError::from)?;
        drop(upload);

        let backend = self.backend.clone();
        let temp_dir = self.temp_dir.clone();
        let (report, intermediate) = tokio::task::spawn_blocking(move || -> ApiResult<_> {
            let mut source = backend.open(&input)?;
            let intermediate = temp_path(&temp_dir, "annotated-", ".mp4")?;
            let mut sink = backend.create(&intermediate, &source.info())?;
            let report = pipeline.process(source.as_mut(), sink.as_mut(), options)?;
            Ok((report, intermediate))
        })
        .await??;

        let output = temp_path(&self.temp_dir, "h264-", ".mp4")?;
        let (bytes, codec) = match self.transcoder.to_h264(&intermediate, &output).await {
            Ok(()) => (tokio::fs::read(&output).await, "h264"),
            Err(e) => {
                tracing::warn!("H.264 re-encode failed, returning MPEG-4 output: {:?}", e);
                (tokio::fs::read(&intermediate).await, "mpeg4")
            }
        };
        let bytes = bytes.map_err(MediaError::from)?;

        tracing::info!(
            "Video processed: {} frames, {} sampled, {} bytes {}",
            report.total_frames,
            report.frames.len(),
            bytes.len(),
            codec
        );
        Ok(EncodedVideo {
            report,
            bytes,
            codec,
        })
    }
}
