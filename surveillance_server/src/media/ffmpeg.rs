use super::{MediaError, MediaResult, VideoBackend};
use image::RgbImage;
use serde::Deserialize;
use std::{
    collections::HashMap,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};
use threat_detection::{FrameSink, FrameSource, InferenceError, InferenceResult, VideoInfo};

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    rotation: Option<f64>,
}

impl FfprobeStream {
    /// Display rotation in degrees from the display matrix, or the legacy
    /// `rotate` tag.
    fn rotation(&self) -> i64 {
        self.side_data_list
            .iter()
            .find_map(|side| side.rotation)
            .or_else(|| self.tags.get("rotate").and_then(|r| r.trim().parse().ok()))
            .map(|degrees| degrees.round() as i64)
            .unwrap_or(0)
    }
}

/// Parses an ffprobe rate such as `30000/1001`. Zero or malformed rates
/// yield `None`.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

fn parse_probe(json: &[u8]) -> MediaResult<VideoInfo> {
    let probe: FfprobeOutput = serde_json::from_slice(json)?;
    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| MediaError::InvalidVideo("No video stream found".to_string()))?;

    let (mut width, mut height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(MediaError::InvalidVideo(
                "video stream has no frame size".to_string(),
            ))
        }
    };
    // ffmpeg auto-rotates on decode, so quarter turns swap the frame size.
    if stream.rotation().rem_euclid(180) == 90 {
        std::mem::swap(&mut width, &mut height);
    }
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(0.0);

    Ok(VideoInfo {
        fps,
        width,
        height,
        frame_count: stream.nb_frames.as_deref().and_then(|n| n.parse().ok()),
    })
}

/// Decodes with `ffmpeg` into raw RGB frames over a pipe and encodes the
/// intermediate output the same way.
pub struct FfmpegBackend {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegBackend {
    pub fn detect() -> MediaResult<Self> {
        let ffmpeg = which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)?;
        let ffprobe = which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)?;
        Ok(Self { ffmpeg, ffprobe })
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }

    pub fn probe(&self, path: &Path) -> MediaResult<VideoInfo> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-select_streams",
                "v:0",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(MediaError::InvalidVideo(
                "Could not open video file".to_string(),
            ));
        }
        parse_probe(&output.stdout)
    }
}

impl VideoBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open(&self, path: &Path) -> MediaResult<Box<dyn FrameSource + Send>> {
        let info = self.probe(path)?;
        let mut child = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::Io(io::Error::other("decoder stdout not captured")))?;

        tracing::debug!(
            "Decoding {} ({}x{} @ {:.2} fps)",
            path.display(),
            info.width,
            info.height,
            info.fps
        );
        Ok(Box::new(FfmpegSource {
            child,
            stdout,
            info,
            frames_read: 0,
            finished: false,
        }))
    }

    fn create(&self, path: &Path, info: &VideoInfo) -> MediaResult<Box<dyn FrameSink + Send>> {
        let mut child = Command::new(&self.ffmpeg)
            .args(["-y", "-v", "error", "-f", "rawvideo", "-pix_fmt", "rgb24", "-s"])
            .arg(format!("{}x{}", info.width, info.height))
            .arg("-r")
            .arg(format!("{:.3}", info.effective_fps()))
            .args(["-i", "-", "-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2"])
            .args(["-c:v", "mpeg4", "-q:v", "5", "-pix_fmt", "yuv420p"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MediaError::Io(io::Error::other("encoder stdin not captured")))?;

        Ok(Box::new(FfmpegSink {
            child,
            stdin: Some(stdin),
            width: info.width,
            height: info.height,
        }))
    }
}

struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    info: VideoInfo,
    frames_read: u64,
    finished: bool,
}

/// Fills `buffer` unless the stream ends first. Returns the bytes read.
fn read_frame(reader: &mut impl Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Decides how a finished decode ends. A decoder that fails before any
/// frame means the upload could not be decoded at all.
fn end_of_stream(exit_ok: bool, frames_read: u64, truncated: bool) -> InferenceResult<()> {
    if frames_read == 0 && (!exit_ok || truncated) {
        return Err(InferenceError::invalid_input(
            "Could not decode any frame from the video",
        ));
    }
    if !exit_ok || truncated {
        tracing::warn!(
            "Decoder stopped early after {} frames (exit ok: {}, truncated: {})",
            frames_read,
            exit_ok,
            truncated
        );
    }
    Ok(())
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn next_frame(&mut self) -> InferenceResult<Option<RgbImage>> {
        if self.finished {
            return Ok(None);
        }
        let frame_len = self.info.width as usize * self.info.height as usize * 3;
        let mut buffer = vec![0u8; frame_len];
        let filled = read_frame(&mut self.stdout, &mut buffer)?;
        if filled < frame_len {
            self.finished = true;
            let status = self.child.wait()?;
            end_of_stream(status.success(), self.frames_read, filled > 0)?;
            return Ok(None);
        }

        self.frames_read += 1;
        RgbImage::from_raw(self.info.width, self.info.height, buffer)
            .map(Some)
            .ok_or_else(|| InferenceError::media("decoded frame has the wrong size"))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
}

impl FrameSink for FfmpegSink {
    fn write_frame(&mut self, frame: &RgbImage) -> InferenceResult<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(InferenceError::media(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| InferenceError::media("encoder already finished"))?;
        stdin.write_all(frame.as_raw())?;
        Ok(())
    }

    fn finish(&mut self) -> InferenceResult<()> {
        // Closing stdin lets the encoder flush and exit.
        drop(self.stdin.take());
        let status = self.child.wait()?;
        if !status.success() {
            return Err(InferenceError::media(format!(
                "encoder exited with {}",
                status
            )));
        }
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rates_parse_as_fractions() {
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[test]
    fn probe_reads_first_video_stream() {
        let json = br#"{"streams":[
            {"codec_type":"audio"},
            {"codec_type":"video","width":640,"height":360,
             "avg_frame_rate":"0/0","r_frame_rate":"24/1","nb_frames":"48"}
        ]}"#;
        let info = parse_probe(json).unwrap();
        assert_eq!((info.width, info.height), (640, 360));
        assert_eq!(info.fps, 24.0);
        assert_eq!(info.frame_count, Some(48));
    }

    #[test]
    fn probe_without_video_is_invalid() {
        let err = parse_probe(br#"{"streams":[{"codec_type":"audio"}]}"#).unwrap_err();
        assert!(err.is_invalid_input());
        let err = parse_probe(br#"{}"#).unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[test]
    fn quarter_turn_rotation_swaps_frame_size() {
        let side_data = br#"{"streams":[{"codec_type":"video","width":1920,"height":1080,
            "side_data_list":[{"side_data_type":"Display Matrix","rotation":-90}]}]}"#;
        let info = parse_probe(side_data).unwrap();
        assert_eq!((info.width, info.height), (1080, 1920));

        let tagged = br#"{"streams":[{"codec_type":"video","width":640,"height":360,
            "tags":{"rotate":"270"}}]}"#;
        let info = parse_probe(tagged).unwrap();
        assert_eq!((info.width, info.height), (360, 640));

        let upside_down = br#"{"streams":[{"codec_type":"video","width":640,"height":360,
            "side_data_list":[{"rotation":180}]}]}"#;
        let info = parse_probe(upside_down).unwrap();
        assert_eq!((info.width, info.height), (640, 360));
    }

    #[test]
    fn short_reads_report_partial_frames() {
        let mut buffer = [0u8; 6];
        assert_eq!(read_frame(&mut io::Cursor::new(vec![1u8; 10]), &mut buffer).unwrap(), 6);
        assert_eq!(read_frame(&mut io::Cursor::new(vec![1u8; 4]), &mut buffer).unwrap(), 4);
        assert_eq!(read_frame(&mut io::Cursor::new(Vec::new()), &mut buffer).unwrap(), 0);
    }

    #[test]
    fn decoder_failure_before_first_frame_is_an_input_error() {
        let err = end_of_stream(false, 0, false).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidInput(_)));
        let err = end_of_stream(true, 0, true).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidInput(_)));

        assert!(end_of_stream(true, 0, false).is_ok());
        assert!(end_of_stream(false, 12, false).is_ok());
        assert!(end_of_stream(true, 12, true).is_ok());
    }

    #[test]
    fn missing_rate_leaves_fps_to_the_pipeline_default() {
        let json = br#"{"streams":[{"codec_type":"video","width":2,"height":2}]}"#;
        let info = parse_probe(json).unwrap();
        assert_eq!(info.fps, 0.0);
        assert_eq!(info.effective_fps(), 30.0);
    }
}
