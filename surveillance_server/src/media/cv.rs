use super::{MediaError, MediaResult, VideoBackend};
use image::RgbImage;
use opencv::{
    core::{Mat, Size},
    imgproc,
    prelude::*,
    videoio,
};
use std::path::Path;
use threat_detection::{FrameSink, FrameSource, InferenceError, InferenceResult, VideoInfo};

fn cv_err(err: opencv::Error) -> InferenceError {
    InferenceError::media(err.to_string())
}

fn path_str(path: &Path) -> MediaResult<&str> {
    path.to_str()
        .ok_or_else(|| MediaError::InvalidVideo(format!("non UTF-8 path {}", path.display())))
}

/// Decodes and encodes in-process through OpenCV's videoio.
pub struct OpenCvBackend;

impl VideoBackend for OpenCvBackend {
    fn name(&self) -> &'static str {
        "opencv"
    }

    fn open(&self, path: &Path) -> MediaResult<Box<dyn FrameSource + Send>> {
        let capture = videoio::VideoCapture::from_file(path_str(path)?, videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(MediaError::InvalidVideo(
                "Could not open video file".to_string(),
            ));
        }
        let frame_count = capture.get(videoio::CAP_PROP_FRAME_COUNT)?;
        let info = VideoInfo {
            fps: capture.get(videoio::CAP_PROP_FPS)?,
            width: capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32,
            height: capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32,
            frame_count: (frame_count > 0.0).then_some(frame_count as u64),
        };
        Ok(Box::new(CvSource { capture, info }))
    }

    fn create(&self, path: &Path, info: &VideoInfo) -> MediaResult<Box<dyn FrameSink + Send>> {
        let fourcc = videoio::VideoWriter::fourcc('m', 'p', '4', 'v')?;
        let writer = videoio::VideoWriter::new(
            path_str(path)?,
            fourcc,
            info.effective_fps(),
            Size::new(info.width as i32, info.height as i32),
            true,
        )?;
        if !writer.is_opened()? {
            return Err(MediaError::Unsupported(
                "mp4v writer could not be opened".to_string(),
            ));
        }
        Ok(Box::new(CvSink { writer }))
    }
}

struct CvSource {
    capture: videoio::VideoCapture,
    info: VideoInfo,
}

impl FrameSource for CvSource {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn next_frame(&mut self) -> InferenceResult<Option<RgbImage>> {
        let mut bgr = Mat::default();
        if !self.capture.read(&mut bgr).map_err(cv_err)? || bgr.cols() == 0 {
            return Ok(None);
        }
        let mut rgb = Mat::default();
        imgproc::cvt_color_def(&bgr, &mut rgb, imgproc::COLOR_BGR2RGB).map_err(cv_err)?;

        let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
        let data = rgb.data_bytes().map_err(cv_err)?.to_vec();
        RgbImage::from_raw(width, height, data)
            .map(Some)
            .ok_or_else(|| InferenceError::media("decoded frame has the wrong size"))
    }
}

struct CvSink {
    writer: videoio::VideoWriter,
}

impl FrameSink for CvSink {
    fn write_frame(&mut self, frame: &RgbImage) -> InferenceResult<()> {
        let flat = Mat::from_slice(frame.as_raw()).map_err(cv_err)?;
        let rgb = flat.reshape(3, frame.height() as i32).map_err(cv_err)?;
        let mut bgr = Mat::default();
        imgproc::cvt_color_def(&*rgb, &mut bgr, imgproc::COLOR_RGB2BGR).map_err(cv_err)?;
        self.writer.write(&bgr).map_err(cv_err)
    }

    fn finish(&mut self) -> InferenceResult<()> {
        self.writer.release().map_err(cv_err)
    }
}
