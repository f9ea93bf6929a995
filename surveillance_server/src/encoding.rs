use crate::error::{ApiError, ApiResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{codecs::jpeg::JpegEncoder, imageops, RgbImage};

pub const ANNOTATED_JPEG_QUALITY: u8 = 85;
pub const CROP_JPEG_QUALITY: u8 = 80;
pub const CROP_MAX_SIDE: u32 = 128;

pub fn jpeg_bytes(image: &RgbImage, quality: u8) -> ApiResult<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(image)
        .map_err(|e| ApiError::internal(format!("JPEG encoding failed: {}", e)))?;
    Ok(buffer)
}

pub fn jpeg_base64(image: &RgbImage, quality: u8) -> ApiResult<String> {
    Ok(STANDARD.encode(jpeg_bytes(image, quality)?))
}

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Shrinks so the longest side is at most `max_side`, keeping the aspect
/// ratio. Never enlarges.
pub fn thumbnail(image: &RgbImage, max_side: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let longest = width.max(height);
    if longest <= max_side {
        return image.clone();
    }
    let scale = max_side as f64 / longest as f64;
    let new_width = ((width as f64 * scale).round() as u32).max(1);
    let new_height = ((height as f64 * scale).round() as u32).max(1);
    imageops::thumbnail(image, new_width, new_height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn thumbnail_caps_longest_side() {
        let wide = RgbImage::from_pixel(512, 100, Rgb([1, 2, 3]));
        assert_eq!(thumbnail(&wide, 128).dimensions(), (128, 25));

        let tall = RgbImage::from_pixel(3, 900, Rgb([1, 2, 3]));
        assert_eq!(thumbnail(&tall, 128).dimensions(), (1, 128));

        let small = RgbImage::from_pixel(20, 10, Rgb([1, 2, 3]));
        assert_eq!(thumbnail(&small, 128).dimensions(), (20, 10));
    }

    #[test]
    fn jpeg_output_decodes_back() {
        let image = RgbImage::from_pixel(16, 8, Rgb([200, 10, 10]));
        let encoded = jpeg_bytes(&image, ANNOTATED_JPEG_QUALITY).unwrap();
        let decoded = image::load_from_memory(&encoded).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }
}
