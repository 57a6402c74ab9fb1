//! Turns uploaded image bytes into the `(1, H, W, 3)` batches the classifiers expect.

use std::str::FromStr;

use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageFormat, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SNIFF_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

impl ImageSize {
    pub fn square(side: u32) -> Self {
        Self {
            height: side,
            width: side,
        }
    }
}

/// How an image is brought to the model's input resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    /// Center-crop to the target aspect ratio, then resize.
    #[default]
    Smart,
    /// Stretch to the target size.
    Raw,
    /// Keep the aspect ratio and pad the borders with black.
    Pad,
}

impl FromStr for ResizeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "smart" => Ok(ResizeMode::Smart),
            "raw" => Ok(ResizeMode::Raw),
            "pad" => Ok(ResizeMode::Pad),
            other => Err(format!("unknown resize mode '{}'", other)),
        }
    }
}

/// Identifies the image format from its header and returns it with its file extension.
pub fn sniff_format(bytes: &[u8]) -> Result<(ImageFormat, &'static str)> {
    let header = &bytes[..bytes.len().min(SNIFF_LEN)];
    let format = image::guess_format(header)
        .map_err(|_| Error::Decode("unrecognized image format".to_string()))?;
    let extension = format
        .extensions_str()
        .first()
        .copied()
        .ok_or_else(|| Error::Decode(format!("unsupported image format {:?}", format)))?;
    Ok((format, extension))
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    let (format, _) = sniff_format(bytes)?;
    Ok(image::load_from_memory_with_format(bytes, format)?)
}

pub fn resize(img: &DynamicImage, size: ImageSize, mode: ResizeMode) -> RgbImage {
    let rgb = img.to_rgb8();
    match mode {
        ResizeMode::Raw => {
            image::imageops::resize(&rgb, size.width, size.height, FilterType::Triangle)
        }
        ResizeMode::Smart => smart_resize(&rgb, size),
        ResizeMode::Pad => pad_resize(&rgb, size),
    }
}

fn smart_resize(rgb: &RgbImage, size: ImageSize) -> RgbImage {
    let (width, height) = rgb.dimensions();
    let (target_w, target_h) = (size.width as u64, size.height as u64);

    let crop_h = ((width as u64 * target_h) / target_w).min(height as u64) as u32;
    let crop_w = ((height as u64 * target_w) / target_h).min(width as u64) as u32;
    let crop_h = crop_h.max(1);
    let crop_w = crop_w.max(1);
    let y0 = (height - crop_h) / 2;
    let x0 = (width - crop_w) / 2;

    let cropped = image::imageops::crop_imm(rgb, x0, y0, crop_w, crop_h).to_image();
    image::imageops::resize(&cropped, size.width, size.height, FilterType::Triangle)
}

fn pad_resize(rgb: &RgbImage, size: ImageSize) -> RgbImage {
    let (width, height) = rgb.dimensions();

    // scale the longer side to the target, keep the ratio
    let scale = f64::min(
        size.width as f64 / width as f64,
        size.height as f64 / height as f64,
    );
    let new_w = ((width as f64 * scale).round() as u32).clamp(1, size.width);
    let new_h = ((height as f64 * scale).round() as u32).clamp(1, size.height);
    let resized = image::imageops::resize(rgb, new_w, new_h, FilterType::Triangle);

    let mut canvas = RgbImage::new(size.width, size.height);
    let pad_x = (size.width - new_w) / 2;
    let pad_y = (size.height - new_h) / 2;
    image::imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);
    canvas
}

/// Resizes, scales to `[0, 1]` and wraps the image into a batch of one (NHWC).
pub fn prepare(img: &DynamicImage, size: ImageSize, mode: ResizeMode) -> Array4<f32> {
    let resized = resize(img, size, mode);
    let (w, h) = resized.dimensions();
    Array4::from_shape_fn((1, h as usize, w as usize, 3), |(_, y, x, c)| {
        resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

pub fn prepare_bytes(bytes: &[u8], size: ImageSize, mode: ResizeMode) -> Result<Array4<f32>> {
    let img = decode(bytes)?;
    let (w, h) = img.dimensions();
    tracing::debug!(width = w, height = h, ?mode, "decoded upload");
    Ok(prepare(&img, size, mode))
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| Error::Server(format!("PNG encoding failed: {}", e)))?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbaImage};
    use rstest::rstest;

    fn gradient_image(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x * 255 / w.max(1)) as u8, (y * 255 / h.max(1)) as u8, 200])
        }))
    }

    #[rstest]
    #[case(ResizeMode::Smart, 300, 200, 224, 224)]
    #[case(ResizeMode::Raw, 300, 200, 224, 224)]
    #[case(ResizeMode::Pad, 300, 200, 224, 224)]
    #[case(ResizeMode::Smart, 64, 512, 80, 80)]
    #[case(ResizeMode::Pad, 17, 3, 32, 48)]
    #[case(ResizeMode::Raw, 1, 1, 10, 20)]
    fn batch_has_requested_shape_and_unit_range(
        #[case] mode: ResizeMode,
        #[case] src_w: u32,
        #[case] src_h: u32,
        #[case] height: u32,
        #[case] width: u32,
    ) {
        let img = gradient_image(src_w, src_h);
        let batch = prepare(&img, ImageSize { height, width }, mode);
        assert_eq!(batch.shape(), &[1, height as usize, width as usize, 3]);
        assert!(batch.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn greyscale_and_alpha_inputs_become_three_channels() {
        let grey = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 10, Luma([255])));
        let batch = prepare(&grey, ImageSize::square(4), ResizeMode::Raw);
        assert_eq!(batch.shape(), &[1, 4, 4, 3]);
        assert!(batch.iter().all(|v| (*v - 1.0).abs() < 1e-6));

        let rgba = DynamicImage::ImageRgba8(RgbaImage::new(8, 8));
        assert_eq!(
            prepare(&rgba, ImageSize::square(4), ResizeMode::Smart).shape(),
            &[1, 4, 4, 3]
        );
    }

    #[test]
    fn pad_mode_leaves_black_borders() {
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 10, Rgb([255, 255, 255])));
        let batch = prepare(&white, ImageSize::square(40), ResizeMode::Pad);
        assert_eq!(batch[[0, 0, 20, 0]], 0.0);
        assert!((batch[[0, 20, 20, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn sniffs_png_and_jpeg_headers() {
        let png = encode_png(&gradient_image(4, 4)).unwrap();
        assert_eq!(sniff_format(&png).unwrap(), (ImageFormat::Png, "png"));

        let mut jpeg = std::io::Cursor::new(Vec::new());
        gradient_image(4, 4)
            .write_to(&mut jpeg, ImageFormat::Jpeg)
            .unwrap();
        assert_eq!(sniff_format(jpeg.get_ref()).unwrap().1, "jpg");
    }

    #[rstest]
    #[case(b"".as_slice())]
    #[case(b"not an image at all".as_slice())]
    fn rejects_unknown_bytes(#[case] bytes: &[u8]) {
        assert!(matches!(decode(bytes), Err(Error::Decode(_))));
    }

    #[test]
    fn truncated_png_is_a_decode_error() {
        let png = encode_png(&gradient_image(16, 16)).unwrap();
        let truncated = &png[..png.len() / 2];
        assert!(matches!(
            prepare_bytes(truncated, ImageSize::square(8), ResizeMode::Raw),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn parses_resize_mode_names() {
        assert_eq!("SMART".parse::<ResizeMode>().unwrap(), ResizeMode::Smart);
        assert_eq!("pad".parse::<ResizeMode>().unwrap(), ResizeMode::Pad);
        assert!("bicubic".parse::<ResizeMode>().is_err());
    }
}
