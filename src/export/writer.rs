use std::path::Path;

use image::{GrayImage, ImageFormat, ImageResult, Luma, Rgb, RgbImage};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColorMode {
    #[default]
    Rgb,
    /// Single channel, ITU-R 601-2 luma.
    Grayscale,
}

fn luma([r, g, b]: [u8; 3]) -> u8 {
    ((u32::from(r) * 19595 + u32::from(g) * 38470 + u32::from(b) * 7471 + 0x8000) >> 16) as u8
}

pub fn to_luma(img: &RgbImage) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let Rgb(px) = *img.get_pixel(x, y);
        Luma([luma(px)])
    })
}

/// Encodes `img` as PNG at `path`. The parent directory must exist.
pub fn write_image(img: &RgbImage, path: &Path, color: ColorMode) -> ImageResult<()> {
    match color {
        ColorMode::Rgb => img.save_with_format(path, ImageFormat::Png),
        ColorMode::Grayscale => to_luma(img).save_with_format(path, ImageFormat::Png),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ColorType;

    fn sample() -> RgbImage {
        RgbImage::from_fn(32, 32, |x, y| Rgb([x as u8 * 8, y as u8 * 8, 200]))
    }

    #[test]
    fn luma_weights() {
        assert_eq!(luma([0, 0, 0]), 0);
        assert_eq!(luma([255, 255, 255]), 255);
        assert_eq!(luma([255, 0, 0]), 76);
        assert_eq!(luma([0, 255, 0]), 150);
        assert_eq!(luma([0, 0, 255]), 29);
    }

    #[test]
    fn channel_count_follows_color_mode() {
        let dir = tempfile::tempdir().unwrap();
        let rgb = dir.path().join("rgb.png");
        let gray = dir.path().join("gray.png");
        write_image(&sample(), &rgb, ColorMode::Rgb).unwrap();
        write_image(&sample(), &gray, ColorMode::Grayscale).unwrap();

        let rgb = image::open(rgb).unwrap();
        let gray = image::open(gray).unwrap();
        assert_eq!(rgb.color(), ColorType::Rgb8);
        assert_eq!(rgb.color().channel_count(), 3);
        assert_eq!(gray.color(), ColorType::L8);
        assert_eq!(gray.color().channel_count(), 1);
        assert_eq!(rgb.to_rgb8(), sample());
    }

    #[test]
    fn missing_parent_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("7").join("img.png");
        assert!(write_image(&sample(), &path, ColorMode::Rgb).is_err());
        assert!(!dir.path().join("7").exists());
    }
}
