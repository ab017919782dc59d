//! # 解码与缩放流水线
//!
//! ## 设计思路
//!
//! 流水线只有两个入口，均为纯 CPU 计算，由调用方决定在哪个线程运行：
//!
//! 1. `decode_base`：字节 → 位图，先读 header 尺寸做像素上限检查，
//!    再完整解码，最后等比缩小到 `max_size` 以内（不放大）。
//!    结果作为该 URL 的“基准图”缓存在独立的 `CacheSlot::Base` 槽位。
//! 2. `render_variant`：基准图 → 精确尺寸变体。按 aspect-fill 居中裁剪后缩放，
//!    保证输出宽高与请求完全一致，列表绘制时无需再缩放。
//!
//! 缩放优先使用 `fast_image_resize`，失败时回退 `image::resize_exact`。

use std::io::Cursor;

use fast_image_resize as fr;
use image::{DynamicImage, GenericImageView, ImageBuffer, ImageReader, Rgba};

use super::{ImageSize, ImageSourceConfig, ImageSourceError, ResizeFilter, TableImage};

/// 解码下载到的字节，并限制在 `max_size` 以内。
pub(crate) fn decode_base(bytes: &[u8], config: &ImageSourceConfig) -> Result<TableImage, ImageSourceError> {
    let header = inspect_dimensions(bytes)?;
    validate_pixel_limit(header, config.max_decoded_pixels)?;

    let decoded = image::load_from_memory(bytes)
        .map_err(|e| ImageSourceError::Decode(format!("图片解码失败：{}", e)))?;
    let (width, height) = decoded.dimensions();
    let decoded_size = ImageSize::new(width, height);
    validate_pixel_limit(decoded_size, config.max_decoded_pixels)?;

    if decoded_size.is_empty() {
        return Err(ImageSourceError::Decode("解码结果为空图片".to_string()));
    }

    let fitted = decoded_size.clamp_to(config.max_size);
    if fitted == decoded_size {
        return Ok(TableImage::new(decoded));
    }

    log::debug!("🧩 基准图降采样：{} -> {}", decoded_size, fitted);
    Ok(TableImage::new(resize_exact(&decoded, fitted, config.resize_filter)))
}

/// 从基准图生成精确尺寸的变体。
pub(crate) fn render_variant(
    base: &TableImage,
    target: ImageSize,
    filter: ResizeFilter,
) -> Result<TableImage, ImageSourceError> {
    if target.is_empty() {
        return Err(ImageSourceError::ResourceLimit(format!("目标尺寸无效：{}", target)));
    }

    let source_size = base.size();
    if source_size == target {
        return Ok(base.clone());
    }
    if source_size.is_empty() {
        return Err(ImageSourceError::Decode("基准图为空".to_string()));
    }

    let (x, y, crop) = aspect_fill_crop(source_size, target);
    let bitmap = base.bitmap();
    let cropped = if crop == source_size {
        None
    } else {
        Some(bitmap.crop_imm(x, y, crop.width, crop.height))
    };

    Ok(TableImage::new(resize_exact(
        cropped.as_ref().unwrap_or(bitmap),
        target,
        filter,
    )))
}

/// 计算与目标宽高比一致的最大居中裁剪区域，返回 `(x, y, 尺寸)`。
fn aspect_fill_crop(source: ImageSize, target: ImageSize) -> (u32, u32, ImageSize) {
    let source_ratio = source.width as f64 / source.height as f64;
    let target_ratio = target.width as f64 / target.height as f64;

    let crop = if source_ratio > target_ratio {
        let width = (source.height as f64 * target_ratio).round() as u32;
        ImageSize::new(width.clamp(1, source.width), source.height)
    } else {
        let height = (source.width as f64 / target_ratio).round() as u32;
        ImageSize::new(source.width, height.clamp(1, source.height))
    };

    (
        (source.width - crop.width) / 2,
        (source.height - crop.height) / 2,
        crop,
    )
}

fn inspect_dimensions(bytes: &[u8]) -> Result<ImageSize, ImageSourceError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ImageSourceError::InvalidFormat(format!("无法识别图片格式：{}", e)))?;

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| ImageSourceError::InvalidFormat(format!("无法读取图片尺寸：{}", e)))?;
    Ok(ImageSize::new(width, height))
}

fn validate_pixel_limit(size: ImageSize, max_pixels: u64) -> Result<(), ImageSourceError> {
    if size.pixels() > max_pixels {
        return Err(ImageSourceError::ResourceLimit(format!(
            "图片像素过大：{} 像素（限制：{} 像素）",
            size.pixels(),
            max_pixels
        )));
    }
    Ok(())
}

fn resize_exact(image: &DynamicImage, target: ImageSize, filter: ResizeFilter) -> DynamicImage {
    match resize_with_fast_image_resize(image, target, filter) {
        Ok(resized) => resized,
        Err(err) => {
            log::warn!("⚠️ fast_image_resize 缩放失败，回退 image::resize_exact：{}", err);
            image.resize_exact(target.width, target.height, filter.filter_type())
        }
    }
}

fn resize_with_fast_image_resize(
    image: &DynamicImage,
    target: ImageSize,
    filter: ResizeFilter,
) -> Result<DynamicImage, ImageSourceError> {
    let src = image.to_rgba8();
    let (src_width, src_height) = src.dimensions();

    let src_image = fr::images::Image::from_vec_u8(src_width, src_height, src.into_raw(), fr::PixelType::U8x4)
        .map_err(|e| ImageSourceError::Decode(format!("构建源图像缓冲失败：{}", e)))?;
    let mut dst_image = fr::images::Image::new(target.width, target.height, fr::PixelType::U8x4);

    let options = fr::ResizeOptions::new().resize_alg(to_fast_algorithm(filter));
    fr::Resizer::new()
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| ImageSourceError::Decode(format!("fast_image_resize 执行失败：{}", e)))?;

    let rgba = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(target.width, target.height, dst_image.into_vec())
        .ok_or_else(|| ImageSourceError::Decode("fast_image_resize 输出缓冲长度异常".to_string()))?;

    Ok(DynamicImage::ImageRgba8(rgba))
}

fn to_fast_algorithm(filter: ResizeFilter) -> fr::ResizeAlg {
    match filter {
        ResizeFilter::Nearest => fr::ResizeAlg::Nearest,
        ResizeFilter::Triangle => fr::ResizeAlg::Convolution(fr::FilterType::Bilinear),
        ResizeFilter::CatmullRom => fr::ResizeAlg::Convolution(fr::FilterType::CatmullRom),
        ResizeFilter::Gaussian => fr::ResizeAlg::Convolution(fr::FilterType::Mitchell),
        ResizeFilter::Lanczos3 => fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbaImage};
    use proptest::prelude::*;

    fn create_png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x % 255) as u8, (y % 255) as u8, ((x + y) % 255) as u8, 255])
        });
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut cursor, ImageFormat::Png)
            .expect("failed to encode test image");
        cursor.into_inner()
    }

    fn blank(width: u32, height: u32) -> TableImage {
        TableImage::new(DynamicImage::ImageRgba8(RgbaImage::new(width, height)))
    }

    #[test]
    fn large_source_is_downsized_to_fit_max_size() {
        let config = ImageSourceConfig::with_max_size(ImageSize::new(300, 300));
        let base = decode_base(&create_png_bytes(1200, 600), &config).expect("decode should succeed");

        assert_eq!(base.size(), ImageSize::new(300, 150));
    }

    #[test]
    fn small_source_is_never_upscaled() {
        let config = ImageSourceConfig::with_max_size(ImageSize::new(300, 300));
        let base = decode_base(&create_png_bytes(120, 80), &config).expect("decode should succeed");

        assert_eq!(base.size(), ImageSize::new(120, 80));
    }

    #[test]
    fn decode_rejects_too_many_pixels() {
        let mut config = ImageSourceConfig::default();
        config.max_decoded_pixels = 10_000;

        let result = decode_base(&create_png_bytes(200, 200), &config);
        assert!(matches!(result, Err(ImageSourceError::ResourceLimit(_))));
    }

    #[test]
    fn decode_rejects_garbage() {
        let result = decode_base(b"<html>not an image</html>", &ImageSourceConfig::default());
        assert!(matches!(result, Err(ImageSourceError::InvalidFormat(_))));
    }

    #[test]
    fn variant_has_exact_target_size() {
        let variant = render_variant(&blank(600, 300), ImageSize::new(100, 100), ResizeFilter::Triangle)
            .expect("render should succeed");
        assert_eq!(variant.size(), ImageSize::new(100, 100));
    }

    #[test]
    fn variant_of_same_size_reuses_the_bitmap() {
        let base = blank(64, 64);
        let variant = render_variant(&base, ImageSize::new(64, 64), ResizeFilter::Nearest)
            .expect("render should succeed");
        assert!(variant.ptr_eq(&base));
    }

    #[test]
    fn variant_rejects_empty_target() {
        let result = render_variant(&blank(10, 10), ImageSize::new(0, 10), ResizeFilter::Nearest);
        assert!(matches!(result, Err(ImageSourceError::ResourceLimit(_))));
    }

    #[test]
    fn crop_is_centered_on_the_long_side() {
        let (x, y, crop) = aspect_fill_crop(ImageSize::new(400, 100), ImageSize::new(100, 100));
        assert_eq!((x, y), (150, 0));
        assert_eq!(crop, ImageSize::new(100, 100));
    }

    proptest! {
        #[test]
        fn crop_region_stays_inside_source(
            sw in 1u32..5_000,
            sh in 1u32..5_000,
            tw in 1u32..2_000,
            th in 1u32..2_000,
        ) {
            let source = ImageSize::new(sw, sh);
            let (x, y, crop) = aspect_fill_crop(source, ImageSize::new(tw, th));
            prop_assert!(!crop.is_empty());
            prop_assert!(x + crop.width <= sw);
            prop_assert!(y + crop.height <= sh);
        }
    }
}
