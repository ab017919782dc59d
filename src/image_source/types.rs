//! # 数据模型
//!
//! ## 设计思路
//!
//! - `ImageSize`：整数像素尺寸，对应列表单元格中图片的显示尺寸
//! - `CacheKey`：`(URL, 尺寸)` 组合键，唯一标识一个缓存变体
//! - `TableImage`：已解码位图的共享句柄（`Arc`），克隆成本极低
//! - `IndexPath`：默认的位置标识 `(section, row)`

use std::fmt;
use std::sync::Arc;

use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};

/// 像素尺寸。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// 宽或高为 0 时视为空尺寸。
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// 两个方向都不超过 `bound`。
    pub fn fits_within(&self, bound: ImageSize) -> bool {
        self.width <= bound.width && self.height <= bound.height
    }

    /// 等比缩小到 `bound` 以内；已在范围内时原样返回，不做放大。
    ///
    /// # 示例
    /// ```rust
    /// use table_image_source::image_source::ImageSize;
    ///
    /// let fitted = ImageSize::new(1200, 600).clamp_to(ImageSize::new(600, 600));
    /// assert_eq!(fitted, ImageSize::new(600, 300));
    /// ```
    pub fn clamp_to(self, bound: ImageSize) -> ImageSize {
        if self.fits_within(bound) || self.is_empty() || bound.is_empty() {
            return self;
        }

        let scale = (bound.width as f64 / self.width as f64)
            .min(bound.height as f64 / self.height as f64);

        ImageSize {
            width: ((self.width as f64 * scale).floor() as u32).clamp(1, bound.width),
            height: ((self.height as f64 * scale).floor() as u32).clamp(1, bound.height),
        }
    }

    /// RGBA 估算的内存占用（字节）。
    pub fn estimated_bytes(&self) -> u64 {
        self.pixels().saturating_mul(4)
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 缓存键：同一 URL 的不同尺寸是不同的条目。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub url: String,
    pub size: ImageSize,
}

impl CacheKey {
    pub fn new(url: impl Into<String>, size: ImageSize) -> Self {
        Self {
            url: url.into(),
            size,
        }
    }
}

/// 可直接显示的位图。
#[derive(Clone)]
pub struct TableImage {
    bitmap: Arc<DynamicImage>,
}

impl TableImage {
    pub fn new(bitmap: DynamicImage) -> Self {
        Self {
            bitmap: Arc::new(bitmap),
        }
    }

    pub fn size(&self) -> ImageSize {
        let (width, height) = self.bitmap.dimensions();
        ImageSize { width, height }
    }

    pub fn bitmap(&self) -> &DynamicImage {
        &self.bitmap
    }

    /// 两个句柄是否指向同一份位图。
    pub fn ptr_eq(&self, other: &TableImage) -> bool {
        Arc::ptr_eq(&self.bitmap, &other.bitmap)
    }
}

impl fmt::Debug for TableImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableImage")
            .field("size", &self.size())
            .finish()
    }
}

/// 列表中的行坐标。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexPath {
    pub section: usize,
    pub row: usize,
}

impl IndexPath {
    pub const fn new(section: usize, row: usize) -> Self {
        Self { section, row }
    }
}

impl fmt::Display for IndexPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.section, self.row)
    }
}
