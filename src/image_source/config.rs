//! # 配置模块
//!
//! ## 设计思路
//!
//! 所有可调策略集中在 `ImageSourceConfig`：最大显示尺寸、缓存容量、代理与下载参数。
//! `max_size` 只在构造 `TableImageSource` 时读取一次，之后不可更改。
//!
//! ## 实现思路
//!
//! - `Default` 提供可直接用于生产的配置。
//! - `#[serde(default)]` 允许 JSON 文件只写需要覆盖的字段。
//! - `validate` 在构造前统一做范围校验，尽早失败。
//! - `ResizeFilter` 负责滤镜字符串（JSON 与命令行共用一套名字）与 `FilterType` 的互转。

use std::fs;
use std::path::Path;
use std::str::FromStr;

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use super::{ImageSize, ImageSourceError};
use crate::error::AppError;

/// 图片源配置。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSourceConfig {
    /// 预计的最大显示尺寸，缓存中的任何图片都不会超过它。
    pub max_size: ImageSize,
    /// 有更大尺寸缓存时，`lookup` 是否直接在调用线程上缩放。
    pub resizes_synchronously: bool,
    /// 缓存最多保留的图片数量。
    pub cache_max_entries: usize,
    /// 缓存位图的总内存预算（按 RGBA 估算，字节）。
    pub cache_max_bytes: u64,
    /// 公开图片是否经由缩放代理下载。
    pub use_resizing_proxy: bool,
    /// 缩放代理地址（Photon 风格）。
    pub proxy_base_url: String,
    /// 私有站点图片附带的 Bearer token。
    pub private_auth_token: Option<String>,
    /// 本地缩放滤镜。
    pub resize_filter: ResizeFilter,
    /// 网络下载超时时间（秒）。
    pub download_timeout: u64,
    /// 建立连接超时时间（秒）。
    pub connect_timeout: u64,
    /// 下载首包超时时间（毫秒）。
    pub stream_first_byte_timeout_ms: u64,
    /// 下载分块读取超时时间（毫秒）。
    pub stream_chunk_timeout_ms: u64,
    /// 最大重定向次数。
    pub max_redirects: usize,
    /// 单张图片原始字节上限。
    pub max_file_size: u64,
    /// 是否允许访问内网或本地地址。
    pub allow_private_network: bool,
    /// 解码后的像素上限（`width * height`）。
    pub max_decoded_pixels: u64,
}

impl Default for ImageSourceConfig {
    fn default() -> Self {
        Self {
            max_size: ImageSize::new(600, 600),
            resizes_synchronously: false,
            cache_max_entries: 256,
            cache_max_bytes: 96 * 1024 * 1024,
            use_resizing_proxy: true,
            proxy_base_url: "https://i0.wp.com".to_string(),
            private_auth_token: None,
            resize_filter: ResizeFilter::Triangle,
            download_timeout: 30,
            connect_timeout: 8,
            stream_first_byte_timeout_ms: 10_000,
            stream_chunk_timeout_ms: 15_000,
            max_redirects: 5,
            max_file_size: 20 * 1024 * 1024,
            allow_private_network: false,
            max_decoded_pixels: 40_000_000,
        }
    }
}

impl ImageSourceConfig {
    /// 以指定最大尺寸创建配置，其余字段取默认值。
    pub fn with_max_size(max_size: ImageSize) -> Self {
        Self {
            max_size,
            ..Self::default()
        }
    }

    /// 从 JSON 文件读取配置并校验。
    ///
    /// # 示例
    /// ```rust,ignore
    /// use table_image_source::image_source::ImageSourceConfig;
    ///
    /// let config = ImageSourceConfig::from_json_file("image-source.json".as_ref())?;
    /// # Ok::<(), table_image_source::error::AppError>(())
    /// ```
    pub fn from_json_file(path: &Path) -> Result<Self, AppError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| AppError::Config(format!("解析配置文件失败（{}）：{}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ImageSourceError> {
        if self.max_size.is_empty() {
            return Err(ImageSourceError::Config("max_size 的宽高必须大于 0".to_string()));
        }
        if self.cache_max_entries == 0 {
            return Err(ImageSourceError::Config("cache_max_entries 不能为 0".to_string()));
        }
        if self.cache_max_bytes < self.max_size.estimated_bytes() {
            return Err(ImageSourceError::Config(
                "cache_max_bytes 不能小于一张 max_size 图片的内存".to_string(),
            ));
        }
        if !(1..=300).contains(&self.download_timeout) {
            return Err(ImageSourceError::Config("download_timeout 必须在 1~300 秒之间".to_string()));
        }
        if !(1..=120).contains(&self.connect_timeout) {
            return Err(ImageSourceError::Config("connect_timeout 必须在 1~120 秒之间".to_string()));
        }
        if !(500..=120_000).contains(&self.stream_first_byte_timeout_ms) {
            return Err(ImageSourceError::Config(
                "stream_first_byte_timeout_ms 必须在 500~120000 毫秒之间".to_string(),
            ));
        }
        if !(500..=120_000).contains(&self.stream_chunk_timeout_ms) {
            return Err(ImageSourceError::Config(
                "stream_chunk_timeout_ms 必须在 500~120000 毫秒之间".to_string(),
            ));
        }
        if self.max_file_size == 0 || self.max_decoded_pixels == 0 {
            return Err(ImageSourceError::Config("体积与像素上限必须大于 0".to_string()));
        }
        if self.use_resizing_proxy {
            let parsed = reqwest::Url::parse(&self.proxy_base_url).map_err(|e| {
                ImageSourceError::Config(format!("proxy_base_url 无效：{}", e))
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(ImageSourceError::Config("proxy_base_url 仅支持 HTTP/HTTPS".to_string()));
            }
        }
        Ok(())
    }
}

/// 本地缩放滤镜。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResizeFilter {
    Nearest,
    Triangle,
    CatmullRom,
    Gaussian,
    Lanczos3,
}

impl FromStr for ResizeFilter {
    type Err = ImageSourceError;

    fn from_str(filter: &str) -> Result<Self, Self::Err> {
        match filter.trim().to_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "triangle" => Ok(Self::Triangle),
            "catmull-rom" | "catmullrom" => Ok(Self::CatmullRom),
            "gaussian" => Ok(Self::Gaussian),
            "lanczos3" => Ok(Self::Lanczos3),
            other => Err(ImageSourceError::Config(format!(
                "未知缩放滤镜：{}（可选：nearest / triangle / catmull-rom / gaussian / lanczos3）",
                other
            ))),
        }
    }
}

impl ResizeFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Triangle => "triangle",
            Self::CatmullRom => "catmull-rom",
            Self::Gaussian => "gaussian",
            Self::Lanczos3 => "lanczos3",
        }
    }

    pub fn filter_type(self) -> FilterType {
        match self {
            Self::Nearest => FilterType::Nearest,
            Self::Triangle => FilterType::Triangle,
            Self::CatmullRom => FilterType::CatmullRom,
            Self::Gaussian => FilterType::Gaussian,
            Self::Lanczos3 => FilterType::Lanczos3,
        }
    }
}
