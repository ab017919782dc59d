//! # 远程获取抽象
//!
//! ## 设计思路
//!
//! `TableImageSource` 只决定“向哪里要什么尺寸”，真正的网络访问交给 `ImageFetcher`。
//! 生产环境使用 [`HttpImageFetcher`](super::HttpImageFetcher)，测试可以注入桩实现并断言请求形状。
//!
//! ## 请求形状
//!
//! - 公开图片：经缩放代理，`{proxy}/{host}{path}?resize={w},{h}`
//! - 私有图片 / 非 HTTP 地址 / 关闭代理：直接请求原始 URL，本地缩放

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use super::{ImageSize, ImageSourceConfig, ImageSourceError};

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Bytes, ImageSourceError>> + Send + 'a>>;

/// 根据请求下载图片原始字节。
pub trait ImageFetcher: Send + Sync + 'static {
    fn fetch<'a>(&'a self, request: &'a FetchRequest) -> FetchFuture<'a>;
}

/// 一次网络获取的完整描述。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// 调用方传入的原始图片地址（也是缓存键中的 URL）。
    pub source_url: String,
    /// 实际请求的地址。
    pub endpoint: String,
    /// 期望代理返回的尺寸（即 `max_size`）。
    pub requested_size: ImageSize,
    pub is_private: bool,
    pub via_proxy: bool,
}

impl FetchRequest {
    /// 按配置决定走代理还是直连。
    pub fn plan(url: &str, requested_size: ImageSize, is_private: bool, config: &ImageSourceConfig) -> Self {
        let proxied = if is_private || !config.use_resizing_proxy {
            None
        } else {
            resizing_proxy_endpoint(url, requested_size, &config.proxy_base_url)
        };

        let via_proxy = proxied.is_some();
        Self {
            source_url: url.to_string(),
            endpoint: proxied.unwrap_or_else(|| url.to_string()),
            requested_size,
            is_private,
            via_proxy,
        }
    }
}

/// 生成缩放代理地址；无法代理（非 HTTP、地址无效）时返回 `None`。
fn resizing_proxy_endpoint(url: &str, size: ImageSize, proxy_base: &str) -> Option<String> {
    let source = reqwest::Url::parse(url).ok()?;
    if source.scheme() != "http" && source.scheme() != "https" {
        return None;
    }
    let host = source.host_str()?;
    let proxy = reqwest::Url::parse(proxy_base).ok()?;
    let resize = format!("{},{}", size.width, size.height);

    if proxy.host_str().is_some_and(|proxy_host| proxy_host.eq_ignore_ascii_case(host)) {
        let mut endpoint = source.clone();
        let kept: Vec<(String, String)> = source
            .query_pairs()
            .filter(|(name, _)| name != "resize")
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        endpoint
            .query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("resize", &resize);
        return Some(endpoint.to_string());
    }

    let mut endpoint = proxy;
    let path = format!(
        "{}/{}{}",
        endpoint.path().trim_end_matches('/'),
        host,
        source.path()
    );
    endpoint.set_path(&path);
    endpoint.set_query(None);
    endpoint.query_pairs_mut().append_pair("resize", &resize);
    Some(endpoint.to_string())
}
