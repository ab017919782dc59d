//! # HTTP 获取实现
//!
//! ## 设计思路
//!
//! `HttpImageFetcher` 是 `ImageFetcher` 的生产实现，在“尽可能早”的阶段执行校验，
//! 尽快失败，减少无效流量：
//!
//! - 协议与主机安全（默认拒绝本地/内网地址）
//! - 手动跟随重定向，每一跳都重新做安全校验
//! - 可重试状态码与网络错误按指数退避 + 抖动重试
//! - Content-Type / Content-Length 预检，流式读取时持续检查体积与首包/分块超时
//! - 通过 magic bytes 确认内容确实是图片
//!
//! 经代理的请求遇到网络类失败时回退为直连原图；`data:` URL 在本地直接解码。

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose};
use bytes::{Bytes, BytesMut};

use super::fetcher::{FetchFuture, FetchRequest, ImageFetcher};
use super::{ImageSourceConfig, ImageSourceError};

const STREAM_SIGNATURE_PROBE_BYTES: usize = 4096;
const NETWORK_RETRY_MAX_ATTEMPTS: u8 = 3;
const NETWORK_RETRY_BASE_DELAY_MS: u64 = 180;
const BUFFER_INITIAL_CAPACITY: usize = 16 * 1024;
const ACCEPT_IMAGES: &str = "image/avif,image/webp,image/apng,image/*,*/*;q=0.8";

/// 下载相关的配置快照。
#[derive(Debug, Clone)]
struct HttpSettings {
    download_timeout: u64,
    stream_first_byte_timeout_ms: u64,
    stream_chunk_timeout_ms: u64,
    max_redirects: usize,
    max_file_size: u64,
    allow_private_network: bool,
    private_auth_token: Option<String>,
}

impl From<&ImageSourceConfig> for HttpSettings {
    fn from(config: &ImageSourceConfig) -> Self {
        Self {
            download_timeout: config.download_timeout,
            stream_first_byte_timeout_ms: config.stream_first_byte_timeout_ms,
            stream_chunk_timeout_ms: config.stream_chunk_timeout_ms,
            max_redirects: config.max_redirects,
            max_file_size: config.max_file_size,
            allow_private_network: config.allow_private_network,
            private_auth_token: config.private_auth_token.clone(),
        }
    }
}

/// 基于 `reqwest` 的图片下载器。
pub struct HttpImageFetcher {
    client: reqwest::Client,
    settings: HttpSettings,
}

impl HttpImageFetcher {
    /// 创建下载器；HTTP 客户端在这里构建一次并复用。
    pub fn new(config: &ImageSourceConfig) -> Result<Self, ImageSourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download_timeout))
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ImageSourceError::Network(format!("无法创建 HTTP 客户端：{}", e)))?;

        Ok(Self {
            client,
            settings: HttpSettings::from(config),
        })
    }

    async fn fetch_request(&self, request: &FetchRequest) -> Result<Bytes, ImageSourceError> {
        if request.endpoint.starts_with("data:") {
            let bytes = parse_data_url(&request.endpoint, self.settings.max_file_size)?;
            validate_image_signature(&bytes)?;
            return Ok(Bytes::from(bytes));
        }

        match self.download(&request.endpoint, request.is_private).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if request.via_proxy && should_fall_back_to_source(&err) => {
                log::warn!(
                    "⚠️ 代理下载失败，回退原图地址: {}（{}）",
                    redact_url_for_log(&request.source_url),
                    err
                );
                self.download(&request.source_url, request.is_private).await
            }
            Err(err) => Err(err),
        }
    }

    async fn download(&self, url: &str, is_private: bool) -> Result<Bytes, ImageSourceError> {
        log::debug!("🌐 开始下载图片 - URL: {}", redact_url_for_log(url));

        let mut current_url = reqwest::Url::parse(url)
            .map_err(|e| ImageSourceError::InvalidFormat(format!("URL 格式错误：{}", e)))?;
        validate_url_safety(&current_url, self.settings.allow_private_network)?;
        let origin_host = current_url.host_str().map(str::to_ascii_lowercase);

        for redirect_count in 0..=self.settings.max_redirects {
            let same_origin = current_url.host_str().map(str::to_ascii_lowercase) == origin_host;
            let token = if is_private && same_origin {
                self.settings.private_auth_token.as_deref()
            } else {
                None
            };

            let response = self.send_with_retry(&current_url, token).await?;

            if response.status().is_redirection() {
                if redirect_count >= self.settings.max_redirects {
                    return Err(ImageSourceError::Network(format!(
                        "重定向次数超过限制（{}）",
                        self.settings.max_redirects
                    )));
                }

                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .ok_or_else(|| ImageSourceError::Network("重定向响应缺少 Location 头".to_string()))?
                    .to_str()
                    .map_err(|e| ImageSourceError::InvalidFormat(format!("重定向地址无效：{}", e)))?;

                let next_url = current_url
                    .join(location)
                    .map_err(|e| ImageSourceError::InvalidFormat(format!("重定向 URL 解析失败：{}", e)))?;
                validate_url_safety(&next_url, self.settings.allow_private_network)?;

                log::debug!("↪️ 跳转到: {}", redact_url_for_log(next_url.as_str()));
                current_url = next_url;
                continue;
            }

            return self.read_image_body(response).await;
        }

        Err(ImageSourceError::Network("下载流程异常结束".to_string()))
    }

    async fn send_with_retry(
        &self,
        url: &reqwest::Url,
        auth_token: Option<&str>,
    ) -> Result<reqwest::Response, ImageSourceError> {
        let mut attempt: u8 = 1;
        loop {
            let mut builder = self
                .client
                .get(url.clone())
                .header(reqwest::header::ACCEPT, ACCEPT_IMAGES);
            if let Some(token) = auth_token {
                builder = builder.bearer_auth(token);
            }

            match builder.send().await {
                Ok(response) => {
                    if attempt < NETWORK_RETRY_MAX_ATTEMPTS && is_retryable_http_status(response.status()) {
                        let delay_ms = compute_retry_delay_with_jitter(attempt, retry_after_hint_ms(response.headers()));
                        log::warn!(
                            "⚠️ HTTP {}（第 {}/{} 次，可重试）；{}ms 后重试",
                            response.status().as_u16(),
                            attempt,
                            NETWORK_RETRY_MAX_ATTEMPTS,
                            delay_ms
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if attempt >= NETWORK_RETRY_MAX_ATTEMPTS || !(err.is_timeout() || err.is_connect()) {
                        return Err(self.map_reqwest_error(err, url.as_str()));
                    }

                    let delay_ms = compute_retry_delay_with_jitter(attempt, None);
                    log::warn!(
                        "⚠️ 网络请求失败（第 {}/{} 次，可重试）：{}；{}ms 后重试",
                        attempt,
                        NETWORK_RETRY_MAX_ATTEMPTS,
                        redact_url_for_log(url.as_str()),
                        delay_ms
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn read_image_body(&self, mut response: reqwest::Response) -> Result<Bytes, ImageSourceError> {
        let status = response.status();
        if !status.is_success() {
            return Err(ImageSourceError::Network(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status_message(status.as_u16())
            )));
        }

        if let Some(content_type) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
        {
            if !is_image_content_type(content_type) {
                return Err(ImageSourceError::InvalidFormat(format!("不是图片类型：{}", content_type)));
            }
        }

        let max_file_size = self.settings.max_file_size;
        let declared_len = response.content_length();
        if let Some(len) = declared_len {
            if len > max_file_size {
                return Err(ImageSourceError::ResourceLimit(format!(
                    "文件过大：{:.2} MB（限制：{:.2} MB）",
                    len as f64 / 1024.0 / 1024.0,
                    max_file_size as f64 / 1024.0 / 1024.0
                )));
            }
        }

        let initial_capacity = declared_len
            .filter(|len| *len > 0)
            .map(|len| len.min(max_file_size) as usize)
            .unwrap_or(BUFFER_INITIAL_CAPACITY);
        let mut buffer = BytesMut::with_capacity(initial_capacity);
        let mut signature_validated = false;
        let mut received_first_chunk = false;

        loop {
            let read_timeout = if received_first_chunk {
                Duration::from_millis(self.settings.stream_chunk_timeout_ms)
            } else {
                Duration::from_millis(self.settings.stream_first_byte_timeout_ms)
            };

            let next_chunk = tokio::time::timeout(read_timeout, response.chunk())
                .await
                .map_err(|_| {
                    if received_first_chunk {
                        ImageSourceError::Timeout("下载数据流读取超时".to_string())
                    } else {
                        ImageSourceError::Timeout("下载首包超时".to_string())
                    }
                })?
                .map_err(|e| ImageSourceError::Network(format!("下载失败：{}", e)))?;

            let Some(chunk) = next_chunk else {
                break;
            };
            received_first_chunk = true;

            if (buffer.len() + chunk.len()) as u64 > max_file_size {
                return Err(ImageSourceError::ResourceLimit("下载后文件超过大小限制".to_string()));
            }
            buffer.extend_from_slice(&chunk);

            if !signature_validated {
                signature_validated = validate_stream_signature_probe(&buffer, STREAM_SIGNATURE_PROBE_BYTES)?;
            }
        }

        if !signature_validated {
            validate_image_signature(&buffer)?;
        }

        log::debug!("✅ 下载完成 - {} bytes", buffer.len());
        Ok(buffer.freeze())
    }

    fn map_reqwest_error(&self, e: reqwest::Error, url: &str) -> ImageSourceError {
        let message = e.to_string().replace(url, &redact_url_for_log(url));

        if e.is_timeout() {
            ImageSourceError::Timeout(format!("下载超时（{}秒）", self.settings.download_timeout))
        } else if e.is_connect() {
            ImageSourceError::Network(format!("无法连接：{}", message))
        } else {
            ImageSourceError::Network(format!("请求失败：{}", message))
        }
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch<'a>(&'a self, request: &'a FetchRequest) -> FetchFuture<'a> {
        Box::pin(self.fetch_request(request))
    }
}

fn should_fall_back_to_source(err: &ImageSourceError) -> bool {
    matches!(err, ImageSourceError::Network(_) | ImageSourceError::Timeout(_))
}

/// 校验协议与主机；默认阻止本地/内网目标。
fn validate_url_safety(url: &reqwest::Url, allow_private_network: bool) -> Result<(), ImageSourceError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ImageSourceError::InvalidFormat("仅支持 HTTP/HTTPS".to_string()));
    }

    if allow_private_network {
        return Ok(());
    }

    let host = url
        .host_str()
        .ok_or_else(|| ImageSourceError::InvalidFormat("URL 缺少主机地址".to_string()))?;

    if is_local_hostname(host) {
        return Err(ImageSourceError::InvalidFormat(format!("禁止访问本地网络地址：{}", host)));
    }

    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_or_local_ip(ip) {
            return Err(ImageSourceError::InvalidFormat(format!("禁止访问内网 IP：{}", ip)));
        }
    }

    Ok(())
}

fn is_local_hostname(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost") || host.eq_ignore_ascii_case("localhost.") || host.ends_with(".local")
}

fn is_private_or_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || octets[0] == 0
                || (octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || v6.is_unique_local() || v6.is_unicast_link_local()
        }
    }
}

fn retry_after_hint_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let secs = headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(secs.saturating_mul(1000))
}

fn compute_retry_delay_with_jitter(attempt: u8, server_hint_ms: Option<u64>) -> u64 {
    let exp = NETWORK_RETRY_BASE_DELAY_MS.saturating_mul(1_u64 << (attempt.saturating_sub(1) as u32));
    let base = server_hint_ms.unwrap_or(exp);
    let jitter_bound = (base / 2).max(1);
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    base.saturating_add(seed % (jitter_bound + 1))
}

fn is_retryable_http_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn is_image_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|base| {
            let base = base.trim().to_ascii_lowercase();
            base.starts_with("image/") || base == "application/octet-stream"
        })
        .unwrap_or(false)
}

/// 日志中只保留协议、主机、端口与路径，去掉 query 中可能携带的 token。
pub(crate) fn redact_url_for_log(url: &str) -> String {
    if url.starts_with("data:") {
        return "<data-url>".to_string();
    }
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return "<invalid-url>".to_string();
    };

    let host = parsed.host_str().unwrap_or("<unknown-host>");
    let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();
    format!("{}://{}{}{}", parsed.scheme(), host, port, parsed.path())
}

fn status_message(code: u16) -> &'static str {
    match code {
        404 => "未找到",
        401 | 403 => "访问被拒绝",
        500..=599 => "服务器错误",
        _ => "请求失败",
    }
}

/// 解析 `data:image/...;base64,` 地址，解码前先按长度估算体积。
fn parse_data_url(data: &str, max_file_size: u64) -> Result<Vec<u8>, ImageSourceError> {
    let normalized = data.trim();
    if !normalized.starts_with("data:image/") {
        return Err(ImageSourceError::InvalidFormat("仅支持 data:image/ 地址".to_string()));
    }

    let marker = normalized
        .find(";base64,")
        .ok_or_else(|| ImageSourceError::InvalidFormat("缺少 base64 标记".to_string()))?;
    let payload = &normalized[marker + ";base64,".len()..];

    let estimated_len = (payload.len() as u64).div_ceil(4).saturating_mul(3);
    if estimated_len > max_file_size {
        return Err(ImageSourceError::ResourceLimit(format!(
            "Base64 预计解码体积过大：{:.2} MB（限制：{:.2} MB）",
            estimated_len as f64 / 1024.0 / 1024.0,
            max_file_size as f64 / 1024.0 / 1024.0
        )));
    }

    general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| ImageSourceError::Decode(format!("Base64 解码失败：{}", e)))
}

fn validate_image_signature(bytes: &[u8]) -> Result<(), ImageSourceError> {
    if bytes.is_empty() {
        return Err(ImageSourceError::InvalidFormat("图片内容为空".to_string()));
    }

    let kind = infer::get(bytes).ok_or_else(|| ImageSourceError::InvalidFormat("无法识别图片类型".to_string()))?;
    if kind.matcher_type() != infer::MatcherType::Image {
        return Err(ImageSourceError::InvalidFormat(format!(
            "文件签名不是图片类型：{}",
            kind.mime_type()
        )));
    }
    Ok(())
}

/// 流式签名探测：`Ok(true)` 已确认是图片，`Ok(false)` 字节不足继续下载。
fn validate_stream_signature_probe(bytes: &[u8], probe_limit: usize) -> Result<bool, ImageSourceError> {
    if bytes.is_empty() {
        return Ok(false);
    }

    if let Some(kind) = infer::get(bytes) {
        if kind.matcher_type() != infer::MatcherType::Image {
            return Err(ImageSourceError::InvalidFormat(format!(
                "下载内容不是图片类型：{}",
                kind.mime_type()
            )));
        }
        return Ok(true);
    }

    if bytes.len() >= probe_limit {
        return Err(ImageSourceError::InvalidFormat(format!(
            "下载前 {} 字节内无法识别图片类型",
            probe_limit
        )));
    }

    Ok(false)
}
