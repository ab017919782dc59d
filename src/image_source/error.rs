//! # 错误模型模块
//!
//! ## 设计思路
//!
//! 图片链路（下载 / 解码 / 缩放 / 状态锁）中的所有失败统一为 `ImageSourceError`。
//! 这些错误不会从 `lookup` / `fetch` 直接返回给调用方：
//! 失败的请求只是不再触发 `image_ready`，错误本身会记录日志并交给 `image_failed`。

/// 图片源统一错误类型。
#[derive(Debug, Clone, thiserror::Error)]
pub enum ImageSourceError {
    #[error("网络错误：{0}")]
    Network(String),

    #[error("超时错误：{0}")]
    Timeout(String),

    #[error("格式错误：{0}")]
    InvalidFormat(String),

    #[error("解码错误：{0}")]
    Decode(String),

    #[error("资源限制：{0}")]
    ResourceLimit(String),

    #[error("配置错误：{0}")]
    Config(String),

    /// 内部状态锁中毒或后台任务异常退出。
    #[error("状态错误：{0}")]
    State(String),
}

impl ImageSourceError {
    pub(crate) fn poisoned(what: &str) -> Self {
        Self::State(format!("{}锁已中毒", what))
    }
}
