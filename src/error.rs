//! 统一错误类型模块
//!
//! # 设计思路
//!
//! `ImageSourceError` 只在图片链路内部流转；配置文件读取与命令行入口
//! 这类“面向宿主”的操作统一返回 `AppError`。
//!
//! # 实现思路
//!
//! - 使用 `thiserror` 派生可读错误消息。
//! - 为 `ImageSourceError` 与 `std::io::Error` 提供 `From` 转换，无需手动 map。

use crate::image_source::ImageSourceError;

/// 应用级统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 图片链路错误（含配置校验失败）
    #[error("{0}")]
    Image(#[from] ImageSourceError),

    /// 文件系统 I/O 错误
    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),

    /// 配置文件无法解析
    #[error("配置错误: {0}")]
    Config(String),

    /// 后台运行时无法创建
    #[error("运行时错误: {0}")]
    Runtime(String),
}
