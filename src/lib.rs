//! # 列表图片源 — 库入口
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │              调用方（列表 / 表格控制器，UI 线程）          │
//! │                                                          │
//! │  lookup ── fetch ── invalidate_positions ── MainQueue    │
//! └───────┼──────────────────────────────────────▲───────────┘
//!         ↓                                      │ Dispatcher
//! ┌───────┼──────────────────────────────────────┼───────────┐
//! │       ↓         后台（tokio runtime）         │           │
//! │                                                          │
//! │  ┌─ image_source ── TableImageSource                     │
//! │  │   ├─ cache       LRU 位图缓存（url, size）             │
//! │  │   ├─ positions   位置标记 + 票据                       │
//! │  │   ├─ fetcher     缩放代理 / 直连请求形状               │
//! │  │   ├─ http        reqwest 下载 + 安全校验               │
//! │  │   └─ pipeline    解码·降采样·精确尺寸                  │
//! │  │                                                       │
//! │  └─ error ───────── AppError (配置文件 / 命令行)          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 应用级错误类型 `AppError` |
//! | [`image_source`] | 图片缓存、合并下载、后台缩放、调用方线程回调 |

pub mod error;
pub mod image_source;
