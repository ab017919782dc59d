//! # 列表图片源模块（image_source）
//!
//! ## 设计思路
//!
//! 为滚动列表的可见行提供尺寸精确的图片，同时不阻塞调用方（UI）线程。
//! 按职责拆分为多个子模块：
//!
//! - `handler`：`TableImageSource` 本体，编排查询、下载、缩放与回调
//! - `cache`：LRU 内存缓存（条目数 + 字节预算）
//! - `positions`：位置标记表，负责丢弃过期回调
//! - `dispatch`：把回调送回调用方线程的 `Dispatcher`
//! - `fetcher`：下载抽象与缩放代理请求形状
//! - `http`：基于 reqwest 的默认下载实现
//! - `pipeline`：解码、降采样、精确尺寸变体
//! - `config/error/types`：配置、错误、数据模型
//!
//! ## 新同事快速上手
//!
//! ```text
//! 列表控制器
//!    │ lookup(url, size) ──────────────► cache 命中？直接返回
//!    │ fetch(url, size, row, private)
//!    ↓
//! handler.rs（登记 row → 合并同 URL 请求）
//!    ↓ tokio 后台
//! fetcher.rs / http.rs（代理 or 直连下载）
//!    ↓ spawn_blocking
//! pipeline.rs（解码 → 基准图 → 目标尺寸）
//!    ↓ Dispatcher
//! 调用方线程：再次确认 row 标记 → delegate.image_ready
//! ```

mod cache;
mod config;
mod dispatch;
mod error;
mod fetcher;
mod handler;
mod http;
mod pipeline;
mod positions;
mod types;

pub use config::{ImageSourceConfig, ResizeFilter};
pub use dispatch::{Dispatcher, Job, MainQueue, MainQueueHandle};
pub use error::ImageSourceError;
pub use fetcher::{FetchFuture, FetchRequest, ImageFetcher};
pub use handler::{ImageSourceDelegate, PositionId, TableImageSource};
pub use http::HttpImageFetcher;
pub use types::{CacheKey, ImageSize, IndexPath, TableImage};
