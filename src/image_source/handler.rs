//! # 核心编排模块
//!
//! ## 设计思路
//!
//! `TableImageSource` 为滚动列表提供“尺寸正确、不阻塞 UI 线程”的图片：
//!
//! 1. `lookup`：调用方线程同步查缓存；打开同步缩放时可从基准图现场缩放
//! 2. `fetch`：登记位置标记 → 合并同 URL 请求 → 后台下载/解码/缩放 → 调度回调用方线程
//! 3. `invalidate_positions`：列表刷新后清空位置标记，让旧请求的回调静默失效
//!
//! ## 实现思路
//!
//! - 缓存、位置标记表、进行中请求表放在同一把 `Mutex` 里，解码和缩放从不持锁执行。
//! - 每个 URL 只缓存一张“基准图”（独立槽位，等比缩小到 `max_size` 以内），
//!   包括 `max_size` 在内的所有请求尺寸都由基准图本地生成精确变体。
//! - 进行中请求按 `(URL, 线路)` 分组：私有请求只会并入直连任务，绝不复用代理下载。
//! - 位置标记检查两次：后台完成时一次（跳过无效投递），调用方线程执行回调前再一次
//!   （覆盖两者之间发生的 `invalidate_positions`）。
//! - 回调执行前释放所有锁，委托方可以在回调里再次调用 `lookup` / `fetch`。

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use super::cache::{CacheSlot, ImageCache};
use super::dispatch::Dispatcher;
use super::fetcher::{FetchRequest, ImageFetcher};
use super::http::{HttpImageFetcher, redact_url_for_log};
use super::pipeline;
use super::positions::PositionTags;
use super::{CacheKey, ImageSize, ImageSourceConfig, ImageSourceError, IndexPath, TableImage};

/// 位置标识需要满足的约束；任何满足条件的类型都自动实现。
pub trait PositionId: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> PositionId for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// 接收图片结果的委托，所有方法都在调用方线程上执行。
pub trait ImageSourceDelegate<P: PositionId = IndexPath>: Send + Sync + 'static {
    /// 请求的图片已下载并缩放到请求尺寸。
    fn image_ready(&self, source: &TableImageSource<P>, image: TableImage, position: P);

    /// 请求失败（下载、解码或缩放）。默认忽略，调用方继续显示占位图即可。
    fn image_failed(&self, _source: &TableImageSource<P>, _url: &str, _position: P, _error: &ImageSourceError) {}
}

struct Waiter<P> {
    position: P,
    size: ImageSize,
    ticket: u64,
}

/// 一个后台任务的身份：同一 URL 经代理与直连是两条独立线路。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InFlightKey {
    url: String,
    via_proxy: bool,
}

struct SourceState<P> {
    cache: ImageCache,
    positions: PositionTags<P>,
    /// 存在即表示已有一个后台任务在处理该线路。
    in_flight: HashMap<InFlightKey, Vec<Waiter<P>>>,
}

struct Shared<P: PositionId> {
    config: Arc<ImageSourceConfig>,
    resizes_synchronously: AtomicBool,
    state: Mutex<SourceState<P>>,
    delegate: RwLock<Option<Arc<dyn ImageSourceDelegate<P>>>>,
    fetcher: Arc<dyn ImageFetcher>,
    dispatcher: Arc<dyn Dispatcher>,
    runtime: tokio::runtime::Handle,
}

/// 列表图片源。克隆得到的是同一个实例的句柄。
pub struct TableImageSource<P: PositionId = IndexPath> {
    shared: Arc<Shared<P>>,
}

impl<P: PositionId> Clone for TableImageSource<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: PositionId> TableImageSource<P> {
    /// 创建图片源。`config.max_size` 在此之后不可更改。
    ///
    /// # 示例
    /// ```rust,ignore
    /// use std::sync::Arc;
    /// use table_image_source::image_source::{ImageSize, ImageSourceConfig, MainQueue, TableImageSource};
    ///
    /// let runtime = tokio::runtime::Runtime::new()?;
    /// let queue = MainQueue::new();
    /// let source: TableImageSource = TableImageSource::with_http(
    ///     ImageSourceConfig::with_max_size(ImageSize::new(600, 600)),
    ///     Arc::new(queue.handle()),
    ///     runtime.handle().clone(),
    /// )?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(
        config: ImageSourceConfig,
        fetcher: Arc<dyn ImageFetcher>,
        dispatcher: Arc<dyn Dispatcher>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self, ImageSourceError> {
        config.validate()?;

        log::info!(
            "⚙️ 图片源初始化 - max_size={} sync_resize={} cache_entries={} filter={} proxy={}",
            config.max_size,
            config.resizes_synchronously,
            config.cache_max_entries,
            config.resize_filter.as_str(),
            if config.use_resizing_proxy { config.proxy_base_url.as_str() } else { "off" }
        );

        let state = SourceState {
            cache: ImageCache::new(config.cache_max_entries, config.cache_max_bytes),
            positions: PositionTags::new(),
            in_flight: HashMap::new(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                resizes_synchronously: AtomicBool::new(config.resizes_synchronously),
                config: Arc::new(config),
                state: Mutex::new(state),
                delegate: RwLock::new(None),
                fetcher,
                dispatcher,
                runtime,
            }),
        })
    }

    /// 使用默认的 HTTP 下载器创建图片源。
    pub fn with_http(
        config: ImageSourceConfig,
        dispatcher: Arc<dyn Dispatcher>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self, ImageSourceError> {
        let fetcher = HttpImageFetcher::new(&config)?;
        Self::new(config, Arc::new(fetcher), dispatcher, runtime)
    }

    pub fn max_size(&self) -> ImageSize {
        self.shared.config.max_size
    }

    pub fn resizes_synchronously(&self) -> bool {
        self.shared.resizes_synchronously.load(Ordering::Relaxed)
    }

    pub fn set_resizes_synchronously(&self, enabled: bool) {
        self.shared.resizes_synchronously.store(enabled, Ordering::Relaxed);
    }

    /// 注册委托，替换之前的委托。委托会一直被持有，直到 `clear_delegate`。
    pub fn set_delegate(&self, delegate: Arc<dyn ImageSourceDelegate<P>>) {
        match self.shared.delegate.write() {
            Ok(mut slot) => *slot = Some(delegate),
            Err(_) => log::warn!("⚠️ 委托写入锁已中毒，忽略 set_delegate"),
        }
    }

    /// 注销委托；之后完成的请求不会再回调任何对象。
    pub fn clear_delegate(&self) {
        if let Ok(mut slot) = self.shared.delegate.write() {
            *slot = None;
        }
    }

    /// 同步查询缓存。
    ///
    /// 精确尺寸命中直接返回；未命中且开启同步缩放时，从基准图在当前线程缩放并写回缓存。
    pub fn lookup(&self, url: &str, size: ImageSize) -> Option<TableImage> {
        if size.is_empty() {
            return None;
        }
        let size = size.clamp_to(self.max_size());
        let slot = CacheSlot::Variant(CacheKey::new(url, size));

        let base = {
            let mut state = self.state()?;
            if let Some(image) = state.cache.get(&slot) {
                return Some(image);
            }
            if !self.resizes_synchronously() {
                return None;
            }
            state.cache.get(&CacheSlot::Base(url.to_string()))?
        };

        let started = Instant::now();
        match pipeline::render_variant(&base, size, self.shared.config.resize_filter) {
            Ok(variant) => {
                log::debug!(
                    "🧩 同步缩放 {} -> {}（{}ms）",
                    base.size(),
                    size,
                    started.elapsed().as_millis()
                );
                if let Some(mut state) = self.state() {
                    state.cache.insert(slot, variant.clone());
                }
                Some(variant)
            }
            Err(err) => {
                log::warn!("⚠️ 同步缩放失败 - {}：{}", redact_url_for_log(url), err);
                None
            }
        }
    }

    /// 异步获取图片，结果通过委托在调用方线程上交付。
    ///
    /// 总是下载 `max_size` 的基准图（公开图片经缩放代理，`is_private` 时直连原图），
    /// 再在后台缩放到 `size`。同一 URL 同一线路的并发请求只会产生一次下载；
    /// 公开请求也可以并入已在进行的直连下载。
    pub fn fetch(&self, url: &str, size: ImageSize, position: P, is_private: bool) {
        if size.is_empty() {
            log::warn!("⚠️ 忽略空尺寸请求 - {} {:?}", redact_url_for_log(url), position);
            return;
        }
        let max_size = self.max_size();
        let size = size.clamp_to(max_size);
        let key = CacheKey::new(url, size);
        let request = FetchRequest::plan(url, max_size, is_private, &self.shared.config);
        let route = InFlightKey {
            url: url.to_string(),
            via_proxy: request.via_proxy,
        };
        let mut joinable = vec![route.clone()];
        if route.via_proxy {
            joinable.push(InFlightKey {
                url: url.to_string(),
                via_proxy: false,
            });
        }

        let Some(mut state) = self.state() else {
            return;
        };
        let ticket = state.positions.register(position.clone(), key.clone());
        let waiter = Waiter {
            position,
            size,
            ticket,
        };

        if let Some(image) = state.cache.get(&CacheSlot::Variant(key)) {
            drop(state);
            self.dispatch_ready(url, waiter, image);
            return;
        }

        let joined = joinable.into_iter().find(|group| state.in_flight.contains_key(group));
        if let Some(group) = joined {
            let waiters = state.in_flight.entry(group).or_default();
            log::debug!(
                "🔗 合并请求 - {} {:?}（等待数 {}）",
                redact_url_for_log(url),
                waiter.position,
                waiters.len() + 1
            );
            waiters.push(waiter);
            return;
        }

        let base = state.cache.get(&CacheSlot::Base(url.to_string()));
        state.in_flight.insert(route.clone(), vec![waiter]);
        drop(state);

        let source = self.clone();
        match base {
            Some(base) => {
                self.shared.runtime.spawn(async move {
                    source.finish(route, Ok(base)).await;
                });
            }
            None => {
                self.shared.runtime.spawn(async move {
                    source.run_fetch(route, request).await;
                });
            }
        }
    }

    /// 清空位置标记。不取消进行中的请求，也不影响缓存。
    pub fn invalidate_positions(&self) {
        if let Some(mut state) = self.state() {
            let cleared = state.positions.invalidate();
            log::debug!("🧹 已清空位置标记 - {} 个", cleared);
        }
    }

    /// 释放全部缓存图片（内存告警时调用）。
    pub fn clear_cache(&self) {
        if let Some(mut state) = self.state() {
            log::info!(
                "🧹 清空图片缓存 - {} 张 / {:.2} MB",
                state.cache.len(),
                state.cache.current_bytes() as f64 / 1024.0 / 1024.0
            );
            state.cache.clear();
        }
    }

    pub fn cached_image_count(&self) -> usize {
        self.state().map(|state| state.cache.len()).unwrap_or(0)
    }

    pub fn in_flight_count(&self) -> usize {
        self.state().map(|state| state.in_flight.len()).unwrap_or(0)
    }

    pub fn tracked_position_count(&self) -> usize {
        self.state().map(|state| state.positions.len()).unwrap_or(0)
    }

    fn state(&self) -> Option<MutexGuard<'_, SourceState<P>>> {
        match self.shared.state.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                log::warn!("⚠️ {}", ImageSourceError::poisoned("图片源状态"));
                None
            }
        }
    }

    fn delegate(&self) -> Option<Arc<dyn ImageSourceDelegate<P>>> {
        self.shared
            .delegate
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(Arc::clone))
    }

    async fn run_fetch(self, group: InFlightKey, request: FetchRequest) {
        let started = Instant::now();
        let url = request.source_url.clone();

        let outcome = match self.shared.fetcher.fetch(&request).await {
            Ok(bytes) => {
                let fetch_elapsed = started.elapsed();
                let config = Arc::clone(&self.shared.config);
                let decode_start = Instant::now();
                let decoded = tokio::task::spawn_blocking(move || pipeline::decode_base(&bytes, &config))
                    .await
                    .map_err(|e| ImageSourceError::State(format!("解码任务异常退出：{}", e)))
                    .and_then(|result| result);

                if let Ok(base) = &decoded {
                    log::info!(
                        "✅ 图片获取完成 - {} proxy={} size={} fetch={}ms decode={}ms",
                        redact_url_for_log(&url),
                        request.via_proxy,
                        base.size(),
                        fetch_elapsed.as_millis(),
                        decode_start.elapsed().as_millis()
                    );
                }
                decoded
            }
            Err(err) => Err(err),
        };

        if let Err(err) = &outcome {
            log::warn!("❌ 图片获取失败 - {}：{}", redact_url_for_log(&url), err);
        }

        self.finish(group, outcome).await;
    }

    /// 写入基准图、摘下等待者，为仍然有效的等待者生成变体并投递。
    async fn finish(&self, group: InFlightKey, outcome: Result<TableImage, ImageSourceError>) {
        let url = group.url.clone();

        let waiters: Vec<Waiter<P>> = {
            let Some(mut state) = self.state() else {
                return;
            };
            if let Ok(base) = &outcome {
                state.cache.insert(CacheSlot::Base(url.clone()), base.clone());
            }
            let waiters = state.in_flight.remove(&group).unwrap_or_default();
            let total = waiters.len();
            let current: Vec<Waiter<P>> = waiters
                .into_iter()
                .filter(|waiter| {
                    state
                        .positions
                        .is_current(&waiter.position, &CacheKey::new(url.as_str(), waiter.size), waiter.ticket)
                })
                .collect();
            if current.len() < total {
                log::debug!("💤 丢弃过期等待者 - {} 个", total - current.len());
            }
            current
        };

        if waiters.is_empty() {
            return;
        }

        let base = match outcome {
            Ok(base) => base,
            Err(err) => {
                for waiter in waiters {
                    self.dispatch_failure(&url, waiter, err.clone());
                }
                return;
            }
        };

        let mut sizes: Vec<ImageSize> = waiters.iter().map(|waiter| waiter.size).collect();
        sizes.sort_by_key(|size| (size.width, size.height));
        sizes.dedup();

        let filter = self.shared.config.resize_filter;
        let rendered = tokio::task::spawn_blocking(move || {
            sizes
                .into_iter()
                .map(|size| (size, pipeline::render_variant(&base, size, filter)))
                .collect::<Vec<_>>()
        })
        .await;

        let variants: HashMap<ImageSize, Result<TableImage, ImageSourceError>> = match rendered {
            Ok(rendered) => rendered.into_iter().collect(),
            Err(e) => {
                let err = ImageSourceError::State(format!("缩放任务异常退出：{}", e));
                waiters.iter().map(|waiter| (waiter.size, Err(err.clone()))).collect()
            }
        };

        if let Some(mut state) = self.state() {
            for (size, variant) in &variants {
                if let Ok(image) = variant {
                    state
                        .cache
                        .insert(CacheSlot::Variant(CacheKey::new(url.as_str(), *size)), image.clone());
                }
            }
        }

        for waiter in waiters {
            match variants.get(&waiter.size) {
                Some(Ok(image)) => self.dispatch_ready(&url, waiter, image.clone()),
                Some(Err(err)) => {
                    log::warn!("⚠️ 变体缩放失败 - {} {}：{}", redact_url_for_log(&url), waiter.size, err);
                    self.dispatch_failure(&url, waiter, err.clone());
                }
                None => {}
            }
        }
    }

    /// 投递到调用方线程；执行前再确认一次位置标记，确认成功即消费该标记。
    fn dispatch_ready(&self, url: &str, waiter: Waiter<P>, image: TableImage) {
        let source = self.clone();
        let key = CacheKey::new(url, waiter.size);

        self.shared.dispatcher.dispatch(Box::new(move || {
            if !source.take_position(&waiter, &key) {
                log::debug!("💤 位置标记已失效，丢弃回调 - {:?}", waiter.position);
                return;
            }
            if let Some(delegate) = source.delegate() {
                delegate.image_ready(&source, image, waiter.position);
            }
        }));
    }

    fn dispatch_failure(&self, url: &str, waiter: Waiter<P>, error: ImageSourceError) {
        let source = self.clone();
        let key = CacheKey::new(url, waiter.size);

        self.shared.dispatcher.dispatch(Box::new(move || {
            if !source.take_position(&waiter, &key) {
                return;
            }
            if let Some(delegate) = source.delegate() {
                delegate.image_failed(&source, &key.url, waiter.position, &error);
            }
        }));
    }

    fn take_position(&self, waiter: &Waiter<P>, key: &CacheKey) -> bool {
        self.state()
            .map(|mut state| state.positions.take_if_current(&waiter.position, key, waiter.ticket))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_source::MainQueue;
    use crate::image_source::fetcher::FetchFuture;
    use bytes::Bytes;
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba};
    use std::io::Cursor;
    use std::time::Duration;

    struct StaticFetcher {
        bytes: Bytes,
    }

    impl ImageFetcher for StaticFetcher {
        fn fetch<'a>(&'a self, _request: &'a FetchRequest) -> FetchFuture<'a> {
            Box::pin(async move { Ok(self.bytes.clone()) })
        }
    }

    fn png(width: u32, height: u32) -> Bytes {
        let img = ImageBuffer::from_fn(width, height, |x, y| Rgba([x as u8, y as u8, 0, 255]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut cursor, ImageFormat::Png)
            .expect("failed to encode test image");
        Bytes::from(cursor.into_inner())
    }

    fn source(runtime: &tokio::runtime::Runtime, queue: &MainQueue) -> TableImageSource<usize> {
        TableImageSource::new(
            ImageSourceConfig::with_max_size(ImageSize::new(200, 200)),
            Arc::new(StaticFetcher { bytes: png(400, 400) }),
            Arc::new(queue.handle()),
            runtime.handle().clone(),
        )
        .expect("source init failed")
    }

    fn wait_until(queue: &MainQueue, done: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            queue.run_next(Duration::from_millis(20));
        }
    }

    #[test]
    fn empty_size_is_ignored() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime init failed");
        let queue = MainQueue::new();
        let source = source(&runtime, &queue);

        assert!(source.lookup("https://example.com/a.png", ImageSize::new(0, 10)).is_none());
        source.fetch("https://example.com/a.png", ImageSize::new(10, 0), 1, false);
        assert_eq!(source.in_flight_count(), 0);
        assert_eq!(source.tracked_position_count(), 0);
    }

    #[test]
    fn completed_fetch_populates_base_and_variant() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime init failed");
        let queue = MainQueue::new();
        let source = source(&runtime, &queue);
        let url = "https://example.com/a.png";

        source.fetch(url, ImageSize::new(50, 50), 7, false);
        wait_until(&queue, || source.in_flight_count() == 0 && source.cached_image_count() == 2);

        let variant = source.lookup(url, ImageSize::new(50, 50)).expect("variant cached");
        assert_eq!(variant.size(), ImageSize::new(50, 50));

        // 基准图只在自己的槽位里，不冒充任何请求尺寸
        assert!(source.lookup(url, source.max_size()).is_none());
        source.set_resizes_synchronously(true);
        let full = source.lookup(url, source.max_size()).expect("rendered from base");
        assert_eq!(full.size(), source.max_size());
    }

    #[test]
    fn oversized_request_is_clamped_to_max_size() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime init failed");
        let queue = MainQueue::new();
        let source = source(&runtime, &queue);
        let url = "https://example.com/a.png";

        source.fetch(url, ImageSize::new(800, 800), 1, false);
        wait_until(&queue, || source.in_flight_count() == 0);

        let image = source.lookup(url, ImageSize::new(800, 800)).expect("clamped size cached");
        assert_eq!(image.size(), source.max_size());
    }

    #[test]
    fn sync_resize_toggle_is_runtime_adjustable() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime init failed");
        let queue = MainQueue::new();
        let source = source(&runtime, &queue);

        assert!(!source.resizes_synchronously());
        source.set_resizes_synchronously(true);
        assert!(source.resizes_synchronously());
    }
}
