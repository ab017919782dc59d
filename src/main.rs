//! # 列表图片源 — 命令行入口
//!
//! 预取一组图片并打印交付结果，用于手动验证代理、缓存与回调链路：
//!
//! ```text
//! table-image-source [--config file.json] [--size WxH] [--filter name] [--private] [--timeout 秒] <url>...
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use table_image_source::error::AppError;
use table_image_source::image_source::{
    ImageSize, ImageSourceConfig, ImageSourceDelegate, ImageSourceError, MainQueue, ResizeFilter, TableImage,
    TableImageSource,
};

/// 预取图片并按行号打印交付的尺寸。
#[derive(Parser, Debug)]
#[command(name = "table-image-source")]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON 配置文件，未给出的字段取默认值
    #[arg(long)]
    config: Option<PathBuf>,

    /// 请求尺寸（WxH），默认等于配置中的 max_size
    #[arg(long, value_parser = parse_size)]
    size: Option<ImageSize>,

    /// 覆盖配置中的缩放滤镜
    #[arg(long)]
    filter: Option<ResizeFilter>,

    /// 按私有站点处理：跳过缩放代理，直连原图
    #[arg(long)]
    private: bool,

    /// 等待全部结果的最长时间（秒）
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// 要获取的图片地址
    #[arg(required = true)]
    urls: Vec<String>,
}

fn parse_size(value: &str) -> Result<ImageSize, String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("尺寸格式应为 WxH：{}", value))?;
    let width = width.trim().parse::<u32>().map_err(|e| format!("宽度无效：{}", e))?;
    let height = height.trim().parse::<u32>().map_err(|e| format!("高度无效：{}", e))?;
    let size = ImageSize::new(width, height);
    if size.is_empty() {
        return Err(format!("尺寸不能为空：{}", size));
    }
    Ok(size)
}

/// 打印每一行的交付结果。
struct PrintingDelegate {
    finished: AtomicUsize,
}

impl ImageSourceDelegate<usize> for PrintingDelegate {
    fn image_ready(&self, _source: &TableImageSource<usize>, image: TableImage, position: usize) {
        println!("[{}] ready {}", position, image.size());
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn image_failed(&self, _source: &TableImageSource<usize>, url: &str, position: usize, error: &ImageSourceError) {
        println!("[{}] failed {}: {}", position, url, error);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

fn run(cli: Cli) -> Result<(), AppError> {
    let mut config = match &cli.config {
        Some(path) => ImageSourceConfig::from_json_file(path)?,
        None => ImageSourceConfig::default(),
    };
    if let Some(filter) = cli.filter {
        config.resize_filter = filter;
    }
    let size = cli.size.unwrap_or(config.max_size);

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| AppError::Runtime(format!("无法创建 tokio 运行时：{}", e)))?;
    let queue = MainQueue::new();
    let source: TableImageSource<usize> =
        TableImageSource::with_http(config, Arc::new(queue.handle()), runtime.handle().clone())?;

    let delegate = Arc::new(PrintingDelegate {
        finished: AtomicUsize::new(0),
    });
    source.set_delegate(delegate.clone());

    for (row, url) in cli.urls.iter().enumerate() {
        if let Some(image) = source.lookup(url, size) {
            println!("[{}] cached {}", row, image.size());
            delegate.finished.fetch_add(1, Ordering::SeqCst);
            continue;
        }
        source.fetch(url, size, row, cli.private);
    }

    let deadline = Instant::now() + Duration::from_secs(cli.timeout);
    while delegate.finished.load(Ordering::SeqCst) < cli.urls.len() && Instant::now() < deadline {
        queue.run_next(Duration::from_millis(100));
    }

    let finished = delegate.finished.load(Ordering::SeqCst);
    if finished < cli.urls.len() {
        log::warn!("⏱️ 超时：{} 个请求未完成", cli.urls.len() - finished);
    }
    log::info!("📦 缓存图片 {} 张", source.cached_image_count());

    source.clear_delegate();
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run(Cli::parse()) {
        log::error!("{err}");
        std::process::exit(1);
    }
}
