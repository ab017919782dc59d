//! # 内存缓存模块
//!
//! 基于 `lru::LruCache`，同时受“条目数”和“估算字节数”两个上限约束。
//! 超出任一上限时按最近最少使用顺序淘汰。
//!
//! 每个 URL 的基准图单独占一个槽位（`CacheSlot::Base`），不与任何请求尺寸共用键：
//! 基准图只是等比缩小，宽高未必等于某个请求尺寸。

use std::fmt;
use std::num::NonZeroUsize;

use lru::LruCache;

use super::{CacheKey, TableImage};

/// 缓存槽位：URL 的基准图，或某个精确尺寸的变体。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum CacheSlot {
    Base(String),
    Variant(CacheKey),
}

impl From<CacheKey> for CacheSlot {
    fn from(key: CacheKey) -> Self {
        Self::Variant(key)
    }
}

impl fmt::Display for CacheSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base(_) => write!(f, "base"),
            Self::Variant(key) => write!(f, "{}", key.size),
        }
    }
}

pub(crate) struct ImageCache {
    entries: LruCache<CacheSlot, TableImage>,
    max_bytes: u64,
    current_bytes: u64,
}

impl ImageCache {
    pub(crate) fn new(max_entries: usize, max_bytes: u64) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            max_bytes,
            current_bytes: 0,
        }
    }

    /// 命中时同时刷新该条目的使用顺序。
    pub(crate) fn get(&mut self, slot: &CacheSlot) -> Option<TableImage> {
        self.entries.get(slot).cloned()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, slot: &CacheSlot) -> bool {
        self.entries.contains(slot)
    }

    /// 写入一张图片，返回是否真正入缓存。
    ///
    /// 单张超过总预算的图片直接拒绝，避免把整个缓存挤空。
    pub(crate) fn insert(&mut self, slot: CacheSlot, image: TableImage) -> bool {
        let weight = image.size().estimated_bytes();
        if weight > self.max_bytes {
            log::warn!(
                "⚠️ 图片超过缓存内存预算，跳过缓存 - {} ({} bytes)",
                image.size(),
                weight
            );
            return false;
        }

        if let Some(previous) = self.entries.pop(&slot) {
            self.release(&previous);
        }

        if let Some((_, evicted)) = self.entries.push(slot, image) {
            self.release(&evicted);
        }
        self.current_bytes = self.current_bytes.saturating_add(weight);

        while self.current_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((evicted_slot, evicted)) => {
                    log::debug!("♻️ 淘汰缓存 - {}", evicted_slot);
                    self.release(&evicted);
                }
                None => break,
            }
        }

        true
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.current_bytes = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    fn release(&mut self, image: &TableImage) {
        self.current_bytes = self
            .current_bytes
            .saturating_sub(image.size().estimated_bytes());
    }
}
