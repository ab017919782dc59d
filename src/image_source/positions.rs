//! # 位置标记表
//!
//! 记录“每个列表位置当前期望哪张图片”。每次登记都会分配一个递增的票据，
//! 完成回调必须同时匹配 `CacheKey` 与票据才算有效。
//! 因此 `invalidate` 之后同一位置重新登记同一图片，旧请求也不会被误认为有效。

use std::collections::HashMap;
use std::hash::Hash;

use super::CacheKey;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PositionTag {
    key: CacheKey,
    ticket: u64,
}

pub(crate) struct PositionTags<P> {
    tags: HashMap<P, PositionTag>,
    next_ticket: u64,
}

impl<P> PositionTags<P>
where
    P: Eq + Hash,
{
    pub(crate) fn new() -> Self {
        Self {
            tags: HashMap::new(),
            next_ticket: 1,
        }
    }

    /// 登记位置，覆盖该位置之前的标记，返回新票据。
    pub(crate) fn register(&mut self, position: P, key: CacheKey) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.tags.insert(position, PositionTag { key, ticket });
        ticket
    }

    pub(crate) fn is_current(&self, position: &P, key: &CacheKey, ticket: u64) -> bool {
        self.tags
            .get(position)
            .is_some_and(|tag| tag.ticket == ticket && &tag.key == key)
    }

    /// 标记仍有效时移除并返回 `true`，用于交付前的最终确认。
    pub(crate) fn take_if_current(&mut self, position: &P, key: &CacheKey, ticket: u64) -> bool {
        if !self.is_current(position, key, ticket) {
            return false;
        }
        self.tags.remove(position);
        true
    }

    /// 清空全部标记，返回被清除的数量。
    pub(crate) fn invalidate(&mut self) -> usize {
        let cleared = self.tags.len();
        self.tags.clear();
        cleared
    }

    pub(crate) fn len(&self) -> usize {
        self.tags.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_source::{ImageSize, IndexPath};

    fn key(url: &str) -> CacheKey {
        CacheKey::new(url, ImageSize::new(100, 100))
    }

    #[test]
    fn later_registration_overwrites_earlier_one() {
        let mut tags = PositionTags::new();
        let row = IndexPath::new(0, 3);
        let first = tags.register(row, key("a"));
        let second = tags.register(row, key("b"));

        assert!(!tags.is_current(&row, &key("a"), first));
        assert!(tags.is_current(&row, &key("b"), second));
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn stale_ticket_for_same_key_is_not_current() {
        let mut tags = PositionTags::new();
        let row = IndexPath::new(1, 0);
        let stale = tags.register(row, key("a"));
        tags.invalidate();
        let fresh = tags.register(row, key("a"));

        assert!(!tags.take_if_current(&row, &key("a"), stale));
        assert!(tags.take_if_current(&row, &key("a"), fresh));
        assert_eq!(tags.len(), 0);
    }

    #[test]
    fn invalidate_clears_everything() {
        let mut tags = PositionTags::new();
        let ticket = tags.register(IndexPath::new(0, 0), key("a"));
        tags.register(IndexPath::new(0, 1), key("b"));

        assert_eq!(tags.invalidate(), 2);
        assert!(!tags.is_current(&IndexPath::new(0, 0), &key("a"), ticket));
    }
}
