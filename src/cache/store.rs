//! # 缓存存储接口
//!
//! 本库只通过 `get` / `set` 使用缓存存储，从不遍历或淘汰；淘汰策略归存储自身。
//! `MemoryImageCache` 是基于 LRU 的内存实现，容量满时由 `lru` 负责淘汰。

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;

use super::CacheKey;
use crate::model::CachedImage;

/// 缓存存储。
pub trait ImageCache: Send + Sync {
    fn get(&self, key: &str) -> Option<CachedImage>;

    fn set(&self, key: &str, image: CachedImage);
}

/// 仅在键可缓存时写入。返回是否实际写入。
pub fn store_if_cacheable(cache: &dyn ImageCache, key: &CacheKey, image: CachedImage) -> bool {
    match key.as_str() {
        Some(key) => {
            cache.set(key, image);
            true
        }
        None => {
            log::debug!("🚫 缓存键不可用，跳过写入");
            false
        }
    }
}

/// 按键读取；不可缓存的键直接返回 `None`。
pub fn lookup(cache: &dyn ImageCache, key: &CacheKey) -> Option<CachedImage> {
    cache.get(key.as_str()?)
}

/// LRU 内存缓存。
pub struct MemoryImageCache {
    entries: Mutex<LruCache<String, CachedImage>>,
}

impl MemoryImageCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 锁中毒后继续使用内部数据；LRU 的单次操作不会留下半完成状态。
    fn lock_entries(&self) -> MutexGuard<'_, LruCache<String, CachedImage>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ImageCache for MemoryImageCache {
    fn get(&self, key: &str) -> Option<CachedImage> {
        self.lock_entries().get(key).cloned()
    }

    fn set(&self, key: &str, image: CachedImage) {
        self.lock_entries().put(key.to_string(), image);
    }
}
