//! # 缓存键与缓存存储
//!
//! - `key`：定位符 → 缓存键（可被过滤器覆盖，可能“不缓存”）
//! - `store`：外部缓存存储的 get/set 接口与 LRU 内存实现

mod key;
mod store;

pub use key::{CacheKey, CacheKeyDeriver, CacheKeyFilter, cache_key_filter};
pub use store::{ImageCache, MemoryImageCache, lookup, store_if_cacheable};
