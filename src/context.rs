//! # 请求上下文与选项
//!
//! ## 设计思路
//!
//! `LoadOptions` 承载调用方显式给出的开关；`LoadContext` 承载横切数据
//! （如刷新检查用的缓存图片、单次请求的缓存键过滤器）。两者都从调用方原样
//! 透传到加载器与解码器。
//!
//! ## 实现思路
//!
//! - 上下文键是进程级字符串常量，新增键不影响已有使用方。
//! - 值为带标签的枚举；无法归类的数据用 `Any` 承载。
//! - 上下文创建后不可变，`with` 复制出新上下文（写时复制），原上下文不受影响。

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::cache::CacheKeyFilter;
use crate::model::CachedImage;

/// 上下文键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKey(&'static str);

impl ContextKey {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

/// 刷新检查提示：调用方已缓存的图片。
///
/// 加载器据此判断远端内容是否变化，未变化时以 `CacheNotModified` 完成。
pub const LOADER_CACHED_IMAGE: ContextKey = ContextKey::new("loaderCachedImage");

/// 单次请求的缓存键过滤器，优先于派生器自身的过滤器。
pub const CACHE_KEY_FILTER: ContextKey = ContextKey::new("cacheKeyFilter");

/// 上下文值。
#[derive(Clone)]
pub enum ContextValue {
    CachedImage(CachedImage),
    CacheKeyFilter(Arc<dyn CacheKeyFilter>),
    Text(String),
    Flag(bool),
    Any(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CachedImage(image) => f.debug_tuple("CachedImage").field(image).finish(),
            Self::CacheKeyFilter(_) => f.write_str("CacheKeyFilter(..)"),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Flag(flag) => f.debug_tuple("Flag").field(flag).finish(),
            Self::Any(_) => f.write_str("Any(..)"),
        }
    }
}

/// 单次请求的上下文。克隆只复制引用。
#[derive(Clone, Default)]
pub struct LoadContext {
    entries: Arc<HashMap<ContextKey, ContextValue>>,
}

impl LoadContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 派生一个追加（或覆盖）了 `key` 的新上下文。
    ///
    /// # 示例
    /// ```rust
    /// use image_loader_core::context::{ContextKey, ContextValue, LoadContext};
    ///
    /// const TAG: ContextKey = ContextKey::new("tag");
    /// let base = LoadContext::new();
    /// let derived = base.with(TAG, ContextValue::Text("avatar".into()));
    /// assert!(base.get(TAG).is_none());
    /// assert!(derived.get(TAG).is_some());
    /// ```
    pub fn with(&self, key: ContextKey, value: ContextValue) -> Self {
        let mut entries = HashMap::clone(&self.entries);
        entries.insert(key, value);
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn get(&self, key: ContextKey) -> Option<&ContextValue> {
        self.entries.get(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cached_image(&self) -> Option<&CachedImage> {
        match self.get(LOADER_CACHED_IMAGE)? {
            ContextValue::CachedImage(image) => Some(image),
            _ => None,
        }
    }

    pub fn cache_key_filter(&self) -> Option<&Arc<dyn CacheKeyFilter>> {
        match self.get(CACHE_KEY_FILTER)? {
            ContextValue::CacheKeyFilter(filter) => Some(filter),
            _ => None,
        }
    }

    pub fn text(&self, key: ContextKey) -> Option<&str> {
        match self.get(key)? {
            ContextValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn flag(&self, key: ContextKey) -> Option<bool> {
        match self.get(key)? {
            ContextValue::Flag(flag) => Some(*flag),
            _ => None,
        }
    }

    /// 取出 `Any` 载荷并向下转型。
    pub fn payload<T: Any + Send + Sync>(&self, key: ContextKey) -> Option<&T> {
        match self.get(key)? {
            ContextValue::Any(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k.name(), v)))
            .finish()
    }
}

/// 加载选项。
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// 启用渐进解码：下载过程中以 `is_final = false` 投递中间帧。
    pub progressive_decode: bool,
    /// 刷新检查提示，优先于上下文中的 `LOADER_CACHED_IMAGE`。
    pub refresh_cached_hint: Option<CachedImage>,
}

impl LoadOptions {
    pub fn progressive() -> Self {
        Self {
            progressive_decode: true,
            ..Self::default()
        }
    }

    pub fn with_refresh_hint(mut self, cached: CachedImage) -> Self {
        self.refresh_cached_hint = Some(cached);
        self
    }
}

/// 解析本次请求实际生效的刷新提示。
pub fn refresh_hint<'a>(options: &'a LoadOptions, context: &'a LoadContext) -> Option<&'a CachedImage> {
    options
        .refresh_cached_hint
        .as_ref()
        .or_else(|| context.cached_image())
}
