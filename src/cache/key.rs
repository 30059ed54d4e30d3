//! # 缓存键派生
//!
//! ## 设计思路
//!
//! 缓存键决定存储身份：默认取定位符的规范字符串，安装过滤器后改由过滤器决定。
//! 过滤器返回“无键”或空串表示“不缓存”，这是正常结果而不是错误。
//!
//! ## 实现思路
//!
//! - 过滤器是 trait，闭包通过 blanket impl 直接可用。
//! - 派生器只持有 `Arc<dyn CacheKeyFilter>`，无可变共享状态，可并发调用。
//! - 上下文中的过滤器优先于派生器自身的过滤器。

use std::fmt;
use std::sync::Arc;

use crate::context::LoadContext;
use crate::locator::Locator;

/// 缓存键过滤器。
pub trait CacheKeyFilter: Send + Sync {
    /// 返回 `None` 表示该定位符不应被缓存。
    fn cache_key(&self, locator: &Locator) -> Option<String>;
}

impl<F> CacheKeyFilter for F
where
    F: Fn(&Locator) -> Option<String> + Send + Sync,
{
    fn cache_key(&self, locator: &Locator) -> Option<String> {
        self(locator)
    }
}

/// 由闭包构造共享过滤器。
///
/// # 示例
/// ```rust
/// use image_loader_core::cache::{cache_key_filter, CacheKeyDeriver};
/// use image_loader_core::Locator;
///
/// let deriver = CacheKeyDeriver::with_filter(cache_key_filter(|locator: &Locator| {
///     Some(locator.url().path().to_string())
/// }));
/// let key = deriver.derive(&Locator::parse("https://cdn.example.com/a.png?sig=1")?);
/// assert_eq!(key.as_str(), Some("/a.png"));
/// # Ok::<(), image_loader_core::LoadError>(())
/// ```
pub fn cache_key_filter<F>(filter: F) -> Arc<dyn CacheKeyFilter>
where
    F: Fn(&Locator) -> Option<String> + Send + Sync + 'static,
{
    Arc::new(filter)
}

/// 派生结果。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Key(String),
    /// 过滤器拒绝提供键，下游不得写缓存。
    Uncacheable,
}

impl CacheKey {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Key(key) => Some(key),
            Self::Uncacheable => None,
        }
    }

    pub fn is_cacheable(&self) -> bool {
        matches!(self, Self::Key(_))
    }

    fn from_filter_output(output: Option<String>) -> Self {
        match output {
            Some(key) if !key.is_empty() => Self::Key(key),
            _ => Self::Uncacheable,
        }
    }
}

/// 缓存键派生器。
#[derive(Clone, Default)]
pub struct CacheKeyDeriver {
    filter: Option<Arc<dyn CacheKeyFilter>>,
}

impl CacheKeyDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(filter: Arc<dyn CacheKeyFilter>) -> Self {
        Self {
            filter: Some(filter),
        }
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    pub fn derive(&self, locator: &Locator) -> CacheKey {
        match &self.filter {
            Some(filter) => CacheKey::from_filter_output(filter.cache_key(locator)),
            None => CacheKey::Key(locator.as_str().to_string()),
        }
    }

    /// 同 `derive`，但上下文中携带的过滤器优先。
    pub fn derive_with_context(&self, locator: &Locator, context: &LoadContext) -> CacheKey {
        match context.cache_key_filter() {
            Some(filter) => CacheKey::from_filter_output(filter.cache_key(locator)),
            None => self.derive(locator),
        }
    }
}

impl fmt::Debug for CacheKeyDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKeyDeriver")
            .field("has_filter", &self.has_filter())
            .finish()
    }
}
