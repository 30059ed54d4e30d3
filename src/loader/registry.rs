//! # 加载器注册表
//!
//! ## 设计思路
//!
//! 注册表持有按优先级排列的加载器列表，为每个请求选出第一个 `can_load`
//! 为真的加载器。注册表本身也实现 `ImageLoader`，可以嵌套。
//!
//! ## 实现思路
//!
//! - 列表读多写少：`RwLock<Arc<Vec<_>>>`，查找时只在读锁内克隆 `Arc` 快照，
//!   之后的 `can_load` 调用不持锁；注册/移除时整体替换快照。
//! - 没有任何加载器匹配时，同步地以 `NoCapableLoader` 调用一次完成回调，
//!   并返回一个已处于终态的句柄。

use std::sync::{Arc, PoisonError, RwLock};

use super::{DataUrlLoader, FileLoader, HttpLoader, ImageLoader, LoadEnvironment};
use crate::context::{LoadContext, LoadOptions};
use crate::error::LoadError;
use crate::locator::Locator;
use crate::operation::{CompletionHandler, LoadCompletion, LoadOperation, ProgressHandler};

type LoaderList = Arc<Vec<Arc<dyn ImageLoader>>>;

/// 加载器注册表。
#[derive(Default)]
pub struct LoaderRegistry {
    loaders: RwLock<LoaderList>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册内置加载器：HTTP(S)、本地文件、data URL。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use image_loader_core::loader::{LoadEnvironment, LoaderRegistry};
    /// use image_loader_core::LoaderConfig;
    ///
    /// # async fn demo() -> Result<(), image_loader_core::LoadError> {
    /// let env = LoadEnvironment::current(LoaderConfig::default())?;
    /// let registry = LoaderRegistry::with_default_loaders(&env)?;
    /// assert_eq!(registry.len(), 3);
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_default_loaders(env: &LoadEnvironment) -> Result<Self, LoadError> {
        let registry = Self::new();
        registry.register(Arc::new(HttpLoader::new(env.clone())?));
        registry.register(Arc::new(FileLoader::new(env.clone())));
        registry.register(Arc::new(DataUrlLoader::new(env.clone())));
        Ok(registry)
    }

    /// 追加到末尾（最低优先级）。
    pub fn register(&self, loader: Arc<dyn ImageLoader>) {
        log::debug!("➕ 注册加载器：{}", loader.name());
        self.update(|list| list.push(loader));
    }

    /// 插入到最前（最高优先级）。
    pub fn register_with_priority(&self, loader: Arc<dyn ImageLoader>) {
        log::debug!("➕ 注册优先加载器：{}", loader.name());
        self.update(|list| list.insert(0, loader));
    }

    /// 按实例身份移除，返回是否找到。
    pub fn unregister(&self, loader: &Arc<dyn ImageLoader>) -> bool {
        let target = Arc::as_ptr(loader) as *const ();
        let mut removed = false;
        self.update(|list| {
            let before = list.len();
            list.retain(|existing| Arc::as_ptr(existing) as *const () != target);
            removed = list.len() != before;
        });
        removed
    }

    /// 当前列表快照。
    pub fn loaders(&self) -> LoaderList {
        let guard = self.loaders.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn len(&self) -> usize {
        self.loaders().len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders().is_empty()
    }

    /// 选出第一个能处理该定位符的加载器。
    pub fn select(&self, locator: &Locator) -> Option<Arc<dyn ImageLoader>> {
        self.loaders()
            .iter()
            .find(|loader| loader.can_load(locator))
            .cloned()
    }

    fn update(&self, mutate: impl FnOnce(&mut Vec<Arc<dyn ImageLoader>>)) {
        let mut guard = self.loaders.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::clone(&guard);
        mutate(&mut next);
        *guard = Arc::new(next);
    }
}

impl ImageLoader for LoaderRegistry {
    fn can_load(&self, locator: &Locator) -> bool {
        self.select(locator).is_some()
    }

    fn load(
        &self,
        locator: Locator,
        options: LoadOptions,
        context: LoadContext,
        progress: Option<ProgressHandler>,
        mut completed: CompletionHandler,
    ) -> LoadOperation {
        if let Some(loader) = self.select(&locator) {
            log::debug!("🔀 {} 由 {} 处理", locator.redacted(), loader.name());
            return loader.load(locator, options, context, progress, completed);
        }

        log::warn!("⚠️ 没有可用的加载器 - {}", locator.redacted());
        let operation = LoadOperation::already_completed(locator.clone());
        completed(LoadCompletion::failure(
            LoadError::NoCapableLoader(locator.redacted()),
            None,
        ));
        operation
    }

    fn name(&self) -> &str {
        "LoaderRegistry"
    }
}
