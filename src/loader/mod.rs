//! # 加载器
//!
//! ## 设计思路
//!
//! 加载器只负责“从某类来源取字节”，通过 `ImageLoader` 能力接口接入：
//! `can_load` 判断能否处理，`load` 立即返回可取消句柄，所有回调都在后台投递。
//! 字节之后的流程（进度、渐进解码、最终解码）统一交给 `OperationDriver`。
//!
//! ## 调用链
//!
//! ```text
//! 调用方
//!    ↓ load(locator, options, context, progress, completed)
//! LoaderRegistry（按优先级选第一个 can_load 的加载器）
//!    ├─ HttpLoader     http / https
//!    ├─ FileLoader     file
//!    ├─ DataUrlLoader  data
//!    └─ 自定义加载器
//!    ↓ LoadEnvironment::spawn
//! 后台任务：传输 ─▶ OperationDriver ─▶ 进度 / 中间帧 / 终态回调
//! ```

mod data;
mod file;
mod http;
mod registry;

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;

pub use data::DataUrlLoader;
pub use file::FileLoader;
pub use http::HttpLoader;
pub use registry::LoaderRegistry;

use crate::config::LoaderConfig;
use crate::context::{LoadContext, LoadOptions};
use crate::decode::{ImageCodec, StandardCodec};
use crate::error::LoadError;
use crate::locator::Locator;
use crate::operation::{CompletionHandler, LoadOperation, OperationDriver, ProgressHandler};

/// 加载器能力接口。
pub trait ImageLoader: Send + Sync {
    /// 是否能处理该定位符。每个新请求都会询问。
    fn can_load(&self, locator: &Locator) -> bool;

    /// 开始加载并立即返回句柄；不得阻塞调用方。
    ///
    /// 失败只通过 `completed` 回调报告。
    fn load(
        &self,
        locator: Locator,
        options: LoadOptions,
        context: LoadContext,
        progress: Option<ProgressHandler>,
        completed: CompletionHandler,
    ) -> LoadOperation;

    /// 诊断用名称。
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// 加载器共享的运行环境：运行时句柄、编解码器、配置快照。
#[derive(Clone)]
pub struct LoadEnvironment {
    runtime: Handle,
    codec: Arc<dyn ImageCodec>,
    config: Arc<LoaderConfig>,
}

impl LoadEnvironment {
    /// 校验配置，并使用基于配置上限的 `StandardCodec`。
    pub fn new(runtime: Handle, config: LoaderConfig) -> Result<Self, LoadError> {
        config.validate()?;
        let codec = Arc::new(StandardCodec::new(config.decode_limits()));
        Ok(Self {
            runtime,
            codec,
            config: Arc::new(config),
        })
    }

    /// 使用当前所在的 tokio 运行时。
    pub fn current(config: LoaderConfig) -> Result<Self, LoadError> {
        let runtime = Handle::try_current()
            .map_err(|e| LoadError::InvalidConfig(format!("当前线程不在 tokio 运行时中：{}", e)))?;
        Self::new(runtime, config)
    }

    /// 替换编解码器。
    pub fn with_codec(mut self, codec: Arc<dyn ImageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn codec(&self) -> &Arc<dyn ImageCodec> {
        &self.codec
    }

    pub fn config(&self) -> &Arc<LoaderConfig> {
        &self.config
    }

    /// 创建操作与驱动器，并把 `task(driver)` 派发到运行时。
    ///
    /// `task` 负责传输并最终调用 `driver.finish(...)`。
    pub fn spawn<F, Fut>(
        &self,
        locator: Locator,
        options: LoadOptions,
        context: LoadContext,
        progress: Option<ProgressHandler>,
        completed: CompletionHandler,
        task: F,
    ) -> LoadOperation
    where
        F: FnOnce(OperationDriver) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (operation, driver) = OperationDriver::new(
            locator,
            Arc::clone(&self.codec),
            &self.config,
            options,
            context,
            progress,
            completed,
        );

        log::debug!("🚀 派发加载任务 {} - {}", operation.id(), operation.locator().redacted());
        self.runtime.spawn(task(driver));
        operation
    }
}
