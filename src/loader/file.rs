//! # 本地文件加载器
//!
//! 按块异步读取 `file://` 定位符指向的文件，预期大小取自 metadata。
//! 校验信息由文件大小与修改时间构成；与刷新提示一致时直接报告未变化，不再读取内容。

use std::fs::Metadata;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tokio::io::AsyncReadExt;

use super::{ImageLoader, LoadEnvironment};
use crate::config::LoaderConfig;
use crate::context::{LoadContext, LoadOptions};
use crate::error::LoadError;
use crate::locator::Locator;
use crate::model::CacheValidator;
use crate::operation::{CompletionHandler, LoadOperation, OperationDriver, ProgressHandler, TransferOutcome};

/// 本地文件加载器。
pub struct FileLoader {
    env: LoadEnvironment,
}

impl FileLoader {
    pub fn new(env: LoadEnvironment) -> Self {
        Self { env }
    }

    async fn transfer(driver: &mut OperationDriver, config: &LoaderConfig) -> Result<TransferOutcome, LoadError> {
        let path = file_path(driver.locator())?;
        log::info!("📁 开始读取本地图片 - 路径: {}", path.display());

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| LoadError::TransferFailed(format!("无法读取文件信息：{}", e)))?;
        if !metadata.is_file() {
            return Err(LoadError::TransferFailed(format!("不是普通文件：{}", path.display())));
        }

        let validator = file_validator(&metadata);
        let unchanged = driver
            .refresh_hint()
            .is_some_and(|hint| !validator.is_empty() && hint.validator == validator);
        if unchanged {
            return Ok(TransferOutcome::NotModified);
        }

        driver.begin(Some(metadata.len()))?;

        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| LoadError::TransferFailed(format!("无法打开图片文件：{}", e)))?;
        let mut chunk = vec![0u8; config.file_read_chunk_size.max(1)];

        loop {
            let read = file
                .read(&mut chunk)
                .await
                .map_err(|e| LoadError::TransferFailed(format!("无法读取图片文件：{}", e)))?;
            if read == 0 {
                break;
            }
            driver.receive(&chunk[..read]).await?;
        }

        Ok(TransferOutcome::Completed { validator })
    }
}

impl ImageLoader for FileLoader {
    fn can_load(&self, locator: &Locator) -> bool {
        locator.scheme() == "file"
    }

    fn load(
        &self,
        locator: Locator,
        options: LoadOptions,
        context: LoadContext,
        progress: Option<ProgressHandler>,
        completed: CompletionHandler,
    ) -> LoadOperation {
        let config = Arc::clone(self.env.config());

        self.env
            .spawn(locator, options, context, progress, completed, move |mut driver| async move {
                let operation = driver.operation().clone();
                let outcome = tokio::select! {
                    outcome = Self::transfer(&mut driver, &config) => outcome,
                    _ = operation.cancelled() => Err(LoadError::Cancelled),
                };
                driver.finish(outcome).await;
            })
    }

    fn name(&self) -> &str {
        "FileLoader"
    }
}

fn file_path(locator: &Locator) -> Result<PathBuf, LoadError> {
    locator
        .url()
        .to_file_path()
        .map_err(|_| LoadError::InvalidLocator(format!("无法转换为本地路径：{}", locator.redacted())))
}

/// 大小 + 修改时间指纹；拿不到修改时间时只有大小，不足以判断未变化。
fn file_validator(metadata: &Metadata) -> CacheValidator {
    let modified = metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok());

    match modified {
        Some(since_epoch) => CacheValidator {
            etag: Some(format!("\"{:x}-{:x}\"", metadata.len(), since_epoch.as_nanos())),
            last_modified: Some(since_epoch.as_secs().to_string()),
        },
        None => CacheValidator::default(),
    }
}
