//! # data URL 加载器
//!
//! 处理 `data:<media>;base64,<payload>` 形式的内联图片。
//! 载荷可能带 URL 转义（`%2B` / `%2F` / `%3D`），先还原再做 base64 解码。
//! 解码前先按 base64 长度估算解码后体积，超过上限直接拒绝，避免为超大输入分配内存。

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose};

use super::{ImageLoader, LoadEnvironment};
use crate::config::LoaderConfig;
use crate::context::{LoadContext, LoadOptions};
use crate::error::LoadError;
use crate::locator::Locator;
use crate::model::CacheValidator;
use crate::operation::{CompletionHandler, LoadOperation, OperationDriver, ProgressHandler, TransferOutcome};

/// 内联 base64 图片加载器。
pub struct DataUrlLoader {
    env: LoadEnvironment,
}

impl DataUrlLoader {
    pub fn new(env: LoadEnvironment) -> Self {
        Self { env }
    }

    async fn transfer(driver: &mut OperationDriver, config: &LoaderConfig) -> Result<TransferOutcome, LoadError> {
        log::info!("📝 开始处理 data URL 图片 - {}", driver.locator().redacted());

        let bytes = parse_data_url(driver.locator(), config.max_file_size)?;
        driver.begin(Some(bytes.len() as u64))?;
        driver.receive(&bytes).await?;

        Ok(TransferOutcome::Completed {
            validator: CacheValidator::default(),
        })
    }
}

impl ImageLoader for DataUrlLoader {
    fn can_load(&self, locator: &Locator) -> bool {
        locator.scheme() == "data"
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
        "DataUrlLoader"
    }
}

fn parse_data_url(locator: &Locator, max_file_size: u64) -> Result<Vec<u8>, LoadError> {
    let body = locator
        .as_str()
        .strip_prefix("data:")
        .ok_or_else(|| LoadError::InvalidLocator("不是 data URL".to_string()))?;

    let (meta, payload) = body
        .split_once(',')
        .ok_or_else(|| LoadError::InvalidLocator("data URL 缺少数据分隔符".to_string()))?;

    if !meta.to_ascii_lowercase().ends_with(";base64") {
        return Err(LoadError::InvalidLocator("仅支持 base64 编码的 data URL".to_string()));
    }

    let payload: String = percent_decode(payload)?
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let estimated_len = estimate_decoded_upper_bound(&payload)?;
    if estimated_len > max_file_size {
        return Err(LoadError::TransferFailed(format!(
            "Base64 预计解码体积过大：{:.2} MB（限制：{:.2} MB）",
            estimated_len as f64 / 1024.0 / 1024.0,
            max_file_size as f64 / 1024.0 / 1024.0
        )));
    }

    general_purpose::STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| LoadError::DecodeFailed(format!("Base64 解码失败：{}", e)))
}

/// 还原 `%XX` 转义。base64 载荷只含 ASCII，非 ASCII 结果交给后续解码报错。
fn percent_decode(payload: &str) -> Result<String, LoadError> {
    if !payload.contains('%') {
        return Ok(payload.to_string());
    }

    let bytes = payload.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escaped = bytes
                .get(i + 1..i + 3)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| LoadError::InvalidLocator("data URL 含无效的百分号转义".to_string()))?;
            out.push(escaped);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map_err(|_| LoadError::DecodeFailed("data URL 载荷不是有效文本".to_string()))
}

fn estimate_decoded_upper_bound(payload: &str) -> Result<u64, LoadError> {
    let groups = (payload.len() as u64)
        .checked_add(3)
        .ok_or_else(|| LoadError::TransferFailed("Base64 输入长度溢出".to_string()))?
        / 4;

    groups
        .checked_mul(3)
        .ok_or_else(|| LoadError::TransferFailed("Base64 解码体积估算溢出".to_string()))
}
