//! # 操作驱动器
//!
//! ## 设计思路
//!
//! 加载器只需关心“字节从哪里来”；字节到达之后的流程由 `OperationDriver` 统一处理：
//! 1. 体积上限与签名嗅探（尽早拒绝非图片内容）
//! 2. 进度事件（节流、严格递增）
//! 3. 渐进解码与中间帧投递
//! 4. 刷新提示比对、最终完整解码、唯一一次终态投递
//!
//! 自定义加载器同样使用它，从而与内置加载器行为一致。
//!
//! ## 实现思路
//!
//! - 驱动器由单个后台任务独占，渐进会话随之独占，事件天然有序。
//! - 解码是 CPU 密集操作，放到 `spawn_blocking`，不占用异步工作线程。
//! - 渐进解码每次都要重解整个前缀，所以按字节增量与时间间隔限流：步长不小于已尝试长度的 1/4，
//!   总解码量与文件大小成线性关系。缓冲区冻结后与解码任务共享，解码结束再收回，不复制。
//! - `finish` 消费驱动器；若驱动器未调用 `finish` 就被丢弃（任务被中止、panic），
//!   `Drop` 会补发一次 `TransferFailed`，保证未取消的操作总有终态回调。

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use super::handle::{CompletionHandler, LoadCompletion, LoadOperation, LoadProgress, ProgressHandler};
use super::throttle::ProgressThrottle;
use crate::config::LoaderConfig;
use crate::context::{LoadContext, LoadOptions, refresh_hint};
use crate::decode::{ImageCodec, ProgressiveDecodeSession, Sniff};
use crate::error::LoadError;
use crate::locator::Locator;
use crate::model::{CacheValidator, CachedImage, Image};

const BUFFER_INITIAL_CAPACITY: usize = 16 * 1024;
const PROGRESSIVE_GROWTH_DIVISOR: usize = 4;

/// 传输阶段的结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// 字节已全部到达。
    Completed { validator: CacheValidator },
    /// 来源确认内容未变化（如 HTTP 304）。
    NotModified,
}

/// 单个加载操作的流水线驱动器。
pub struct OperationDriver {
    operation: LoadOperation,
    codec: Arc<dyn ImageCodec>,
    options: LoadOptions,
    context: LoadContext,
    progress: Option<ProgressHandler>,
    completed: Option<CompletionHandler>,
    buffer: BytesMut,
    expected: Option<u64>,
    session: Option<ProgressiveDecodeSession>,
    gate: ProgressiveGate,
    throttle: ProgressThrottle,
    last_reported: Option<u64>,
    max_bytes: u64,
    probe_limit: usize,
    signature_confirmed: bool,
    started_at: Instant,
}

impl OperationDriver {
    /// 创建操作及其驱动器。句柄交给调用方，驱动器交给后台任务。
    pub fn new(
        locator: Locator,
        codec: Arc<dyn ImageCodec>,
        config: &LoaderConfig,
        options: LoadOptions,
        context: LoadContext,
        progress: Option<ProgressHandler>,
        completed: CompletionHandler,
    ) -> (LoadOperation, Self) {
        let operation = LoadOperation::new(locator.clone());

        let session = options.progressive_decode.then(|| {
            ProgressiveDecodeSession::new(
                operation.id(),
                Arc::clone(&codec),
                locator,
                options.clone(),
                context.clone(),
            )
        });

        let driver = Self {
            operation: operation.clone(),
            codec,
            options,
            context,
            progress,
            completed: Some(completed),
            buffer: BytesMut::new(),
            expected: None,
            session,
            gate: ProgressiveGate::new(
                config.progressive_min_bytes_delta,
                Duration::from_millis(config.progressive_min_interval_ms),
            ),
            throttle: ProgressThrottle::new(config.throttle_settings()),
            last_reported: None,
            max_bytes: config.max_file_size,
            probe_limit: config.signature_probe_bytes,
            signature_confirmed: false,
            started_at: Instant::now(),
        };

        (operation, driver)
    }

    pub fn operation(&self) -> &LoadOperation {
        &self.operation
    }

    pub fn locator(&self) -> &Locator {
        self.operation.locator()
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    pub fn context(&self) -> &LoadContext {
        &self.context
    }

    /// 本次请求生效的刷新提示。
    pub fn refresh_hint(&self) -> Option<&CachedImage> {
        refresh_hint(&self.options, &self.context)
    }

    pub fn is_cancelled(&self) -> bool {
        self.operation.is_cancelled()
    }

    pub fn received(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// 传输开始，告知预期总大小（未知为 `None`）。
    pub fn begin(&mut self, expected: Option<u64>) -> Result<(), LoadError> {
        if self.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        if let Some(size) = expected {
            if size > self.max_bytes {
                return Err(LoadError::TransferFailed(format!(
                    "文件过大：{:.2} MB（限制：{:.2} MB）",
                    size as f64 / 1024.0 / 1024.0,
                    self.max_bytes as f64 / 1024.0 / 1024.0
                )));
            }
        }

        self.expected = expected;
        let capacity = expected
            .map(|len| len.min(self.max_bytes).min(usize::MAX as u64) as usize)
            .filter(|len| *len > 0)
            .unwrap_or(BUFFER_INITIAL_CAPACITY);
        self.buffer.reserve(capacity);

        self.operation.mark_downloading();
        self.emit_progress(true);
        Ok(())
    }

    /// 接收一个数据块。返回 `Err` 时加载器应停止传输并把错误交给 `finish`。
    pub async fn receive(&mut self, chunk: &[u8]) -> Result<(), LoadError> {
        if self.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        if chunk.is_empty() {
            return Ok(());
        }

        let total = (self.buffer.len() as u64).saturating_add(chunk.len() as u64);
        if total > self.max_bytes {
            return Err(LoadError::TransferFailed("下载后文件超过大小限制".to_string()));
        }

        self.buffer.extend_from_slice(chunk);
        self.operation.mark_downloading();

        if !self.signature_confirmed {
            self.probe_signature()?;
        }

        self.emit_progress(false);

        if self.session.is_some() && self.gate.should_attempt(self.buffer.len()) {
            self.decode_progressive().await;
        }

        Ok(())
    }

    /// 结束操作并投递终态事件。
    pub async fn finish(mut self, outcome: Result<TransferOutcome, LoadError>) {
        if self.is_cancelled() || matches!(outcome, Err(LoadError::Cancelled)) {
            log::debug!(
                "⏹️ 操作已取消，抑制投递 - {} {}",
                self.operation.id(),
                self.locator().redacted()
            );
            self.completed = None;
            return;
        }

        self.emit_progress(true);

        let completion = match outcome {
            Ok(TransferOutcome::Completed { validator }) => self.complete_with_data(validator).await,
            Ok(TransferOutcome::NotModified) => {
                log::info!("♻️ 内容未变化，沿用缓存 - {}", self.locator().redacted());
                LoadCompletion::failure(LoadError::CacheNotModified, None)
            }
            Err(err) => {
                log::warn!(
                    "⚠️ 加载失败 - {} [{}] {}",
                    self.locator().redacted(),
                    err.code(),
                    err
                );
                LoadCompletion::failure(err, None)
            }
        };

        self.deliver_final(completion);
    }

    async fn complete_with_data(&mut self, validator: CacheValidator) -> LoadCompletion {
        let transfer_elapsed = self.started_at.elapsed();
        let data = std::mem::take(&mut self.buffer).freeze();

        if self.matches_refresh_hint(&data) {
            log::info!("♻️ 下载内容与缓存一致 - {}", self.locator().redacted());
            return LoadCompletion::failure(LoadError::CacheNotModified, None);
        }

        if !self.signature_confirmed {
            if let Sniff::NotImage(mime) = self.codec.sniff(&data) {
                return LoadCompletion::failure(
                    LoadError::DecodeFailed(format!("内容不是图片类型：{}", mime)),
                    Some(data),
                );
            }
        }

        let decode_start = Instant::now();
        let decoded = self.decode_final(data.clone()).await;
        let decode_elapsed = decode_start.elapsed();

        match decoded {
            Ok(image) => {
                log::info!(
                    "✅ 图片加载完成 - {} {}x{} transfer={}ms decode={}ms total={}ms",
                    self.locator().redacted(),
                    image.width(),
                    image.height(),
                    transfer_elapsed.as_millis(),
                    decode_elapsed.as_millis(),
                    self.started_at.elapsed().as_millis()
                );
                LoadCompletion::success(image, data, validator)
            }
            Err(err) => {
                log::warn!("⚠️ 图片解码失败 - {} {}", self.locator().redacted(), err);
                LoadCompletion::failure(err, Some(data))
            }
        }
    }

    fn matches_refresh_hint(&self, data: &Bytes) -> bool {
        self.refresh_hint()
            .and_then(|hint| hint.data.as_ref())
            .is_some_and(|cached| cached == data)
    }

    /// 最终解码：渐进会话存在时交给会话，否则直接完整解码。
    async fn decode_final(&mut self, data: Bytes) -> Result<Image, LoadError> {
        if let Some(mut session) = self.session.take() {
            let joined = tokio::task::spawn_blocking(move || session.feed(&data, true)).await;
            return match joined {
                Ok(Ok(Some(image))) => Ok(image),
                Ok(Ok(None)) => Err(LoadError::DecodeFailed("解码未产出图片".to_string())),
                Ok(Err(err)) => Err(err),
                Err(e) => Err(LoadError::DecodeFailed(format!("解码任务异常：{}", e))),
            };
        }

        let codec = Arc::clone(&self.codec);
        let locator = self.locator().clone();
        let options = self.options.clone();
        let context = self.context.clone();

        tokio::task::spawn_blocking(move || codec.decode(&data, &locator, &options, &context))
            .await
            .map_err(|e| LoadError::DecodeFailed(format!("解码任务异常：{}", e)))?
    }

    async fn decode_progressive(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let frozen = std::mem::take(&mut self.buffer).freeze();
        let snapshot = frozen.clone();
        let before = session.generation();
        self.gate.record(frozen.len());

        let joined = tokio::task::spawn_blocking(move || {
            let result = session.feed(&snapshot, false);
            (session, result)
        })
        .await;

        // 解码任务已释放它持有的引用，收回时不复制。
        self.buffer = frozen
            .try_into_mut()
            .unwrap_or_else(|shared| BytesMut::from(&shared[..]));

        let (session, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("⚠️ 渐进解码任务异常，改为最终完整解码：{}", e);
                return;
            }
        };

        let improved = session.generation() > before;
        self.session = Some(session);

        match result {
            Ok(Some(image)) if improved => self.deliver_partial(image),
            Ok(_) => {}
            Err(err) => log::debug!("渐进解码暂不可用 - {}", err),
        }
    }

    fn probe_signature(&mut self) -> Result<(), LoadError> {
        let window = self.buffer.len().min(self.probe_limit);

        match self.codec.sniff(&self.buffer[..window]) {
            Sniff::Image => {
                self.signature_confirmed = true;
                Ok(())
            }
            Sniff::NotImage(mime) => Err(LoadError::DecodeFailed(format!(
                "下载内容不是图片类型：{}",
                mime
            ))),
            Sniff::NeedMore if self.buffer.len() >= self.probe_limit => Err(LoadError::DecodeFailed(
                format!("前 {} 字节内无法识别图片类型", self.probe_limit),
            )),
            Sniff::NeedMore => Ok(()),
        }
    }

    /// 进度事件：严格递增；`force` 跳过节流。
    fn emit_progress(&mut self, force: bool) {
        let received = self.received();
        if self.last_reported.is_some_and(|last| received <= last) {
            return;
        }
        if !force && !self.throttle.should_emit(received, self.expected) {
            return;
        }

        let Some(progress) = self.progress.as_ref() else {
            self.last_reported = Some(received);
            return;
        };

        let event = LoadProgress {
            received,
            expected: self.expected,
            locator: self.operation.locator().clone(),
        };

        if self.operation.deliver(|| progress(&event)).is_some() {
            self.throttle.update(received, self.expected);
            self.last_reported = Some(received);
        }
    }

    fn deliver_partial(&mut self, image: Image) {
        let Some(completed) = self.completed.as_mut() else {
            return;
        };

        log::debug!(
            "🖼️ 渐进帧 - {} {}x{} bytes={}",
            self.operation.id(),
            image.width(),
            image.height(),
            self.buffer.len()
        );
        self.operation.deliver(|| completed(LoadCompletion::partial(image)));
    }

    fn deliver_final(&mut self, completion: LoadCompletion) {
        let Some(mut completed) = self.completed.take() else {
            return;
        };

        if !self.operation.deliver_terminal(|| completed(completion)) {
            log::debug!("终态事件被抑制 - {}", self.operation.id());
        }
    }
}

/// 渐进解码尝试的限流状态。
struct ProgressiveGate {
    min_bytes: u64,
    min_interval: Duration,
    attempted_len: usize,
    attempted_at: Option<Instant>,
}

impl ProgressiveGate {
    fn new(min_bytes: u64, min_interval: Duration) -> Self {
        Self {
            min_bytes,
            min_interval,
            attempted_len: 0,
            attempted_at: None,
        }
    }

    fn should_attempt(&self, len: usize) -> bool {
        let grown = len.saturating_sub(self.attempted_len) as u64;
        let step = self
            .min_bytes
            .max((self.attempted_len / PROGRESSIVE_GROWTH_DIVISOR) as u64);

        grown > 0
            && grown >= step
            && self
                .attempted_at
                .is_none_or(|at| at.elapsed() >= self.min_interval)
    }

    fn record(&mut self, len: usize) {
        self.attempted_len = len;
        self.attempted_at = Some(Instant::now());
    }
}

impl Drop for OperationDriver {
    fn drop(&mut self) {
        let Some(mut completed) = self.completed.take() else {
            return;
        };
        if self.operation.is_cancelled() {
            return;
        }

        log::warn!(
            "⚠️ 加载任务未正常结束，补发失败回调 - {}",
            self.locator().redacted()
        );
        let failure = LoadCompletion::failure(
            LoadError::TransferFailed("加载任务意外终止".to_string()),
            None,
        );
        self.operation.deliver_terminal(|| completed(failure));
    }
}
