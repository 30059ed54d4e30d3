//! # 渐进解码会话
//!
//! ## 设计思路
//!
//! 每个加载操作最多拥有一个会话，会话在创建时绑定操作 ID，之后不再改变，
//! 因此同一编解码器被多个并发操作使用时，部分解码状态不会互相污染。
//!
//! ## 实现思路
//!
//! - 中途喂入的前缀解码失败视为“还没有图”，不报错。
//! - 以编解码器给出的 `quality` 衡量帧质量，只保留最好的一帧；新结果不更好时重复返回旧帧。
//! - `generation` 仅在存入严格更好的帧时递增，驱动器据此决定是否投递中间帧。
//! - `is_finished = true` 时走完整解码，失败才上报 `DecodeFailed`。

use std::sync::Arc;

use super::ImageCodec;
use crate::context::{LoadContext, LoadOptions};
use crate::error::LoadError;
use crate::locator::Locator;
use crate::model::Image;
use crate::operation::OperationId;

struct BestFrame {
    image: Image,
    quality: u64,
}

/// 单个操作专属的渐进解码会话。
pub struct ProgressiveDecodeSession {
    operation: OperationId,
    codec: Arc<dyn ImageCodec>,
    locator: Locator,
    options: LoadOptions,
    context: LoadContext,
    best: Option<BestFrame>,
    fed_len: usize,
    generation: u64,
    finished: bool,
}

impl ProgressiveDecodeSession {
    pub fn new(
        operation: OperationId,
        codec: Arc<dyn ImageCodec>,
        locator: Locator,
        options: LoadOptions,
        context: LoadContext,
    ) -> Self {
        Self {
            operation,
            codec,
            locator,
            options,
            context,
            best: None,
            fed_len: 0,
            generation: 0,
            finished: false,
        }
    }

    /// 会话绑定的操作。
    pub fn operation(&self) -> OperationId {
        self.operation
    }

    /// 已存入的最好帧的代数；没有帧时为 0。
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 当前最好的一帧。
    pub fn last_frame(&self) -> Option<Image> {
        self.best.as_ref().map(|best| best.image.clone())
    }

    /// 喂入截至目前累计的全部字节。
    ///
    /// # 示例
    /// ```rust
    /// use std::sync::Arc;
    /// use image_loader_core::context::{LoadContext, LoadOptions};
    /// use image_loader_core::decode::{ProgressiveDecodeSession, StandardCodec};
    /// use image_loader_core::operation::OperationId;
    /// use image_loader_core::Locator;
    ///
    /// let mut session = ProgressiveDecodeSession::new(
    ///     OperationId::next(),
    ///     Arc::new(StandardCodec::default()),
    ///     Locator::parse("https://example.com/a.png")?,
    ///     LoadOptions::progressive(),
    ///     LoadContext::new(),
    /// );
    /// // 不完整的前缀不会报错。
    /// assert!(session.feed(&[0x89, b'P', b'N', b'G'], false)?.is_none());
    /// # Ok::<(), image_loader_core::LoadError>(())
    /// ```
    pub fn feed(&mut self, accumulated: &[u8], is_finished: bool) -> Result<Option<Image>, LoadError> {
        if self.finished {
            return Ok(self.last_frame());
        }

        if is_finished {
            return self.finish(accumulated).map(Some);
        }

        if accumulated.len() <= self.fed_len {
            return Ok(self.last_frame());
        }
        self.fed_len = accumulated.len();

        if let Some(partial) = self.codec.decode_partial(accumulated) {
            let improved = self
                .best
                .as_ref()
                .is_none_or(|best| partial.quality > best.quality);

            if improved {
                self.best = Some(BestFrame {
                    image: partial.image.into_partial(),
                    quality: partial.quality,
                });
                self.generation += 1;
            } else {
                log::trace!(
                    "渐进帧未改善，沿用上一帧 - op={} quality={}",
                    self.operation,
                    partial.quality
                );
            }
        }

        Ok(self.last_frame())
    }

    fn finish(&mut self, bytes: &[u8]) -> Result<Image, LoadError> {
        self.finished = true;
        self.fed_len = bytes.len();

        let image = self
            .codec
            .decode(bytes, &self.locator, &self.options, &self.context)
            .map_err(|err| match err {
                LoadError::DecodeFailed(_) => err,
                other => LoadError::DecodeFailed(other.to_string()),
            })?;

        self.best = Some(BestFrame {
            image: image.clone(),
            quality: u64::MAX,
        });
        self.generation += 1;

        Ok(image)
    }
}
