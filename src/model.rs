//! # 数据模型
//!
//! ## 设计思路
//!
//! 将“解码结果”和“缓存条目”解耦：
//! - `Image` 表示一帧解码后的图片（完整或渐进的中间帧）
//! - `CacheValidator` 表示来源给出的新鲜度标识（ETag / Last-Modified / 文件指纹）
//! - `CachedImage` 表示缓存中保存的图片，可作为刷新检查的提示

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat};

/// 解码后的图片。
///
/// 像素数据放在 `Arc` 中，渐进回调与最终回调之间复制开销很小。
#[derive(Clone)]
pub struct Image {
    pixels: Arc<DynamicImage>,
    format: Option<ImageFormat>,
    partial: bool,
}

impl Image {
    pub fn new(pixels: DynamicImage, format: Option<ImageFormat>) -> Self {
        Self {
            pixels: Arc::new(pixels),
            format,
            partial: false,
        }
    }

    /// 标记为渐进解码得到的中间帧。
    pub fn into_partial(mut self) -> Self {
        self.partial = true;
        self
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// 两个句柄是否指向同一份像素数据。
    pub fn same_pixels(&self, other: &Image) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("format", &self.format)
            .field("partial", &self.partial)
            .finish()
    }
}

/// 来源给出的新鲜度标识。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheValidator {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CacheValidator {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// 缓存中的图片条目。
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub image: Image,
    /// 原始字节，可选；存在时加载器可逐字节比较判断内容是否变化。
    pub data: Option<Bytes>,
    pub validator: CacheValidator,
}

impl CachedImage {
    pub fn new(image: Image) -> Self {
        Self {
            image,
            data: None,
            validator: CacheValidator::default(),
        }
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_validator(mut self, validator: CacheValidator) -> Self {
        self.validator = validator;
        self
    }
}
