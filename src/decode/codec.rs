//! # 解码器模块
//!
//! ## 设计思路
//!
//! 编解码本身是外部协作者：本库只依赖 `ImageCodec` 这一组函数式接口
//! （完整解码、尽力而为的部分解码、签名嗅探）。默认实现 `StandardCodec`
//! 基于 `image` crate，并在完整解码前做资源上限控制。
//!
//! ## 实现思路
//!
//! 1. 猜测格式并读取 header 尺寸
//! 2. 按像素上限与预计内存上限快速拒绝
//! 3. 完整解码，解码后再次校验尺寸
//! 4. 部分解码失败一律视为“还没有图”，不上抛错误

use std::io::Cursor;

use image::{ImageFormat, ImageReader};

use crate::context::{LoadContext, LoadOptions};
use crate::error::LoadError;
use crate::locator::Locator;
use crate::model::Image;

const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// 签名嗅探结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniff {
    /// 已识别为图片。
    Image,
    /// 字节不足以判断。
    NeedMore,
    /// 已识别为非图片（携带 MIME 类型）。
    NotImage(String),
}

/// 部分解码结果。
///
/// `quality` 只在同一会话内比较大小：数值越大越完整，必须随真实解码进度增长。
#[derive(Debug, Clone)]
pub struct PartialImage {
    pub image: Image,
    pub quality: u64,
}

/// 图片编解码协作者。
pub trait ImageCodec: Send + Sync {
    /// 用完整字节解码。`bytes` 与 `locator` 必须存在。
    fn decode(
        &self,
        bytes: &[u8],
        locator: &Locator,
        options: &LoadOptions,
        context: &LoadContext,
    ) -> Result<Image, LoadError>;

    /// 对字节前缀做尽力而为的解码；无法产出图片时返回 `None`。
    fn decode_partial(&self, _bytes: &[u8]) -> Option<PartialImage> {
        None
    }

    /// 根据开头的字节判断内容是否为图片。
    fn sniff(&self, _prefix: &[u8]) -> Sniff {
        Sniff::Image
    }
}

/// 解码阶段资源上限。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// 像素上限（`width * height`）。
    pub max_pixels: u64,
    /// 预计内存上限（按 RGBA 估算）。
    pub max_bytes: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_pixels: 40_000_000,
            max_bytes: 160 * 1024 * 1024,
        }
    }
}

impl DecodeLimits {
    /// 校验像素数量与预计内存。
    pub fn check(&self, width: u32, height: u32) -> Result<(), LoadError> {
        let pixels = (width as u64)
            .checked_mul(height as u64)
            .ok_or_else(|| LoadError::DecodeFailed("图片像素数溢出".to_string()))?;

        if pixels > self.max_pixels {
            return Err(LoadError::DecodeFailed(format!(
                "图片像素过大：{} 像素（限制：{} 像素）",
                pixels, self.max_pixels
            )));
        }

        let estimated = pixels
            .checked_mul(4)
            .ok_or_else(|| LoadError::DecodeFailed("图片解码内存估算溢出".to_string()))?;

        if estimated > self.max_bytes {
            return Err(LoadError::DecodeFailed(format!(
                "图片解码预计内存过大：{:.2} MB（限制：{:.2} MB）",
                estimated as f64 / 1024.0 / 1024.0,
                self.max_bytes as f64 / 1024.0 / 1024.0
            )));
        }

        Ok(())
    }
}

/// 基于 `image` crate 的默认编解码器。
#[derive(Debug, Clone, Default)]
pub struct StandardCodec {
    limits: DecodeLimits,
}

impl StandardCodec {
    pub fn new(limits: DecodeLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> DecodeLimits {
        self.limits
    }

    /// 仅通过内存中的图片头信息读取宽高。
    fn inspect_dimensions(bytes: &[u8], format: ImageFormat) -> Result<(u32, u32), LoadError> {
        let mut reader = ImageReader::new(Cursor::new(bytes));
        reader.set_format(format);
        reader
            .into_dimensions()
            .map_err(|e| LoadError::DecodeFailed(format!("无法读取图片尺寸：{}", e)))
    }

    fn decode_with_format(&self, bytes: &[u8], format: ImageFormat) -> Result<Image, LoadError> {
        let (header_width, header_height) = Self::inspect_dimensions(bytes, format)?;
        self.limits.check(header_width, header_height)?;

        let decoded = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| LoadError::DecodeFailed(format!("图片解码失败：{}", e)))?;
        self.limits.check(decoded.width(), decoded.height())?;

        Ok(Image::new(decoded, Some(format)))
    }
}

impl ImageCodec for StandardCodec {
    fn decode(
        &self,
        bytes: &[u8],
        locator: &Locator,
        _options: &LoadOptions,
        _context: &LoadContext,
    ) -> Result<Image, LoadError> {
        if bytes.is_empty() {
            return Err(LoadError::DecodeFailed("图片内容为空".to_string()));
        }

        let format = image::guess_format(bytes)
            .map_err(|e| LoadError::DecodeFailed(format!("不支持的图片格式：{}", e)))?;
        let image = self.decode_with_format(bytes, format)?;

        log::debug!(
            "✅ 图片解码成功 - 来源: {} 格式: {:?} 尺寸: {}x{}",
            locator.redacted(),
            format,
            image.width(),
            image.height()
        );

        Ok(image)
    }

    fn decode_partial(&self, bytes: &[u8]) -> Option<PartialImage> {
        let format = image::guess_format(bytes).ok()?;

        let image = if format == ImageFormat::Jpeg && !bytes.ends_with(&JPEG_EOI) {
            // 补齐 EOI 标记，让解码器把已到达的扫描当作完整图像。
            let mut patched = Vec::with_capacity(bytes.len() + JPEG_EOI.len());
            patched.extend_from_slice(bytes);
            patched.extend_from_slice(&JPEG_EOI);
            self.decode_with_format(&patched, format).ok()?
        } else {
            self.decode_with_format(bytes, format).ok()?
        };

        // 解码器把未到达的区域填成底色，输出尺寸恒为头信息尺寸；
        // 能成功解码的前缀越长，已解码的扫描行 / 扫描遍数就越多，补的 EOI 不计入。
        Some(PartialImage {
            image: image.into_partial(),
            quality: bytes.len() as u64,
        })
    }

    fn sniff(&self, prefix: &[u8]) -> Sniff {
        if prefix.is_empty() {
            return Sniff::NeedMore;
        }

        if let Some(kind) = infer::get(prefix) {
            if kind.matcher_type() == infer::MatcherType::Image {
                return Sniff::Image;
            }
            return Sniff::NotImage(kind.mime_type().to_string());
        }

        if image::guess_format(prefix).is_ok() {
            return Sniff::Image;
        }

        Sniff::NeedMore
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, Rgba};

    fn create_png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x % 255) as u8, (y % 255) as u8, ((x + y) % 255) as u8, 255])
        });

        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut cursor, ImageFormat::Png)
            .expect("failed to encode test image");
        cursor.into_inner()
    }

    /// 带细节的基线 JPEG，前缀截断后仍可解出部分扫描行。
    pub(crate) fn create_jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let v = ((x * 7) ^ (y * 13)) as u8;
            image::Rgb([v, v.wrapping_mul(3), (x + y) as u8])
        });

        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
            .encode_image(&img)
            .expect("failed to encode test jpeg");
        out
    }

    fn locator() -> Locator {
        Locator::parse("https://example.com/a.png").expect("locator should parse")
    }

    #[test]
    fn decode_valid_png() {
        let codec = StandardCodec::default();
        let png = create_png_bytes(64, 32);

        let image = codec
            .decode(&png, &locator(), &LoadOptions::default(), &LoadContext::new())
            .expect("decode should succeed");

        assert_eq!((image.width(), image.height()), (64, 32));
        assert_eq!(image.format(), Some(ImageFormat::Png));
        assert!(!image.is_partial());
    }

    #[test]
    fn decode_rejects_too_many_pixels() {
        let codec = StandardCodec::new(DecodeLimits {
            max_pixels: 1_000,
            max_bytes: 160 * 1024 * 1024,
        });
        let png = create_png_bytes(100, 100);

        let result = codec.decode(&png, &locator(), &LoadOptions::default(), &LoadContext::new());
        assert!(matches!(result, Err(LoadError::DecodeFailed(_))));
    }

    #[test]
    fn decode_rejects_garbage_and_empty_input() {
        let codec = StandardCodec::default();
        let options = LoadOptions::default();
        let context = LoadContext::new();

        assert!(matches!(
            codec.decode(b"", &locator(), &options, &context),
            Err(LoadError::DecodeFailed(_))
        ));
        assert!(matches!(
            codec.decode(b"<html>nope</html>", &locator(), &options, &context),
            Err(LoadError::DecodeFailed(_))
        ));
    }

    #[test]
    fn partial_decode_of_truncated_png_yields_nothing() {
        let codec = StandardCodec::default();
        let png = create_png_bytes(64, 64);

        assert!(codec.decode_partial(&png[..png.len() / 3]).is_none());
        assert!(codec.decode_partial(&[]).is_none());

        let full = codec.decode_partial(&png).expect("complete bytes should decode");
        assert_eq!(full.quality, png.len() as u64);
        assert_eq!(full.image.height(), 64);
        assert!(full.image.is_partial());
    }

    #[test]
    fn partial_jpeg_quality_grows_with_prefix() {
        let codec = StandardCodec::default();
        let jpeg = create_jpeg_bytes(64, 256);

        let scores: Vec<u64> = [50, 75, 95]
            .iter()
            .filter_map(|percent| codec.decode_partial(&jpeg[..jpeg.len() * percent / 100]))
            .map(|partial| {
                assert_eq!(partial.image.height(), 256);
                partial.quality
            })
            .collect();

        assert!(scores.len() >= 2, "expected several decodable prefixes, got {scores:?}");
        assert!(scores.windows(2).all(|pair| pair[0] < pair[1]), "{scores:?}");
    }

    #[test]
    fn sniff_recognizes_png_header() {
        let png_signature = [137_u8, 80, 78, 71, 13, 10, 26, 10, 0, 0, 0, 13];
        assert_eq!(StandardCodec::default().sniff(&png_signature), Sniff::Image);
    }

    #[test]
    fn sniff_rejects_known_non_image_payload() {
        let zip = [0x50_u8, 0x4B, 0x03, 0x04, 0x14, 0x00, 0x00, 0x00];
        assert!(matches!(StandardCodec::default().sniff(&zip), Sniff::NotImage(_)));
        assert_eq!(StandardCodec::default().sniff(b"ab"), Sniff::NeedMore);
    }
}
