//! # 配置模块
//!
//! ## 设计思路
//!
//! 将所有“可调策略”集中到 `LoaderConfig`，保证运行时行为可观测、可调整、可测试。
//! 传输、解码、进度节流三个阶段的阈值都在这里，加载器与解码器只读取快照。
//!
//! ## 实现思路
//!
//! - `Default` 提供生产可用的配置。
//! - 通过 serde 从 JSON 加载，缺省字段回落到默认值。
//! - `validate` 集中做范围校验，越界直接返回 `LoadError::InvalidConfig`。
//! - `decode_limits` / `progress_throttle` 把配置投影为各阶段需要的小结构。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::decode::DecodeLimits;
use crate::error::LoadError;
use crate::operation::ThrottleSettings;

/// 图片加载配置。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// 单次加载允许的最大原始字节数。
    pub max_file_size: u64,
    /// 网络请求整体超时（秒）。
    pub download_timeout: u64,
    /// 建立连接（TCP/TLS）超时（秒）。
    pub connect_timeout: u64,
    /// 首包超时（毫秒）。
    pub stream_first_byte_timeout_ms: u64,
    /// 分块读取超时（毫秒）。
    pub stream_chunk_timeout_ms: u64,
    /// 最大重定向次数。
    pub max_redirects: usize,
    /// 是否允许访问内网或本地地址（默认关闭，防 SSRF）。
    pub allow_private_network: bool,
    /// 禁止内网时，是否解析域名并校验解析结果（结果会绑定到本次请求的客户端）。
    pub resolve_dns_for_url_safety: bool,
    /// 解码后的像素上限（`width * height`）。
    pub max_decoded_pixels: u64,
    /// 解码阶段允许的预计内存上限（按 RGBA 估算，字节）。
    pub max_decoded_bytes: u64,
    /// 流式签名探测窗口：超过该字节数仍无法识别为图片则中止。
    pub signature_probe_bytes: usize,
    /// 本地文件分块读取大小（字节）。
    pub file_read_chunk_size: usize,
    /// 是否对进度事件做节流。
    pub throttle_progress: bool,
    /// 两次进度事件的最小间隔（毫秒）。
    pub progress_min_interval_ms: u64,
    /// 无明显变化时的心跳间隔（毫秒）。
    pub progress_heartbeat_ms: u64,
    /// 触发进度事件的最小字节增量。
    pub progress_min_bytes_delta: u64,
    /// 触发进度事件的最小百分比增量。
    pub progress_min_percent_delta: u8,
    /// 无视时间间隔、强制发送的百分比增量。
    pub progress_force_percent_delta: u8,
    /// 两次渐进解码尝试之间的最小新增字节数；实际步长还不小于已尝试长度的 1/4。
    pub progressive_min_bytes_delta: u64,
    /// 两次渐进解码尝试的最小间隔（毫秒）。
    pub progressive_min_interval_ms: u64,
    /// HTTP 请求使用的 User-Agent。
    pub user_agent: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            download_timeout: 30,
            connect_timeout: 8,
            stream_first_byte_timeout_ms: 10_000,
            stream_chunk_timeout_ms: 15_000,
            max_redirects: 5,
            allow_private_network: false,
            resolve_dns_for_url_safety: true,
            max_decoded_pixels: 40_000_000,
            max_decoded_bytes: 160 * 1024 * 1024,
            signature_probe_bytes: 4096,
            file_read_chunk_size: 64 * 1024,
            throttle_progress: true,
            progress_min_interval_ms: 50,
            progress_heartbeat_ms: 400,
            progress_min_bytes_delta: 256 * 1024,
            progress_min_percent_delta: 1,
            progress_force_percent_delta: 5,
            progressive_min_bytes_delta: 64 * 1024,
            progressive_min_interval_ms: 100,
            user_agent: concat!("image-loader-core/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl LoaderConfig {
    /// 从 JSON 字符串解析配置并校验。
    ///
    /// # 示例
    /// ```rust
    /// use image_loader_core::LoaderConfig;
    ///
    /// let config = LoaderConfig::from_json_str(r#"{ "max_redirects": 2 }"#)?;
    /// assert_eq!(config.max_redirects, 2);
    /// # Ok::<(), image_loader_core::LoadError>(())
    /// ```
    pub fn from_json_str(text: &str) -> Result<Self, LoadError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| LoadError::InvalidConfig(format!("解析配置失败：{}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载配置。
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LoadError::InvalidConfig(format!("读取配置文件失败（{}）：{}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    /// 范围校验。
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.max_file_size == 0 {
            return Err(LoadError::InvalidConfig("max_file_size 不能为 0".to_string()));
        }
        if self.max_decoded_bytes < 8 * 1024 * 1024 {
            return Err(LoadError::InvalidConfig("max_decoded_bytes 不能小于 8MB".to_string()));
        }
        if !(1..=600).contains(&self.download_timeout) {
            return Err(LoadError::InvalidConfig("download_timeout 必须在 1~600 秒之间".to_string()));
        }
        if !(1..=120).contains(&self.connect_timeout) {
            return Err(LoadError::InvalidConfig("connect_timeout 必须在 1~120 秒之间".to_string()));
        }
        if !(500..=120_000).contains(&self.stream_first_byte_timeout_ms) {
            return Err(LoadError::InvalidConfig(
                "stream_first_byte_timeout_ms 必须在 500~120000 毫秒之间".to_string(),
            ));
        }
        if !(500..=120_000).contains(&self.stream_chunk_timeout_ms) {
            return Err(LoadError::InvalidConfig(
                "stream_chunk_timeout_ms 必须在 500~120000 毫秒之间".to_string(),
            ));
        }
        if self.max_redirects > 20 {
            return Err(LoadError::InvalidConfig("max_redirects 不能超过 20".to_string()));
        }
        if self.signature_probe_bytes < 64 {
            return Err(LoadError::InvalidConfig("signature_probe_bytes 不能小于 64".to_string()));
        }
        if !(512..=8 * 1024 * 1024).contains(&self.file_read_chunk_size) {
            return Err(LoadError::InvalidConfig(
                "file_read_chunk_size 必须在 512B~8MB 之间".to_string(),
            ));
        }
        if self.progress_min_percent_delta > self.progress_force_percent_delta {
            return Err(LoadError::InvalidConfig(
                "progress_min_percent_delta 不能大于 progress_force_percent_delta".to_string(),
            ));
        }
        if self.progress_min_interval_ms > self.progress_heartbeat_ms {
            return Err(LoadError::InvalidConfig(
                "progress_min_interval_ms 不能大于 progress_heartbeat_ms".to_string(),
            ));
        }
        if self.progressive_min_interval_ms > 10_000 {
            return Err(LoadError::InvalidConfig(
                "progressive_min_interval_ms 不能超过 10000 毫秒".to_string(),
            ));
        }
        if self.progressive_min_bytes_delta > self.max_file_size {
            return Err(LoadError::InvalidConfig(
                "progressive_min_bytes_delta 不能大于 max_file_size".to_string(),
            ));
        }
        Ok(())
    }

    /// 解码阶段资源上限。
    pub fn decode_limits(&self) -> DecodeLimits {
        DecodeLimits {
            max_pixels: self.max_decoded_pixels,
            max_bytes: self.max_decoded_bytes,
        }
    }

    /// 进度节流参数；关闭节流时返回 `None`。
    pub fn throttle_settings(&self) -> Option<ThrottleSettings> {
        if !self.throttle_progress {
            return None;
        }

        Some(ThrottleSettings {
            min_interval: std::time::Duration::from_millis(self.progress_min_interval_ms),
            heartbeat_interval: std::time::Duration::from_millis(self.progress_heartbeat_ms),
            min_bytes_delta: self.progress_min_bytes_delta,
            min_percent_delta: self.progress_min_percent_delta,
            force_percent_delta: self.progress_force_percent_delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        LoaderConfig::default()
            .validate()
            .expect("default config should be valid");
    }

    #[test]
    fn json_missing_fields_fall_back_to_defaults() {
        let config = LoaderConfig::from_json_str(r#"{ "allow_private_network": true }"#)
            .expect("partial json should parse");

        assert!(config.allow_private_network);
        assert_eq!(config.max_file_size, LoaderConfig::default().max_file_size);
    }

    #[test]
    fn json_rejects_out_of_range_timeouts() {
        let result = LoaderConfig::from_json_str(r#"{ "connect_timeout": 0 }"#);
        assert!(matches!(result, Err(LoadError::InvalidConfig(_))));

        let result = LoaderConfig::from_json_str(r#"{ "stream_chunk_timeout_ms": 100 }"#);
        assert!(matches!(result, Err(LoadError::InvalidConfig(_))));
    }

    #[test]
    fn json_rejects_malformed_input() {
        let result = LoaderConfig::from_json_str("{ not json");
        assert!(matches!(result, Err(LoadError::InvalidConfig(_))));
    }

    #[test]
    fn throttle_can_be_disabled() {
        let config = LoaderConfig {
            throttle_progress: false,
            ..LoaderConfig::default()
        };

        assert!(config.throttle_settings().is_none());
        assert!(LoaderConfig::default().throttle_settings().is_some());
    }

    #[test]
    fn decode_limits_follow_config() {
        let config = LoaderConfig {
            max_decoded_pixels: 1_000,
            ..LoaderConfig::default()
        };

        assert_eq!(config.decode_limits().max_pixels, 1_000);
    }

    #[test]
    fn progressive_interval_is_bounded() {
        let result = LoaderConfig::from_json_str(r#"{ "progressive_min_interval_ms": 60000 }"#);
        assert!(matches!(result, Err(LoadError::InvalidConfig(_))));

        let config = LoaderConfig::from_json_str(r#"{ "progressive_min_bytes_delta": 0 }"#)
            .expect("zero byte step is allowed");
        assert_eq!(config.progressive_min_bytes_delta, 0);
    }
}
