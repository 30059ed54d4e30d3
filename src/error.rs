//! # 统一错误类型模块
//!
//! ## 设计思路
//!
//! 加载链路上的所有失败都收敛到 `LoadError`，并且只通过操作的完成回调送达调用方。
//! 使用 `thiserror` 保持可读消息，调用侧按分支匹配即可区分“失败”与“无新数据”。
//!
//! ## 实现思路
//!
//! - 原因统一以字符串承载，保证 `Clone`，可在多次回调之间复制。
//! - `code()` / `stage()` 提供稳定的诊断标识，便于日志与上层展示。
//! - `CacheNotModified` 不是失败，`is_not_modified()` 供调用方快速判断。

/// 图片加载统一错误类型。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// 没有任何已注册加载器能处理该定位符。
    #[error("没有可用的加载器：{0}")]
    NoCapableLoader(String),

    /// 数据传输失败（网络、文件读取、超时、体积超限等）。
    #[error("传输失败：{0}")]
    TransferFailed(String),

    /// 字节无法解码为图片。
    #[error("解码失败：{0}")]
    DecodeFailed(String),

    /// 刷新检查确认远端内容未变化，调用方应复用已缓存图片。
    #[error("缓存内容未变化")]
    CacheNotModified,

    /// 操作已取消。对外投递时会被抑制，仅在内部流转。
    #[error("操作已取消")]
    Cancelled,

    /// 定位符无法解析。
    #[error("定位符无效：{0}")]
    InvalidLocator(String),

    /// 配置值越界或格式错误。
    #[error("配置无效：{0}")]
    InvalidConfig(String),
}

impl LoadError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoCapableLoader(_) => "E_NO_LOADER",
            Self::TransferFailed(_) => "E_TRANSFER",
            Self::DecodeFailed(_) => "E_DECODE",
            Self::CacheNotModified => "E_NOT_MODIFIED",
            Self::Cancelled => "E_CANCELLED",
            Self::InvalidLocator(_) => "E_LOCATOR",
            Self::InvalidConfig(_) => "E_CONFIG",
        }
    }

    /// 出错所在的流水线阶段。
    pub fn stage(&self) -> &'static str {
        match self {
            Self::NoCapableLoader(_) | Self::InvalidLocator(_) => "dispatch",
            Self::TransferFailed(_) | Self::Cancelled => "transfer",
            Self::DecodeFailed(_) => "decode",
            Self::CacheNotModified => "cache",
            Self::InvalidConfig(_) => "config",
        }
    }

    /// 是否为“内容未变化”的成功否定结果。
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::CacheNotModified)
    }
}

impl From<LoadError> for String {
    fn from(error: LoadError) -> Self {
        error.to_string()
    }
}
