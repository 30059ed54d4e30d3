//! # 定位符
//!
//! `Locator` 是图片来源的不可变标识，内部持有解析后的 URL。
//! 相等性与哈希都基于规范字符串形式，缓存键的默认值也取自它。

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

use reqwest::Url;

use crate::error::LoadError;

/// 图片来源定位符（URI 形式）。
#[derive(Clone)]
pub struct Locator {
    url: Url,
}

impl Locator {
    /// 解析 URL 字符串；绝对文件路径会被转换为 `file://` 定位符。
    ///
    /// # 示例
    /// ```rust
    /// use image_loader_core::Locator;
    ///
    /// let locator = Locator::parse("https://example.com/a.png")?;
    /// assert_eq!(locator.scheme(), "https");
    /// # Ok::<(), image_loader_core::LoadError>(())
    /// ```
    pub fn parse(input: &str) -> Result<Self, LoadError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(LoadError::InvalidLocator("定位符为空".to_string()));
        }

        match Url::parse(trimmed) {
            Ok(url) if !Self::looks_like_windows_drive(&url) => Ok(Self { url }),
            _ if Path::new(trimmed).is_absolute() => Self::from_path(trimmed),
            Err(e) => Err(LoadError::InvalidLocator(format!("{}：{}", trimmed, e))),
            Ok(_) => Err(LoadError::InvalidLocator(format!("无法识别的路径：{}", trimmed))),
        }
    }

    /// 由本地绝对路径构造定位符。
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        Url::from_file_path(path)
            .map(|url| Self { url })
            .map_err(|_| LoadError::InvalidLocator(format!("不是绝对路径：{}", path.display())))
    }

    pub fn from_url(url: Url) -> Self {
        Self { url }
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// 规范字符串形式。
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// 适合写入日志的形式：去掉查询串、片段，`data:` 只保留媒体类型。
    pub fn redacted(&self) -> String {
        if self.url.scheme() == "data" {
            let media = self.url.path().split(',').next().unwrap_or_default();
            return format!("data:{},…", media);
        }

        let host = self.url.host_str().unwrap_or_default();
        let port = self.url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        format!("{}://{}{}{}", self.url.scheme(), host, port, self.url.path())
    }

    // `C:\a.png` 会被 URL 解析器当成 scheme 为 `c` 的 URL。
    fn looks_like_windows_drive(url: &Url) -> bool {
        url.scheme().len() == 1 && url.cannot_be_a_base()
    }
}

impl PartialEq for Locator {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Locator {}

impl Hash for Locator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Locator").field(&self.redacted()).finish()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Locator {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
