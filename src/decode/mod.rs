//! # 解码
//!
//! - `codec`：外部编解码协作者接口与基于 `image` crate 的默认实现
//! - `progressive`：单操作专属的渐进解码会话

mod codec;
mod progressive;

pub use codec::{DecodeLimits, ImageCodec, PartialImage, Sniff, StandardCodec};
pub use progressive::ProgressiveDecodeSession;
