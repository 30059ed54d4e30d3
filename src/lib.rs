//! # 图片加载核心 — 库入口
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        调用方                            │
//! │   Locator + LoadOptions + LoadContext + 回调             │
//! └───────┬──────────────────────────────────────────────────┘
//!         ↓ load(...) 立即返回 LoadOperation（可取消）
//! ┌───────┼──────────────────────────────────────────────────┐
//! │       ↓                                                  │
//! │  loader::LoaderRegistry ── 第一个 can_load 的加载器       │
//! │   ├─ HttpLoader / FileLoader / DataUrlLoader / 自定义     │
//! │   ↓                                                      │
//! │  operation::OperationDriver                              │
//! │   ├─ 进度（节流、严格递增）                                │
//! │   ├─ decode::ProgressiveDecodeSession  中间帧            │
//! │   └─ decode::ImageCodec               最终解码           │
//! │   ↓                                                      │
//! │  唯一一次终态回调（取消后全部抑制）                       │
//! │                                                          │
//! │  cache::CacheKeyDeriver ── 定位符 → 缓存键 / 不缓存       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 统一错误类型 `LoadError`，带稳定错误码与阶段 |
//! | [`config`] | `LoaderConfig`：传输、解码、进度节流的全部阈值 |
//! | [`locator`] | 图片来源定位符 |
//! | [`model`] | 解码结果、缓存条目、校验信息 |
//! | [`context`] | 请求上下文（类型化键值）与加载选项 |
//! | [`cache`] | 缓存键推导与缓存存储接口 |
//! | [`decode`] | 编解码接口、默认实现、渐进解码会话 |
//! | [`operation`] | 可取消句柄、回调投递、流水线驱动器 |
//! | [`loader`] | 加载器接口、注册表与内置加载器 |

pub mod cache;
pub mod config;
pub mod context;
pub mod decode;
pub mod error;
pub mod loader;
pub mod locator;
pub mod model;
pub mod operation;

pub use cache::{CacheKey, CacheKeyDeriver};
pub use config::LoaderConfig;
pub use context::{LoadContext, LoadOptions};
pub use error::LoadError;
pub use loader::{ImageLoader, LoadEnvironment, LoaderRegistry};
pub use locator::Locator;
pub use model::{CacheValidator, CachedImage, Image};
pub use operation::{LoadCompletion, LoadOperation, LoadProgress};
