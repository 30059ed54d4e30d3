//! # 加载操作
//!
//! - `handle`：可取消句柄、状态机、回调类型与投递点
//! - `driver`：字节到达后的统一流水线（进度、渐进解码、最终解码、终态投递）
//! - `throttle`：进度事件节流

mod driver;
mod handle;
mod throttle;

pub use driver::{OperationDriver, TransferOutcome};
pub use handle::{
    CompletionHandler, LoadCompletion, LoadOperation, LoadProgress, OperationId, OperationState,
    ProgressHandler,
};
pub use throttle::{ProgressThrottle, ThrottleSettings};
