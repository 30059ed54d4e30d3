//! # 加载操作句柄
//!
//! ## 设计思路
//!
//! `LoadOperation` 是一次在途加载的可取消句柄，身份即自身（`OperationId`）。
//! 句柄在调用方与后台任务之间共享，状态机为：
//!
//! ```text
//! Pending ──收到字节──▶ Downloading ──▶ Completed（成功 / 失败）
//!    │                      │
//!    └────── cancel() ──────┴──────────▶ Cancelled
//! ```
//!
//! ## 实现思路
//!
//! - 每个投递点都先拿投递锁，再检查取消标志，检查与回调之间没有空窗。
//! - `cancel()` 只置位并唤醒传输循环，立即返回，从不等待回调；调用方线程可以是
//!   回调要切回去的那个线程。`cancel()` 返回时恰好在执行的那一个回调会跑完，
//!   之后开始的投递全部被抑制。
//! - 需要“返回即静默”的调用方用 `cancel_and_wait()`，它额外等待在途回调结束。
//! - 终态回调会把状态切到 `Completed`，与取消竞争时以先拿到状态锁者为准；
//!   一旦观察到取消，连同刚完成的成功结果一起抑制。

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::LoadError;
use crate::locator::Locator;
use crate::model::{CacheValidator, Image};

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DELIVERING: Cell<Option<OperationId>> = const { Cell::new(None) };
}

/// 操作身份。进程内唯一，单调递增。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    pub fn next() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 操作状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Downloading,
    Completed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// 进度事件。`expected` 为 `None` 表示总大小未知（与 `Some(0)` 不同）。
#[derive(Debug, Clone)]
pub struct LoadProgress {
    pub received: u64,
    pub expected: Option<u64>,
    pub locator: Locator,
}

/// 完成事件。
///
/// 渐进模式下同一回调会先收到若干 `is_final = false` 的中间帧，
/// 最后恰好收到一次 `is_final = true`（或终态错误）；非渐进模式只收到一次。
#[derive(Debug, Clone)]
pub struct LoadCompletion {
    pub image: Option<Image>,
    pub data: Option<Bytes>,
    pub error: Option<LoadError>,
    pub is_final: bool,
    /// 来源给出的新鲜度标识，仅成功的终态事件携带。
    pub validator: Option<CacheValidator>,
}

impl LoadCompletion {
    pub fn success(image: Image, data: Bytes, validator: CacheValidator) -> Self {
        Self {
            image: Some(image),
            data: Some(data),
            error: None,
            is_final: true,
            validator: Some(validator),
        }
    }

    pub fn partial(image: Image) -> Self {
        Self {
            image: Some(image),
            data: None,
            error: None,
            is_final: false,
            validator: None,
        }
    }

    pub fn failure(error: LoadError, data: Option<Bytes>) -> Self {
        Self {
            image: None,
            data,
            error: Some(error),
            is_final: true,
            validator: None,
        }
    }

    /// 终态事件转为 `Result`：`Ok(None)` 表示内容未变化。
    pub fn into_result(self) -> Result<Option<Image>, LoadError> {
        match self.error {
            Some(LoadError::CacheNotModified) => Ok(None),
            Some(err) => Err(err),
            None => Ok(self.image),
        }
    }
}

/// 进度回调，在后台线程执行。
pub type ProgressHandler = Arc<dyn Fn(&LoadProgress) + Send + Sync>;

/// 完成回调，可能在任意工作线程执行。
pub type CompletionHandler = Box<dyn FnMut(LoadCompletion) + Send>;

struct Shared {
    id: OperationId,
    locator: Locator,
    state: Mutex<OperationState>,
    cancelled: AtomicBool,
    abort: Notify,
    delivery: Mutex<()>,
}

/// 在途加载的可取消句柄。克隆得到的是同一个操作。
#[derive(Clone)]
pub struct LoadOperation {
    shared: Arc<Shared>,
}

impl LoadOperation {
    pub(crate) fn new(locator: Locator) -> Self {
        Self::with_state(locator, OperationState::Pending)
    }

    /// 创建即处于终态的句柄（如没有可用加载器时）。
    pub(crate) fn already_completed(locator: Locator) -> Self {
        Self::with_state(locator, OperationState::Completed)
    }

    fn with_state(locator: Locator, state: OperationState) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: OperationId::next(),
                locator,
                state: Mutex::new(state),
                cancelled: AtomicBool::new(false),
                abort: Notify::new(),
                delivery: Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> OperationId {
        self.shared.id
    }

    pub fn locator(&self) -> &Locator {
        &self.shared.locator
    }

    pub fn state(&self) -> OperationState {
        *self.lock_state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// 取消操作。幂等；终态之后调用无效果。不阻塞。
    ///
    /// 返回后不会再开始任何进度或完成回调；此刻已在执行的回调不受影响。
    pub fn cancel(&self) {
        let transitioned = {
            let mut state = self.lock_state();
            if state.is_terminal() {
                false
            } else {
                *state = OperationState::Cancelled;
                self.shared.cancelled.store(true, Ordering::SeqCst);
                true
            }
        };

        if transitioned {
            log::debug!("⏹️ 取消加载 {} - {}", self.id(), self.locator().redacted());
            self.shared.abort.notify_waiters();
        }
    }

    /// 取消并等待在途回调返回，之后不会再观察到任何事件。
    ///
    /// 会阻塞当前线程，不要在回调需要切回的线程上调用。在本操作自己的回调里调用时不等待。
    pub fn cancel_and_wait(&self) {
        self.cancel();

        let reentrant = DELIVERING.with(|current| current.get() == Some(self.id()));
        if !reentrant {
            drop(self.lock_delivery());
        }
    }

    /// 在 `cancel()` 被调用后完成；传输循环用它及时中止。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.shared.abort.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_cancelled() {
                return;
            }

            notified.await;
        }
    }

    pub(crate) fn mark_downloading(&self) {
        let mut state = self.lock_state();
        if *state == OperationState::Pending {
            *state = OperationState::Downloading;
        }
    }

    /// 非终态投递：已取消或已结束时返回 `None`。
    pub(crate) fn deliver<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.lock_delivery();
        if self.is_cancelled() || self.state().is_terminal() {
            return None;
        }

        let _scope = DeliveryScope::enter(self.id());
        Some(f())
    }

    /// 终态投递：切换到 `Completed` 后执行回调；已取消或已结束时返回 `false`。
    pub(crate) fn deliver_terminal(&self, f: impl FnOnce()) -> bool {
        let _guard = self.lock_delivery();
        {
            let mut state = self.lock_state();
            if state.is_terminal() {
                return false;
            }
            *state = OperationState::Completed;
        }

        let _scope = DeliveryScope::enter(self.id());
        f();
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, OperationState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.shared.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for LoadOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOperation")
            .field("id", &self.id())
            .field("locator", self.locator())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for LoadOperation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for LoadOperation {}

/// 标记当前线程正在执行某操作的回调，离开作用域时恢复。
struct DeliveryScope {
    previous: Option<OperationId>,
}

impl DeliveryScope {
    fn enter(id: OperationId) -> Self {
        let previous = DELIVERING.with(|current| current.replace(Some(id)));
        Self { previous }
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERING.with(|current| current.set(self.previous));
    }
}
