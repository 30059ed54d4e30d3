//! 进度事件节流。
//!
//! 网络分块往往很碎，逐块回调会把调用方淹没。按时间、字节、百分比三个维度
//! 判断是否值得发送，没有明显变化时按心跳间隔兜底。

use std::time::{Duration, Instant};

/// 节流参数，见 `LoaderConfig` 中对应字段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleSettings {
    pub min_interval: Duration,
    pub heartbeat_interval: Duration,
    pub min_bytes_delta: u64,
    pub min_percent_delta: u8,
    pub force_percent_delta: u8,
}

/// 单个操作的节流状态。
#[derive(Debug)]
pub struct ProgressThrottle {
    settings: Option<ThrottleSettings>,
    last_emit_at: Option<Instant>,
    last_percent: u8,
    last_received: u64,
    last_expected: Option<u64>,
}

impl ProgressThrottle {
    pub fn new(settings: Option<ThrottleSettings>) -> Self {
        Self {
            settings,
            last_emit_at: None,
            last_percent: 0,
            last_received: 0,
            last_expected: None,
        }
    }

    /// 不节流，每个分块都发送。
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn should_emit(&self, received: u64, expected: Option<u64>) -> bool {
        let Some(settings) = self.settings else {
            return true;
        };
        let Some(last_emit_at) = self.last_emit_at else {
            return true;
        };

        let elapsed = last_emit_at.elapsed();
        let percent = percent_of(received, expected);
        let percent_delta = percent.saturating_sub(self.last_percent);
        let bytes_delta = received.saturating_sub(self.last_received);

        if percent_delta >= settings.force_percent_delta {
            return true;
        }

        if percent_delta >= settings.min_percent_delta && elapsed >= settings.min_interval {
            return true;
        }

        if bytes_delta >= settings.min_bytes_delta && elapsed >= settings.min_interval {
            return true;
        }

        if expected != self.last_expected {
            return true;
        }

        elapsed >= settings.heartbeat_interval
    }

    pub fn update(&mut self, received: u64, expected: Option<u64>) {
        self.last_emit_at = Some(Instant::now());
        self.last_percent = percent_of(received, expected);
        self.last_received = received;
        self.last_expected = expected;
    }
}

fn percent_of(received: u64, expected: Option<u64>) -> u8 {
    match expected {
        Some(0) | None => 0,
        Some(total) => (received.saturating_mul(100) / total).min(100) as u8,
    }
}
