use super::types::TimePoint;
use log::debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// 漂移校正的容差带：15ms
pub const DRIFT_TOLERANCE: TimePoint = TimePoint::from_millis(15);

/// 软件参考时钟（解码时钟域）
pub trait SystemClock: Send + Sync {
    fn now(&self) -> TimePoint;
}

/// 单调时钟 - 以创建时刻为零点
#[derive(Clone)]
pub struct MonotonicClock {
    base: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { base: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock for MonotonicClock {
    fn now(&self) -> TimePoint {
        TimePoint::from_micros(self.base.elapsed().as_micros() as i64)
    }
}

/// 手动推进的时钟（测试和模拟设备使用）
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, t: TimePoint) {
        self.now.store(t.as_micros(), Ordering::SeqCst);
    }

    pub fn advance(&self, d: TimePoint) {
        self.now.fetch_add(d.as_micros(), Ordering::SeqCst);
    }
}

impl SystemClock for ManualClock {
    fn now(&self) -> TimePoint {
        TimePoint::from_micros(self.now.load(Ordering::SeqCst))
    }
}

/// 软件时钟与硬件时钟之间的偏移状态
///
/// 只由喂帧线程修改；所有出站时间戳都减去 `offset` 后再交给硬件。
#[derive(Debug, Clone, Default)]
pub struct ClockState {
    system_reference: Option<TimePoint>,
    hardware_reference: Option<TimePoint>,
    offset: TimePoint,
}

impl ClockState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> TimePoint {
        self.offset
    }

    /// 软件时间戳 -> 硬件时钟域
    pub fn adjust(&self, t: TimePoint) -> TimePoint {
        t - self.offset
    }

    /// 读入一对参考时钟；偏移被重新计算时返回 true
    ///
    /// 第一次调用只记录基线。之后仅当 |Δ软件 − Δ硬件| 超过 |offset| + 15ms
    /// 时才更新偏移，普通的调度抖动不会引起偏移抖动。
    pub fn update(&mut self, system_now: TimePoint, hardware_now: TimePoint) -> bool {
        let (Some(system_ref), Some(hardware_ref)) = (self.system_reference, self.hardware_reference) else {
            self.system_reference = Some(system_now);
            self.hardware_reference = Some(hardware_now);
            return false;
        };

        let system_diff = system_now - system_ref;
        let hardware_diff = hardware_now - hardware_ref;
        let drift = system_diff - hardware_diff;
        if drift.abs() > self.offset.abs() + DRIFT_TOLERANCE {
            self.offset = drift;
            debug!("硬件时钟偏移更新为 {} ms", self.offset.as_millis());
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
