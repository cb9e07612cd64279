//! 超时追踪器
//!
//! 追踪器是不可变快照：`apply` 对事件作出反应时返回新快照，无变化返回 `None`。
//! - AbsoluteTimeoutTracker：从创建时刻开始计时，不受状态影响
//! - ActiveTimeoutTracker：只在节点处于流动状态（RUNNING / DISCARDING）时计时

use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::execution::Status;

/// 超时维度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Dimension {
    Absolute,
    Active,
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dimension::Absolute => f.write_str("ABSOLUTE"),
            Dimension::Active => f.write_str("ACTIVE"),
        }
    }
}

/// 追踪器可响应的事件
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutEvent {
    StatusUpdate { status: Status, at_ms: i64 },
}

pub trait TimeoutTracker: Send + Sync + Debug {
    fn dimension(&self) -> Dimension;

    /// 到期时刻（毫秒时间戳）；暂停中返回 None
    fn expiry_time(&self) -> Option<i64>;

    /// 对事件作出反应，返回新快照
    fn apply(&self, event: &TimeoutEvent) -> Option<Arc<dyn TimeoutTracker>>;

    /// 剩余预算
    fn remaining_ms(&self, now_ms: i64) -> i64;
}

#[derive(Debug, Clone, PartialEq)]
pub struct AbsoluteTimeoutTracker {
    pub timeout_ms: i64,
    pub start_ms: i64,
}

impl AbsoluteTimeoutTracker {
    pub fn new(timeout_ms: i64, start_ms: i64) -> Self {
        Self { timeout_ms, start_ms }
    }
}

impl TimeoutTracker for AbsoluteTimeoutTracker {
    fn dimension(&self) -> Dimension {
        Dimension::Absolute
    }

    fn expiry_time(&self) -> Option<i64> {
        Some(self.start_ms.saturating_add(self.timeout_ms))
    }

    fn apply(&self, _event: &TimeoutEvent) -> Option<Arc<dyn TimeoutTracker>> {
        None
    }

    fn remaining_ms(&self, now_ms: i64) -> i64 {
        self.start_ms
            .saturating_add(self.timeout_ms)
            .saturating_sub(now_ms)
            .max(0)
    }
}

/// Active 追踪器的计时状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Ticking { since_ms: i64, elapsed_ms: i64 },
    Paused { elapsed_ms: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTimeoutTracker {
    pub timeout_ms: i64,
    pub state: ActiveState,
}

impl ActiveTimeoutTracker {
    pub fn new(timeout_ms: i64, now_ms: i64, ticking: bool) -> Self {
        let state = if ticking {
            ActiveState::Ticking {
                since_ms: now_ms,
                elapsed_ms: 0,
            }
        } else {
            ActiveState::Paused { elapsed_ms: 0 }
        };
        Self { timeout_ms, state }
    }

    pub fn elapsed_ms(&self, now_ms: i64) -> i64 {
        match self.state {
            ActiveState::Ticking { since_ms, elapsed_ms } => {
                elapsed_ms.saturating_add(now_ms.saturating_sub(since_ms).max(0))
            }
            ActiveState::Paused { elapsed_ms } => elapsed_ms,
        }
    }

    pub fn is_ticking(&self) -> bool {
        matches!(self.state, ActiveState::Ticking { .. })
    }

    pub fn pause(&self, at_ms: i64) -> Option<Self> {
        match self.state {
            ActiveState::Ticking { .. } => Some(Self {
                timeout_ms: self.timeout_ms,
                state: ActiveState::Paused {
                    elapsed_ms: self.elapsed_ms(at_ms),
                },
            }),
            ActiveState::Paused { .. } => None,
        }
    }

    pub fn resume(&self, at_ms: i64) -> Option<Self> {
        match self.state {
            ActiveState::Paused { elapsed_ms } => Some(Self {
                timeout_ms: self.timeout_ms,
                state: ActiveState::Ticking {
                    since_ms: at_ms,
                    elapsed_ms,
                },
            }),
            ActiveState::Ticking { .. } => None,
        }
    }
}

impl TimeoutTracker for ActiveTimeoutTracker {
    fn dimension(&self) -> Dimension {
        Dimension::Active
    }

    fn expiry_time(&self) -> Option<i64> {
        match self.state {
            ActiveState::Ticking { since_ms, elapsed_ms } => {
                Some(since_ms.saturating_add(self.timeout_ms.saturating_sub(elapsed_ms)))
            }
            ActiveState::Paused { .. } => None,
        }
    }

    fn apply(&self, event: &TimeoutEvent) -> Option<Arc<dyn TimeoutTracker>> {
        let TimeoutEvent::StatusUpdate { status, at_ms } = event;
        let next = if status.is_flowing() {
            self.resume(*at_ms)
        } else {
            self.pause(*at_ms)
        };
        next.map(|t| Arc::new(t) as Arc<dyn TimeoutTracker>)
    }

    fn remaining_ms(&self, now_ms: i64) -> i64 {
        self.timeout_ms.saturating_sub(self.elapsed_ms(now_ms)).max(0)
    }
}

/// 追踪器工厂（按维度注册）
pub trait TimeoutTrackerFactory: Send + Sync {
    fn create(&self, timeout_ms: i64, now_ms: i64, flowing: bool) -> Arc<dyn TimeoutTracker>;
}

pub struct AbsoluteTrackerFactory;

impl TimeoutTrackerFactory for AbsoluteTrackerFactory {
    fn create(&self, timeout_ms: i64, now_ms: i64, _flowing: bool) -> Arc<dyn TimeoutTracker> {
        Arc::new(AbsoluteTimeoutTracker::new(timeout_ms, now_ms))
    }
}

pub struct ActiveTrackerFactory;

impl TimeoutTrackerFactory for ActiveTrackerFactory {
    fn create(&self, timeout_ms: i64, now_ms: i64, flowing: bool) -> Arc<dyn TimeoutTracker> {
        Arc::new(ActiveTimeoutTracker::new(timeout_ms, now_ms, flowing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event(status: Status, at_ms: i64) -> TimeoutEvent {
        TimeoutEvent::StatusUpdate { status, at_ms }
    }

    #[test]
    fn test_pause_resume_without_elapsed_time_keeps_budget() {
        let tracker = ActiveTimeoutTracker::new(10_000, 1_000, true);
        let paused = tracker.apply(&status_event(Status::Paused, 1_000)).unwrap();
        assert_eq!(paused.expiry_time(), None);
        let resumed = paused.apply(&status_event(Status::Running, 1_000)).unwrap();
        assert_eq!(resumed.remaining_ms(1_000), 10_000);
        assert_eq!(resumed.expiry_time(), Some(11_000));
    }

    #[test]
    fn test_paused_time_does_not_count() {
        let tracker = ActiveTimeoutTracker::new(10_000, 0, true);
        let paused = tracker.pause(4_000).unwrap();
        assert_eq!(paused.remaining_ms(50_000), 6_000);
        let resumed = paused.resume(50_000).unwrap();
        assert_eq!(resumed.expiry_time(), Some(56_000));
    }

    #[test]
    fn test_redundant_events_yield_no_snapshot() {
        let tracker = ActiveTimeoutTracker::new(1_000, 0, true);
        assert!(tracker.apply(&status_event(Status::Discarding, 10)).is_none());
        let waiting = ActiveTimeoutTracker::new(1_000, 0, false);
        assert!(waiting.apply(&status_event(Status::Waiting, 10)).is_none());
        assert!(waiting.apply(&status_event(Status::Running, 10)).is_some());
    }

    #[test]
    fn test_absolute_ignores_events() {
        let tracker = AbsoluteTimeoutTracker::new(500, 100);
        assert!(tracker.apply(&status_event(Status::Paused, 200)).is_none());
        assert_eq!(tracker.expiry_time(), Some(600));
        assert_eq!(tracker.remaining_ms(1_000), 0);
    }

    #[test]
    fn test_huge_budget_never_wraps_into_the_past() {
        let absolute = AbsoluteTimeoutTracker::new(i64::MAX, 1_700_000_000_000);
        assert_eq!(absolute.expiry_time(), Some(i64::MAX));
        assert!(absolute.remaining_ms(1_700_000_000_001) > 0);

        let active = ActiveTimeoutTracker::new(i64::MAX, 1_700_000_000_000, true);
        assert_eq!(active.expiry_time(), Some(i64::MAX));
        let resumed = active.pause(1_700_000_000_500).unwrap().resume(1_800_000_000_000).unwrap();
        assert_eq!(resumed.expiry_time(), Some(i64::MAX));
        assert!(resumed.remaining_ms(1_800_000_000_001) > 0);
    }
}
