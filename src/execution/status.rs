//! 执行状态与状态图
//!
//! 节点状态机：QUEUED → RUNNING → {SUCCEEDED, FAILED, ABORTED, SKIPPED, EXPIRED}；
//! RUNNING ⇄ PAUSED；RUNNING/PAUSED → DISCARDING → DISCARDED。
//! 每个目标状态有一个「允许的起始状态集合」，存储层据此拒绝非法跳转。

use serde::{Deserialize, Serialize};

/// 节点与计划共用的执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// 已创建，等待协调
    Queued,
    /// 正在执行
    Running,
    /// 初始等待或等待资源（时钟不走）
    Waiting,
    /// 被中断暂停
    Paused,
    /// 强制终止中
    Discarding,
    Discarded,
    Succeeded,
    Failed,
    Aborted,
    Skipped,
    Expired,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Succeeded
                | Status::Failed
                | Status::Aborted
                | Status::Skipped
                | Status::Expired
                | Status::Discarded
        )
    }

    /// 正向终态（顾问与父节点视为成功）
    pub fn is_positive(self) -> bool {
        matches!(self, Status::Succeeded | Status::Skipped)
    }

    /// 失败类终态（重试、忽略等顾问只对这些状态生效）
    pub fn is_broken(self) -> bool {
        matches!(self, Status::Failed | Status::Aborted | Status::Expired)
    }

    /// 「流动」状态：ActiveTimeoutTracker 只在这些状态下计时
    pub fn is_flowing(self) -> bool {
        matches!(self, Status::Running | Status::Discarding)
    }

    /// 仍可接收完成信号的状态
    pub fn is_resumable(self) -> bool {
        matches!(self, Status::Running | Status::Paused | Status::Waiting)
    }

    /// 节点跳到 `self` 之前允许处于的状态
    pub fn node_allowed_start_set(self) -> &'static [Status] {
        use Status::*;
        match self {
            Queued => &[Paused],
            Running => &[Queued, Paused, Waiting],
            Waiting => &[Queued, Running],
            Paused => &[Queued, Running, Waiting],
            Discarding => &[Queued, Running, Waiting, Paused],
            Discarded => &[Discarding],
            Succeeded | Failed | Skipped => &[Queued, Running, Waiting, Discarding],
            Aborted | Expired => &[Queued, Running, Waiting, Paused, Discarding],
        }
    }

    /// 计划跳到 `self` 之前允许处于的状态
    pub fn plan_allowed_start_set(self) -> &'static [Status] {
        use Status::*;
        match self {
            Running => &[Queued, Paused],
            Paused => &[Running],
            Discarding => &[Running, Paused],
            Succeeded | Failed | Skipped => &[Running, Discarding],
            Aborted | Expired => &[Queued, Running, Paused, Discarding],
            Queued | Waiting | Discarded => &[],
        }
    }

    pub fn can_node_transition(from: Status, to: Status) -> bool {
        !from.is_terminal() && to.node_allowed_start_set().contains(&from)
    }

    pub fn can_plan_transition(from: Status, to: Status) -> bool {
        !from.is_terminal() && to.plan_allowed_start_set().contains(&from)
    }

    /// 聚合多个子节点状态：全部正向为成功，否则取最严重的失败
    pub fn aggregate<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
        let mut result = Status::Succeeded;
        for status in statuses {
            result = match (result, status) {
                (_, Status::Aborted) | (Status::Aborted, _) => Status::Aborted,
                (_, Status::Expired) | (Status::Expired, _) => Status::Expired,
                (_, s) if s.is_positive() => result,
                _ => Status::Failed,
            };
        }
        result
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::Waiting => "WAITING",
            Status::Paused => "PAUSED",
            Status::Discarding => "DISCARDING",
            Status::Discarded => "DISCARDED",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Aborted => "ABORTED",
            Status::Skipped => "SKIPPED",
            Status::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Status; 11] = [
        Status::Queued,
        Status::Running,
        Status::Waiting,
        Status::Paused,
        Status::Discarding,
        Status::Discarded,
        Status::Succeeded,
        Status::Failed,
        Status::Aborted,
        Status::Skipped,
        Status::Expired,
    ];

    #[test]
    fn test_terminal_statuses_never_transition() {
        for from in ALL.iter().copied().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!Status::can_node_transition(from, to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_pause_resume_and_discard_path() {
        assert!(Status::can_node_transition(Status::Running, Status::Paused));
        assert!(Status::can_node_transition(Status::Paused, Status::Running));
        assert!(Status::can_node_transition(Status::Paused, Status::Discarding));
        assert!(Status::can_node_transition(Status::Discarding, Status::Discarded));
        assert!(!Status::can_node_transition(Status::Running, Status::Discarded));
        assert!(!Status::can_node_transition(Status::Paused, Status::Succeeded));
    }

    #[test]
    fn test_aggregate() {
        assert_eq!(
            Status::aggregate([Status::Succeeded, Status::Skipped]),
            Status::Succeeded
        );
        assert_eq!(
            Status::aggregate([Status::Succeeded, Status::Failed]),
            Status::Failed
        );
        assert_eq!(
            Status::aggregate([Status::Failed, Status::Aborted, Status::Expired]),
            Status::Aborted
        );
        assert_eq!(Status::aggregate([]), Status::Succeeded);
    }
}
