//! 中断：用户或系统对运行中计划 / 节点的干预
//!
//! 注册时同步校验目标，处理异步进行：REGISTERED → PROCESSING → PROCESSED_*；
//! 计划结束时仍在 REGISTERED 的中断被丢弃（DISCARDED）。同一计划的中断串行处理。

pub mod manager;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use manager::{InterruptManager, InterruptProcessor};

/// 中断类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    Abort,
    Pause,
    Resume,
    Retry,
    Ignore,
    MarkFailed,
    MarkSuccess,
    /// 超时引擎发起
    MarkExpired,
}

impl InterruptType {
    /// 数值越大越优先；只有严格更高的优先级才能越过正在处理的中断
    pub fn priority(self) -> u8 {
        match self {
            InterruptType::Abort | InterruptType::MarkExpired => 2,
            InterruptType::Retry
            | InterruptType::Ignore
            | InterruptType::MarkFailed
            | InterruptType::MarkSuccess => 1,
            InterruptType::Pause | InterruptType::Resume => 0,
        }
    }

    /// 是否允许不指定节点（作用于整个计划）
    pub fn allows_plan_level(self) -> bool {
        matches!(
            self,
            InterruptType::Abort | InterruptType::Pause | InterruptType::Resume
        )
    }
}

impl std::fmt::Display for InterruptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InterruptType::Abort => "ABORT",
            InterruptType::Pause => "PAUSE",
            InterruptType::Resume => "RESUME",
            InterruptType::Retry => "RETRY",
            InterruptType::Ignore => "IGNORE",
            InterruptType::MarkFailed => "MARK_FAILED",
            InterruptType::MarkSuccess => "MARK_SUCCESS",
            InterruptType::MarkExpired => "MARK_EXPIRED",
        };
        f.write_str(s)
    }
}

/// 中断处理状态，只能单调前进
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    ProcessedSuccessfully,
    ProcessedUnsuccessfully,
    Discarded,
}

impl InterruptState {
    pub fn can_transition_to(self, to: InterruptState) -> bool {
        use InterruptState::*;
        matches!(
            (self, to),
            (Registered, Processing)
                | (Registered, Discarded)
                | (Processing, ProcessedSuccessfully)
                | (Processing, ProcessedUnsuccessfully)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            InterruptState::ProcessedSuccessfully
                | InterruptState::ProcessedUnsuccessfully
                | InterruptState::Discarded
        )
    }
}

/// 发起方
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedBy {
    pub issuer: String,
    pub issue_time: i64,
}

/// 注册请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptPackage {
    pub plan_execution_id: String,
    pub node_execution_id: Option<String>,
    pub interrupt_type: InterruptType,
    pub issued_by: String,
    #[serde(default)]
    pub parameters: Value,
}

impl InterruptPackage {
    pub fn for_plan(
        plan_execution_id: impl Into<String>,
        interrupt_type: InterruptType,
        issued_by: impl Into<String>,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: None,
            interrupt_type,
            issued_by: issued_by.into(),
            parameters: Value::Null,
        }
    }

    pub fn for_node(
        plan_execution_id: impl Into<String>,
        node_execution_id: impl Into<String>,
        interrupt_type: InterruptType,
        issued_by: impl Into<String>,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: Some(node_execution_id.into()),
            interrupt_type,
            issued_by: issued_by.into(),
            parameters: Value::Null,
        }
    }
}

/// 中断记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: String,
    pub interrupt_type: InterruptType,
    pub plan_execution_id: String,
    pub node_execution_id: Option<String>,
    pub issued_by: IssuedBy,
    pub state: InterruptState,
    pub failure_reason: Option<String>,
    pub parameters: Value,
    pub created_at: i64,
    pub last_updated_at: i64,
    pub version: u64,
}

impl Interrupt {
    pub fn from_package(package: InterruptPackage) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: format!("interrupt_{}", uuid::Uuid::new_v4()),
            interrupt_type: package.interrupt_type,
            plan_execution_id: package.plan_execution_id,
            node_execution_id: package.node_execution_id,
            issued_by: IssuedBy {
                issuer: package.issued_by,
                issue_time: now,
            },
            state: InterruptState::Registered,
            failure_reason: None,
            parameters: package.parameters,
            created_at: now,
            last_updated_at: now,
            version: 0,
        }
    }
}
