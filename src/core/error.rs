//! 编排错误类型
//!
//! 与引擎配合：InvalidTransition / ConcurrentUpdate 由调用方重新读取后决定；
//! 协调/顾问阶段的其余错误被引擎转成 FAILED + FailureInfo，保证计划总能走到终态。

use thiserror::Error;

use crate::execution::Status;

/// 策略注册表错误（启动期配置错误，运行期不可恢复）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate registry for key: {0}")]
    DuplicateRegistry(String),

    #[error("Unregistered key accessed: {0}")]
    UnregisteredKeyAccess(String),
}

/// 编排核心可能出现的错误
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Node execution not found: {0}")]
    NodeExecutionNotFound(String),

    #[error("Plan execution not found: {0}")]
    PlanExecutionNotFound(String),

    #[error("Plan node not found: {0}")]
    PlanNodeNotFound(String),

    #[error("Invalid transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition { id: String, from: Status, to: Status },

    /// 乐观锁版本不一致，调用方应重新读取后重试
    #[error("Concurrent update on {id}: expected version {expected}, found {actual}")]
    ConcurrentUpdate { id: String, expected: u64, actual: u64 },

    #[error("No facilitator found for node: {0}")]
    NoFacilitatorFound(String),

    #[error("No adviser found for node: {0}")]
    NoAdviserFound(String),

    #[error("Invalid parameters for adviser {adviser}: {reason}")]
    InvalidAdviserParameters { adviser: String, reason: String },

    #[error("Step type {step_type} does not support execution mode {mode}")]
    UnsupportedExecutionMode { step_type: String, mode: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// 中断注册失败（目标不存在或已是终态），中断不会被创建
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Task dispatch failed: {0}")]
    TaskDispatchFailed(String),

    #[error("Resource constraint not found: {0}")]
    ConstraintNotFound(String),

    #[error("Invalid permits: requested {requested}, capacity {capacity}")]
    InvalidPermits { requested: u32, capacity: u32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Step failed: {0}")]
    StepFailed(String),
}

impl OrchestrationError {
    /// 是否可由调用方重新读取后重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestrationError::ConcurrentUpdate { .. })
    }

    /// 写入 FailureInfo 的错误分类
    pub fn failure_type(&self) -> &'static str {
        match self {
            OrchestrationError::NoFacilitatorFound(_)
            | OrchestrationError::NoAdviserFound(_)
            | OrchestrationError::InvalidAdviserParameters { .. }
            | OrchestrationError::PlanNodeNotFound(_)
            | OrchestrationError::Registry(_)
            | OrchestrationError::UnsupportedExecutionMode { .. } => "CONFIGURATION",
            OrchestrationError::TaskDispatchFailed(_) => "DELEGATE",
            OrchestrationError::StepFailed(_) => "APPLICATION",
            OrchestrationError::InvalidTransition { .. }
            | OrchestrationError::ConcurrentUpdate { .. } => "CONCURRENCY",
            _ => "UNKNOWN",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_update_is_retryable() {
        let err = OrchestrationError::ConcurrentUpdate {
            id: "n1".to_string(),
            expected: 1,
            actual: 2,
        };
        assert!(err.is_retryable());
        assert_eq!(err.failure_type(), "CONCURRENCY");
    }

    #[test]
    fn test_registry_error_converts() {
        let err: OrchestrationError = RegistryError::UnregisteredKeyAccess("SYNC".to_string()).into();
        assert!(!err.is_retryable());
        assert_eq!(err.failure_type(), "CONFIGURATION");
        assert!(err.to_string().contains("SYNC"));
    }
}
