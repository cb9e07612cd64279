//! 顾问：节点进入终态后决定下一步
//!
//! 计划节点声明一组顾问获取项；按声明顺序查询，第一个 `can_advise` 为真的顾问胜出。
//! 返回 `None` 表示没有顾问匹配，由引擎按节点状态结束当前分支。

pub mod builtin;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::Result;
use crate::execution::{Ambiance, FailureInfo, NodeExecution, Status};
use crate::plan::PlanNode;
use crate::registry::Registry;

pub use builtin::{
    check_parameters, IgnoreAdviser, NextStepAdviser, OnAbortAdviser, OnFailAdviser, OnSuccessAdviser, RetryAdviser,
};

/// 顾问类型（注册表键）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserType {
    OnSuccess,
    OnFail,
    OnAbort,
    Retry,
    Ignore,
    NextStep,
    Custom(String),
}

impl std::fmt::Display for AdviserType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdviserType::OnSuccess => f.write_str("ON_SUCCESS"),
            AdviserType::OnFail => f.write_str("ON_FAIL"),
            AdviserType::OnAbort => f.write_str("ON_ABORT"),
            AdviserType::Retry => f.write_str("RETRY"),
            AdviserType::Ignore => f.write_str("IGNORE"),
            AdviserType::NextStep => f.write_str("NEXT_STEP"),
            AdviserType::Custom(name) => write!(f, "CUSTOM({})", name),
        }
    }
}

/// 交给顾问的事件
#[derive(Debug, Clone)]
pub struct AdvisingEvent {
    pub ambiance: Ambiance,
    pub node_execution_id: String,
    pub to_status: Status,
    pub from_status: Option<Status>,
    pub failure_info: Option<FailureInfo>,
    pub adviser_parameters: Value,
    /// 之前的重试尝试
    pub retry_ids: Vec<String>,
}

impl AdvisingEvent {
    /// 把顾问参数反序列化为具体类型；参数为空时使用默认值
    pub fn parameters<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.adviser_parameters.is_null() {
            return Ok(T::default());
        }
        Ok(serde_json::from_value(self.adviser_parameters.clone())?)
    }
}

/// 顾问的决定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserResponse {
    NextStep { next_node_id: String },
    Retry { wait_interval_ms: u64 },
    EndPlan { is_abort: bool },
    /// 以给定状态结束当前分支（节点自身状态不变）
    MarkStatus { status: Status },
}

pub trait Adviser: Send + Sync {
    fn can_advise(&self, event: &AdvisingEvent) -> bool;

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<AdviserResponse>;
}

pub type AdviserRegistry = Registry<AdviserType, Arc<dyn Adviser>>;

/// 内置顾问注册表
pub fn default_registry(default_retry_wait_ms: u64) -> AdviserRegistry {
    let mut registry = AdviserRegistry::new();
    let builtins: Vec<(AdviserType, Arc<dyn Adviser>)> = vec![
        (AdviserType::OnSuccess, Arc::new(OnSuccessAdviser)),
        (AdviserType::OnFail, Arc::new(OnFailAdviser)),
        (AdviserType::OnAbort, Arc::new(OnAbortAdviser)),
        (AdviserType::Retry, Arc::new(RetryAdviser::new(default_retry_wait_ms))),
        (AdviserType::Ignore, Arc::new(IgnoreAdviser)),
        (AdviserType::NextStep, Arc::new(NextStepAdviser)),
    ];
    for (key, adviser) in builtins {
        let _ = registry.register(key, adviser);
    }
    registry
}

/// 按声明顺序查询顾问
pub fn advise(
    registry: &AdviserRegistry,
    plan_node: &PlanNode,
    node: &NodeExecution,
    from_status: Option<Status>,
) -> Result<Option<AdviserResponse>> {
    for obtainment in &plan_node.adviser_obtainments {
        let adviser = registry.obtain(&obtainment.adviser_type)?;
        builtin::check_parameters(&obtainment.adviser_type, &obtainment.parameters)?;
        let event = AdvisingEvent {
            ambiance: node.ambiance.clone(),
            node_execution_id: node.id.clone(),
            to_status: node.status,
            from_status,
            failure_info: node.failure_info.clone(),
            adviser_parameters: obtainment.parameters.clone(),
            retry_ids: node.retry_ids.clone(),
        };
        if adviser.can_advise(&event) {
            let response = adviser.on_advise_event(&event)?;
            tracing::debug!(
                node_execution_id = %node.id,
                "Adviser {} chose {:?}",
                obtainment.adviser_type,
                response
            );
            return Ok(Some(response));
        }
    }
    Ok(None)
}
