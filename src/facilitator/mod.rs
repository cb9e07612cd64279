//! 协调者：决定节点以何种方式执行
//!
//! 计划节点声明一组协调者获取项，按顺序尝试，第一个返回 `Some` 的协调者胜出；
//! 全部返回 `None` 时为 `NoFacilitatorFound`。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{OrchestrationError, Result};
use crate::execution::{Ambiance, ExecutionMode};
use crate::plan::PlanNode;
use crate::registry::Registry;

/// 协调者类型（注册表键）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FacilitatorType {
    Sync,
    Async,
    Child,
    Children,
    Task,
    Custom(String),
}

impl std::fmt::Display for FacilitatorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FacilitatorType::Sync => f.write_str("SYNC"),
            FacilitatorType::Async => f.write_str("ASYNC"),
            FacilitatorType::Child => f.write_str("CHILD"),
            FacilitatorType::Children => f.write_str("CHILDREN"),
            FacilitatorType::Task => f.write_str("TASK"),
            FacilitatorType::Custom(name) => write!(f, "CUSTOM({})", name),
        }
    }
}

/// 协调结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorResponse {
    pub execution_mode: ExecutionMode,
    /// 调度前的初始等待（毫秒），0 表示立即执行
    #[serde(default)]
    pub initial_wait_ms: u64,
    /// 透传给步骤的数据
    #[serde(default)]
    pub pass_through: Value,
}

impl FacilitatorResponse {
    pub fn new(execution_mode: ExecutionMode) -> Self {
        Self {
            execution_mode,
            initial_wait_ms: 0,
            pass_through: Value::Null,
        }
    }
}

/// 协调者
#[async_trait::async_trait]
pub trait Facilitator: Send + Sync {
    async fn facilitate(
        &self,
        ambiance: &Ambiance,
        step_parameters: &Value,
        parameters: &Value,
    ) -> anyhow::Result<Option<FacilitatorResponse>>;
}

/// 固定执行方式的协调者；参数 `initial_wait_ms` 设置初始等待
pub struct ModeFacilitator {
    mode: ExecutionMode,
}

impl ModeFacilitator {
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode }
    }
}

#[async_trait::async_trait]
impl Facilitator for ModeFacilitator {
    async fn facilitate(
        &self,
        _ambiance: &Ambiance,
        _step_parameters: &Value,
        parameters: &Value,
    ) -> anyhow::Result<Option<FacilitatorResponse>> {
        let initial_wait_ms = parameters
            .get("initial_wait_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(Some(FacilitatorResponse {
            execution_mode: self.mode,
            initial_wait_ms,
            pass_through: parameters.get("pass_through").cloned().unwrap_or(Value::Null),
        }))
    }
}

pub type FacilitatorRegistry = Registry<FacilitatorType, Arc<dyn Facilitator>>;

/// 内置五种执行方式的注册表
pub fn default_registry() -> FacilitatorRegistry {
    let mut registry = FacilitatorRegistry::new();
    for (key, mode) in [
        (FacilitatorType::Sync, ExecutionMode::Sync),
        (FacilitatorType::Async, ExecutionMode::Async),
        (FacilitatorType::Child, ExecutionMode::Child),
        (FacilitatorType::Children, ExecutionMode::Children),
        (FacilitatorType::Task, ExecutionMode::Task),
    ] {
        // 新建的注册表不会出现重复键
        let _ = registry.register(key, Arc::new(ModeFacilitator::new(mode)));
    }
    registry
}

/// 依次尝试节点的协调者获取项
pub async fn facilitate(
    registry: &FacilitatorRegistry,
    plan_node: &PlanNode,
    ambiance: &Ambiance,
) -> Result<FacilitatorResponse> {
    for obtainment in &plan_node.facilitator_obtainments {
        let facilitator = registry.obtain(&obtainment.facilitator_type)?;
        let response = facilitator
            .facilitate(ambiance, &plan_node.step_parameters, &obtainment.parameters)
            .await
            .map_err(|e| OrchestrationError::StepFailed(format!("facilitator {}: {}", obtainment.facilitator_type, e)))?;
        if let Some(response) = response {
            tracing::debug!(
                node = %plan_node.identifier,
                "Facilitated by {} as {}",
                obtainment.facilitator_type,
                response.execution_mode
            );
            return Ok(response);
        }
    }
    Err(OrchestrationError::NoFacilitatorFound(plan_node.identifier.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Declining;

    #[async_trait::async_trait]
    impl Facilitator for Declining {
        async fn facilitate(
            &self,
            _ambiance: &Ambiance,
            _step_parameters: &Value,
            _parameters: &Value,
        ) -> anyhow::Result<Option<FacilitatorResponse>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_first_non_empty_response_wins() {
        let mut registry = default_registry();
        registry
            .register(FacilitatorType::Custom("NEVER".into()), Arc::new(Declining))
            .unwrap();

        let mut node = PlanNode::new("a", "a", "NOOP")
            .facilitator(FacilitatorType::Custom("NEVER".into()))
            .facilitator(FacilitatorType::Async)
            .facilitator(FacilitatorType::Sync);
        node.facilitator_obtainments[1].parameters = json!({"initial_wait_ms": 50});

        let response = facilitate(&registry, &node, &Ambiance::new("p1")).await.unwrap();
        assert_eq!(response.execution_mode, ExecutionMode::Async);
        assert_eq!(response.initial_wait_ms, 50);
    }

    #[tokio::test]
    async fn test_no_facilitator_found() {
        let mut registry = FacilitatorRegistry::new();
        registry
            .register(FacilitatorType::Custom("NEVER".into()), Arc::new(Declining))
            .unwrap();
        let node = PlanNode::new("a", "a", "NOOP").facilitator(FacilitatorType::Custom("NEVER".into()));
        let err = facilitate(&registry, &node, &Ambiance::new("p1")).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::NoFacilitatorFound(_)));

        let empty = PlanNode::new("b", "b", "NOOP");
        assert!(facilitate(&registry, &empty, &Ambiance::new("p1")).await.is_err());
    }

    #[tokio::test]
    async fn test_unregistered_facilitator_is_configuration_error() {
        let registry = FacilitatorRegistry::new();
        let node = PlanNode::new("a", "a", "NOOP").facilitator(FacilitatorType::Sync);
        let err = facilitate(&registry, &node, &Ambiance::new("p1")).await.unwrap_err();
        assert_eq!(err.failure_type(), "CONFIGURATION");
    }
}
