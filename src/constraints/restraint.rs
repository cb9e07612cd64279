//! RESOURCE_RESTRAINT 步骤：申请资源许可，阻塞时以消费者 ID 作为关联 ID 等待放行

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use super::{AcquireMode, ConsumerRequest, ConsumerState, HoldingScope, ResourceConstraintService};
use crate::execution::{Ambiance, Outcome, ResponseData, StepResponse};
use crate::step::{AsyncExecutable, AsyncExecutableResponse, StepContext};

/// 阶段与步骤组在 Ambiance 中的分组标签
pub const STAGE_GROUP: &str = "STAGE";
pub const STEP_GROUP: &str = "STEP_GROUP";

#[derive(Debug, Deserialize)]
struct RestraintParameters {
    resource_name: String,
    #[serde(default = "default_unit")]
    resource_unit: String,
    #[serde(default = "default_permits")]
    permits: u32,
    #[serde(default = "default_scope")]
    holding_scope: HoldingScope,
    #[serde(default = "default_mode")]
    acquire_mode: AcquireMode,
}

fn default_unit() -> String {
    "default".to_string()
}

fn default_permits() -> u32 {
    1
}

fn default_scope() -> HoldingScope {
    HoldingScope::Plan
}

fn default_mode() -> AcquireMode {
    AcquireMode::Ensure
}

/// 持有范围对应的释放实体：计划执行 ID，或最近的阶段 / 步骤组节点执行 ID
pub fn release_entity_id(ambiance: &Ambiance, scope: HoldingScope) -> String {
    let group = match scope {
        HoldingScope::Plan => None,
        HoldingScope::Stage => Some(STAGE_GROUP),
        HoldingScope::Step => Some(STEP_GROUP),
    };
    group
        .and_then(|g| ambiance.nearest_group(g))
        .map(|level| level.runtime_id.clone())
        .unwrap_or_else(|| ambiance.plan_execution_id.clone())
}

pub struct ResourceRestraintStep {
    service: Arc<ResourceConstraintService>,
}

impl ResourceRestraintStep {
    pub fn new(service: Arc<ResourceConstraintService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl AsyncExecutable for ResourceRestraintStep {
    async fn execute_async(&self, ctx: &StepContext) -> anyhow::Result<AsyncExecutableResponse> {
        let params: RestraintParameters = serde_json::from_value(ctx.step_parameters.clone())
            .context("invalid RESOURCE_RESTRAINT parameters")?;
        let constraint = self.service.get_constraint_by_name(&params.resource_name).await?;
        let consumer = self
            .service
            .register_consumer(
                &constraint.id,
                ConsumerRequest {
                    resource_unit: params.resource_unit,
                    permits: params.permits,
                    holding_scope: params.holding_scope,
                    release_entity_id: release_entity_id(&ctx.ambiance, params.holding_scope),
                    acquire_mode: params.acquire_mode,
                },
            )
            .await?;

        if consumer.state == ConsumerState::Active {
            return Ok(AsyncExecutableResponse::default());
        }
        tracing::info!(
            node_execution_id = %ctx.node_execution_id,
            "Waiting for resource {} (consumer {})",
            constraint.name,
            consumer.id
        );
        Ok(AsyncExecutableResponse {
            callback_ids: vec![consumer.id],
            waiting: true,
        })
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext,
        responses: &HashMap<String, ResponseData>,
    ) -> anyhow::Result<StepResponse> {
        let consumer_id = responses.values().find_map(|data| match data {
            ResponseData::ConstraintGranted { consumer_id } => Some(consumer_id.clone()),
            _ => None,
        });
        let mut response = StepResponse::succeeded();
        if let Some(consumer_id) = consumer_id {
            response = response.with_outcome(
                "constraint",
                Outcome::Output {
                    data: serde_json::json!({ "consumer_id": consumer_id }),
                },
            );
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::{ConstraintStrategy, ResourceConstraint};
    use crate::execution::Level;
    use serde_json::{json, Value};

    fn ctx(ambiance: Ambiance, params: Value) -> StepContext {
        StepContext {
            plan_execution_id: ambiance.plan_execution_id.clone(),
            ambiance,
            node_execution_id: "n1".to_string(),
            identifier: "lock".to_string(),
            step_parameters: params,
            pass_through: Value::Null,
        }
    }

    #[test]
    fn test_release_entity_resolution() {
        let ambiance = Ambiance::new("p1").with_level(Level {
            runtime_id: "stage_exec".to_string(),
            setup_id: "stage".to_string(),
            identifier: "deploy".to_string(),
            step_type: "SECTION".to_string(),
            group: Some(STAGE_GROUP.to_string()),
        });
        assert_eq!(release_entity_id(&ambiance, HoldingScope::Plan), "p1");
        assert_eq!(release_entity_id(&ambiance, HoldingScope::Stage), "stage_exec");
        assert_eq!(release_entity_id(&ambiance, HoldingScope::Step), "p1");
    }

    #[tokio::test]
    async fn test_blocked_consumer_waits_on_consumer_id() {
        let service = Arc::new(ResourceConstraintService::new());
        service
            .save_constraint(ResourceConstraint::new("lock", 1, ConstraintStrategy::Fifo))
            .await
            .unwrap();
        let step = ResourceRestraintStep::new(service.clone());
        let params = json!({"resource_name": "lock"});

        let first = step.execute_async(&ctx(Ambiance::new("p1"), params.clone())).await.unwrap();
        assert!(first.callback_ids.is_empty());

        let second = step.execute_async(&ctx(Ambiance::new("p2"), params)).await.unwrap();
        assert_eq!(second.callback_ids.len(), 1);
        assert!(second.waiting);

        let unblocked = service.release_entity("p1").await;
        assert_eq!(unblocked[0].id, second.callback_ids[0]);
    }
}
