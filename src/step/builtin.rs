//! 内置步骤

use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use serde_json::Value;

use super::{ChildExecutable, ChildSpec, ChildrenExecutable, StepContext, SyncExecutable, TaskExecutable};
use crate::delegate::TaskPackage;
use crate::execution::{ChildOutcome, Outcome, ResponseData, Status, StepResponse};

/// 空操作；参数中的 `output` 作为产出
pub struct NoopStep;

#[async_trait::async_trait]
impl SyncExecutable for NoopStep {
    async fn execute_sync(&self, ctx: &StepContext) -> anyhow::Result<StepResponse> {
        let mut response = StepResponse::succeeded();
        if let Some(output) = ctx.step_parameters.get("output") {
            response = response.with_outcome("output", Outcome::Output { data: output.clone() });
        }
        Ok(response)
    }
}

/// 总是失败；参数 `message` 为失败原因
pub struct FailStep;

#[async_trait::async_trait]
impl SyncExecutable for FailStep {
    async fn execute_sync(&self, ctx: &StepContext) -> anyhow::Result<StepResponse> {
        let message = ctx
            .step_parameters
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("step failed");
        Ok(StepResponse::failed(message, "APPLICATION"))
    }
}

/// 全部子链状态的聚合
fn aggregate_children(responses: &HashMap<String, ResponseData>) -> Status {
    Status::aggregate(responses.values().filter_map(|data| match data {
        ResponseData::NodeStatus { status, .. } => Some(*status),
        _ => None,
    }))
}

/// 子链结果按子节点 identifier 建键；identifier 重复时键后追加 `#关联 ID`
fn child_outcomes(responses: &HashMap<String, ResponseData>) -> BTreeMap<String, ChildOutcome> {
    let entries: Vec<(&String, &String, ChildOutcome)> = responses
        .iter()
        .filter_map(|(correlation_id, data)| match data {
            ResponseData::NodeStatus {
                node_execution_id,
                identifier,
                status,
            } => Some((
                identifier,
                correlation_id,
                ChildOutcome {
                    node_execution_id: node_execution_id.clone(),
                    status: *status,
                },
            )),
            _ => None,
        })
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for &(identifier, _, _) in &entries {
        *counts.entry(identifier.as_str()).or_default() += 1;
    }
    entries
        .into_iter()
        .map(|(identifier, correlation_id, outcome)| {
            let key = if counts.get(identifier.as_str()).copied().unwrap_or(0) > 1 {
                format!("{}#{}", identifier, correlation_id)
            } else {
                identifier.clone()
            };
            (key, outcome)
        })
        .collect()
}

/// 分段：执行一条子链，结果取子链状态
pub struct SectionStep;

#[async_trait::async_trait]
impl ChildExecutable for SectionStep {
    async fn obtain_child(&self, ctx: &StepContext) -> anyhow::Result<ChildSpec> {
        let child_node_id = ctx
            .step_parameters
            .get("child_node_id")
            .and_then(Value::as_str)
            .context("SECTION requires step parameter child_node_id")?;
        Ok(ChildSpec {
            child_node_id: child_node_id.to_string(),
        })
    }

    async fn handle_child_response(
        &self,
        _ctx: &StepContext,
        responses: &HashMap<String, ResponseData>,
    ) -> anyhow::Result<StepResponse> {
        Ok(StepResponse::new(aggregate_children(responses)))
    }
}

/// 分叉：并行执行多个子节点，按子节点 identifier 汇总
pub struct ForkStep;

#[async_trait::async_trait]
impl ChildrenExecutable for ForkStep {
    async fn obtain_children(&self, ctx: &StepContext) -> anyhow::Result<Vec<ChildSpec>> {
        let ids = ctx
            .step_parameters
            .get("children_node_ids")
            .and_then(Value::as_array)
            .context("FORK requires step parameter children_node_ids")?;
        ids.iter()
            .map(|id| {
                id.as_str()
                    .map(|s| ChildSpec {
                        child_node_id: s.to_string(),
                    })
                    .context("children_node_ids must be strings")
            })
            .collect()
    }

    async fn handle_children_response(
        &self,
        _ctx: &StepContext,
        responses: &HashMap<String, ResponseData>,
    ) -> anyhow::Result<StepResponse> {
        let status = aggregate_children(responses);
        Ok(StepResponse::new(status).with_outcome(
            "fork",
            Outcome::Fork {
                children: child_outcomes(responses),
            },
        ))
    }
}

/// 委托任务：把参数打包交给 TaskDispatcher，结果映射为步骤状态
pub struct DelegateTaskStep;

#[async_trait::async_trait]
impl TaskExecutable for DelegateTaskStep {
    async fn obtain_task(&self, ctx: &StepContext) -> anyhow::Result<TaskPackage> {
        let params = &ctx.step_parameters;
        let capabilities = params
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|caps| caps.iter().filter_map(|c| c.as_str().map(String::from)).collect())
            .unwrap_or_default();
        Ok(TaskPackage {
            plan_execution_id: ctx.plan_execution_id.clone(),
            node_execution_id: ctx.node_execution_id.clone(),
            parameters: params.get("parameters").cloned().unwrap_or(Value::Null),
            capabilities,
            timeout_ms: params.get("timeout_ms").and_then(Value::as_u64),
        })
    }

    async fn handle_task_result(
        &self,
        _ctx: &StepContext,
        responses: &HashMap<String, ResponseData>,
    ) -> anyhow::Result<StepResponse> {
        let result = responses.values().find_map(|data| match data {
            ResponseData::TaskResult { status, data, error } => Some((*status, data, error)),
            _ => None,
        });
        let (status, data, error) = result.context("no task result in responses")?;
        if status.is_positive() {
            Ok(StepResponse::succeeded().with_outcome("output", Outcome::Output { data: data.clone() }))
        } else {
            let mut response = StepResponse::failed(
                error.clone().unwrap_or_else(|| "delegate task failed".to_string()),
                "DELEGATE",
            );
            if status.is_broken() {
                response.status = status;
            }
            Ok(response)
        }
    }
}
