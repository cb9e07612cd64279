//! 节点生命周期
//!
//! start → (初始等待) → invoke → dispatch → (等待回调) → resume → conclude → advise → 转移。
//! 任何协调、执行、分发阶段的错误都转成 FAILED 的 StepResponse 重新进入 conclude，
//! 节点不会被静默丢弃。

use std::collections::HashMap;
use std::time::Duration;

use super::{EngineCommand, EngineCore};
use crate::adviser::{self, AdviserResponse};
use crate::constraints::Consumer;
use crate::core::{OrchestrationError, Result};
use crate::events::{EventType, OrchestrationEvent};
use crate::execution::{
    Ambiance, ExecutionMode, FailureInfo, Level, NodeExecution, ParkedAction, ResponseData, Status,
    StepResponse,
};
use crate::facilitator;
use crate::interrupts::{InterruptPackage, InterruptType};
use crate::plan::{PlanNode, TimeoutObtainment};
use crate::step::{ChildSpec, Executable, StepContext};
use crate::timeout::{Dimension, TimeoutCallback};

/// 新节点在 Ambiance 中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// 追加一层（起始节点、子节点）
    Child,
    /// 替换当前层（后继、重试）
    Sibling,
}

/// 按计划节点创建一条 QUEUED 的节点执行
pub(crate) fn new_node_execution(plan_node: &PlanNode, ambiance: &Ambiance, placement: Placement) -> NodeExecution {
    let id = format!("node_exec_{}", uuid::Uuid::new_v4());
    let level = Level {
        runtime_id: id.clone(),
        setup_id: plan_node.uuid.clone(),
        identifier: plan_node.identifier.clone(),
        step_type: plan_node.step_type.clone(),
        group: plan_node.group.clone(),
    };
    let ambiance = match placement {
        Placement::Child => ambiance.with_level(level),
        Placement::Sibling => ambiance.sibling(level),
    };
    NodeExecution::new(
        ambiance.plan_execution_id.clone(),
        plan_node.uuid.clone(),
        plan_node.identifier.clone(),
        plan_node.step_type.clone(),
        ambiance,
    )
    .with_id(id)
}

fn step_failure(error: anyhow::Error) -> StepResponse {
    StepResponse::failed(format!("{:#}", error), "APPLICATION")
}

impl EngineCore {
    pub(crate) async fn handle_command(&self, command: EngineCommand) {
        let node_execution_id = command.node_execution_id().to_string();
        let recoverable = matches!(
            command,
            EngineCommand::StartNode { .. } | EngineCommand::InvokeNode { .. } | EngineCommand::Resume { .. }
        );
        let result = match command {
            EngineCommand::StartNode { node_execution_id } => self.start_node(&node_execution_id).await,
            EngineCommand::InvokeNode { node_execution_id } => self.invoke_node(&node_execution_id).await,
            EngineCommand::Resume {
                node_execution_id,
                responses,
            } => self.resume_node(&node_execution_id, responses).await,
            EngineCommand::Conclude {
                node_execution_id,
                response,
            } => self.conclude_node(&node_execution_id, response).await,
            EngineCommand::Advise { node_execution_id } => {
                let node = self.store.get(&node_execution_id).await;
                match node {
                    Ok(node) if node.is_terminal() => self.advise_and_transition(node, None).await,
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            EngineCommand::RetryNode { node_execution_id } => self.retry_node(&node_execution_id).await,
        };

        match result {
            Ok(()) => {}
            Err(
                e @ (OrchestrationError::InvalidTransition { .. } | OrchestrationError::ConcurrentUpdate { .. }),
            ) => {
                tracing::debug!("Stale engine command dropped: {}", e);
            }
            Err(e @ OrchestrationError::NodeExecutionNotFound(_)) => {
                tracing::error!("Engine command failed: {}", e);
            }
            Err(e) if recoverable => {
                tracing::warn!("Node failed inside the engine: {}", e);
                self.handle_error(&node_execution_id, &e);
            }
            Err(e) => {
                tracing::error!("Engine command failed: {}", e);
                if let Err(e) = self.fail_branch(&node_execution_id, &e).await {
                    tracing::error!("Failed to end branch after engine error: {}", e);
                }
            }
        }
    }

    /// 完成 / 顾问 / 重试阶段出错：节点记下 FailureInfo，分支以 FAILED 结束
    async fn fail_branch(&self, id: &str, error: &OrchestrationError) -> Result<()> {
        let node = self.store.get(id).await?;
        if !node.is_terminal() {
            self.terminate_node(&node, Status::Failed).await?;
        }
        let node = self.record_failure(id, error).await?;
        self.end_transition(&node, Status::Failed).await
    }

    async fn record_failure(&self, id: &str, error: &OrchestrationError) -> Result<NodeExecution> {
        let info = FailureInfo::new(error.to_string(), error.failure_type());
        self.store.update(id, move |n| n.failure_info = Some(info)).await
    }

    /// 把错误转成 FAILED 完成信号
    pub(crate) fn handle_error(&self, node_execution_id: &str, error: &OrchestrationError) {
        self.send(EngineCommand::Conclude {
            node_execution_id: node_execution_id.to_string(),
            response: StepResponse::failed(error.to_string(), error.failure_type()),
        });
    }

    async fn start_node(&self, id: &str) -> Result<()> {
        let node = self.store.get(id).await?;
        if node.status != Status::Queued {
            tracing::debug!("Node is {}, start skipped", node.status);
            return Ok(());
        }

        let plan = self.store.get_plan_execution(&node.plan_execution_id).await?;
        if plan.status == Status::Paused {
            tracing::info!(node_execution_id = %id, "Plan is paused, node parked");
            self.store
                .update_status(id, Status::Paused, |n| n.parked = Some(ParkedAction::Start))
                .await?;
            return Ok(());
        }
        if plan.status.is_terminal() || plan.status == Status::Discarding {
            tracing::info!(node_execution_id = %id, "Plan is {}, node aborted before start", plan.status);
            self.store.update_status(id, Status::Aborted, |_| {}).await?;
            return Ok(());
        }

        let plan_node = self.store.plan_node(&node.plan_execution_id, &node.plan_node_id).await?;
        self.register_timeouts(&node, &plan_node).await?;

        let response = facilitator::facilitate(&self.facilitators, &plan_node, &node.ambiance).await?;
        let mode = response.execution_mode;
        let pass_through = response.pass_through;
        self.store
            .update(id, move |n| {
                n.mode = Some(mode);
                n.pass_through = pass_through;
            })
            .await?;

        if response.initial_wait_ms > 0 {
            self.store.update_status(id, Status::Waiting, |_| {}).await?;
            tracing::info!(node_execution_id = %id, "Initial wait {} ms", response.initial_wait_ms);
            self.send_after(
                Duration::from_millis(response.initial_wait_ms),
                EngineCommand::InvokeNode {
                    node_execution_id: id.to_string(),
                },
            );
            return Ok(());
        }
        self.invoke_node(id).await
    }

    async fn register_timeouts(&self, node: &NodeExecution, plan_node: &PlanNode) -> Result<()> {
        let mut obtainments = plan_node.timeout_obtainments.clone();
        if obtainments.is_empty() {
            if let Some(secs) = self.config.timeouts.default_node_timeout_secs {
                obtainments.push(TimeoutObtainment {
                    dimension: Dimension::Absolute,
                    timeout_ms: (secs as i64).saturating_mul(1000),
                });
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        for obtainment in obtainments {
            let tracker = self.timeouts.create_tracker(
                obtainment.dimension,
                obtainment.timeout_ms,
                now,
                node.status.is_flowing(),
            )?;
            let timeout_id = self.timeouts.register_timeout(
                obtainment.dimension,
                vec![tracker],
                TimeoutCallback::NodeExpiry {
                    plan_execution_id: node.plan_execution_id.clone(),
                    node_execution_id: node.id.clone(),
                },
            )?;
            self.store.append_timeout_instance(&node.id, &timeout_id).await?;
        }
        Ok(())
    }

    async fn invoke_node(&self, id: &str) -> Result<()> {
        let node = self.store.get(id).await?;
        match node.status {
            Status::Paused => {
                self.store
                    .update(id, |n| n.parked = Some(ParkedAction::Invoke))
                    .await?;
                return Ok(());
            }
            Status::Queued | Status::Waiting if node.start_ts.is_none() => {}
            other => {
                tracing::debug!("Node is {}, invoke skipped", other);
                return Ok(());
            }
        }
        let node = self.store.update_status(id, Status::Running, |_| {}).await?;
        self.dispatch_step(node).await
    }

    async fn step_context(&self, node: &NodeExecution) -> Result<StepContext> {
        let plan_node = self.store.plan_node(&node.plan_execution_id, &node.plan_node_id).await?;
        Ok(StepContext {
            ambiance: node.ambiance.clone(),
            plan_execution_id: node.plan_execution_id.clone(),
            node_execution_id: node.id.clone(),
            identifier: node.identifier.clone(),
            step_parameters: plan_node.step_parameters,
            pass_through: node.pass_through.clone(),
        })
    }

    fn conclude(&self, id: &str, response: StepResponse) {
        self.send(EngineCommand::Conclude {
            node_execution_id: id.to_string(),
            response,
        });
    }

    async fn dispatch_step(&self, node: NodeExecution) -> Result<()> {
        let executable = self.steps.obtain(&node.step_type)?;
        let mode = node.mode.unwrap_or_else(|| executable.mode());
        let ctx = self.step_context(&node).await?;
        let id = node.id.as_str();

        match (executable, mode) {
            (Executable::Sync(step), ExecutionMode::Sync) => {
                let response = step.execute_sync(&ctx).await.unwrap_or_else(step_failure);
                self.conclude(id, response);
            }
            (Executable::Async(step), ExecutionMode::Async) => match step.execute_async(&ctx).await {
                Err(e) => self.conclude(id, step_failure(e)),
                Ok(started) if started.callback_ids.is_empty() => {
                    let response = step
                        .handle_async_response(&ctx, &HashMap::new())
                        .await
                        .unwrap_or_else(step_failure);
                    self.conclude(id, response);
                }
                Ok(started) => {
                    if started.waiting {
                        self.store.update_status(id, Status::Waiting, |_| {}).await?;
                    }
                    self.await_callbacks(&node.plan_execution_id, id, started.callback_ids);
                }
            },
            (Executable::Child(step), ExecutionMode::Child) => match step.obtain_child(&ctx).await {
                Err(e) => self.conclude(id, step_failure(e)),
                Ok(spec) => self.spawn_children(&node, vec![spec]).await?,
            },
            (Executable::Children(step), ExecutionMode::Children) => match step.obtain_children(&ctx).await {
                Err(e) => self.conclude(id, step_failure(e)),
                Ok(specs) if specs.is_empty() => {
                    let response = step
                        .handle_children_response(&ctx, &HashMap::new())
                        .await
                        .unwrap_or_else(step_failure);
                    self.conclude(id, response);
                }
                Ok(specs) => self.spawn_children(&node, specs).await?,
            },
            (Executable::Task(step), ExecutionMode::Task) => {
                let Some(dispatcher) = self.dispatcher.clone() else {
                    self.conclude(id, StepResponse::failed("no task dispatcher configured", "CONFIGURATION"));
                    return Ok(());
                };
                let package = match step.obtain_task(&ctx).await {
                    Ok(package) => package,
                    Err(e) => {
                        self.conclude(id, step_failure(e));
                        return Ok(());
                    }
                };
                let task_id = dispatcher.dispatch(package).await?;
                let stored_task_id = task_id.clone();
                self.store
                    .update(id, move |n| n.task_id = Some(stored_task_id))
                    .await?;
                self.await_callbacks(&node.plan_execution_id, id, vec![task_id]);
            }
            (executable, mode) => {
                return Err(OrchestrationError::UnsupportedExecutionMode {
                    step_type: format!("{} ({})", node.step_type, executable.mode()),
                    mode: mode.to_string(),
                });
            }
        }
        Ok(())
    }

    fn await_callbacks(&self, plan_execution_id: &str, id: &str, correlation_ids: Vec<String>) {
        if let Some(done) = self.waits.wait_for_all(plan_execution_id, id, correlation_ids) {
            self.send(EngineCommand::Resume {
                node_execution_id: done.node_execution_id,
                responses: done.responses,
            });
        }
    }

    /// 创建子节点链头；每个链头以自身 ID 作为父节点等待的关联 ID
    async fn spawn_children(&self, parent: &NodeExecution, specs: Vec<ChildSpec>) -> Result<()> {
        let mut children = Vec::with_capacity(specs.len());
        for spec in specs {
            let plan_node = self
                .store
                .plan_node(&parent.plan_execution_id, &spec.child_node_id)
                .await?;
            let child = new_node_execution(&plan_node, &parent.ambiance, Placement::Child).with_parent(&parent.id);
            let notify_id = child.id.clone();
            children.push(child.with_notify(notify_id));
        }

        let correlation_ids: Vec<String> = children.iter().map(|c| c.id.clone()).collect();
        for child in children {
            self.store.save(child).await?;
        }
        self.await_callbacks(&parent.plan_execution_id, &parent.id, correlation_ids.clone());
        tracing::info!(
            node_execution_id = %parent.id,
            "Spawned {} child node(s)",
            correlation_ids.len()
        );
        for child_id in correlation_ids {
            self.send(EngineCommand::StartNode {
                node_execution_id: child_id,
            });
        }
        Ok(())
    }

    async fn resume_node(&self, id: &str, responses: HashMap<String, ResponseData>) -> Result<()> {
        let mut node = self.store.get(id).await?;
        if !node.status.is_resumable() {
            tracing::warn!(node_execution_id = %id, "Node is {}, callback dropped", node.status);
            return Ok(());
        }
        if node.status == Status::Waiting {
            node = self.store.update_status(id, Status::Running, |_| {}).await?;
        }

        let executable = self.steps.obtain(&node.step_type)?;
        let ctx = self.step_context(&node).await?;
        let response = match executable {
            Executable::Async(step) => step.handle_async_response(&ctx, &responses).await,
            Executable::Child(step) => step.handle_child_response(&ctx, &responses).await,
            Executable::Children(step) => step.handle_children_response(&ctx, &responses).await,
            Executable::Task(step) => step.handle_task_result(&ctx, &responses).await,
            Executable::Sync(_) => Err(anyhow::anyhow!("SYNC step {} cannot be resumed", node.step_type)),
        }
        .unwrap_or_else(step_failure);
        self.conclude_node(id, response).await
    }

    /// 处理完成信号：写入终态、清理超时与资源、交给顾问
    async fn conclude_node(&self, id: &str, mut response: StepResponse) -> Result<()> {
        if !response.status.is_terminal() || response.status == Status::Discarded {
            tracing::warn!(node_execution_id = %id, "Step reported {}, treated as FAILED", response.status);
            let reported = response.status;
            response.status = Status::Failed;
            response
                .failure_info
                .get_or_insert_with(|| FailureInfo::new(format!("step reported {}", reported), "UNKNOWN"));
        }

        let (updated, previous_status) = loop {
            let node = self.store.get(id).await?;
            match node.status {
                Status::Paused => {
                    tracing::info!(node_execution_id = %id, "Node is paused, completion parked");
                    self.store
                        .update(id, move |n| n.parked = Some(ParkedAction::Conclude { response }))
                        .await?;
                    return Ok(());
                }
                Status::Queued | Status::Running | Status::Waiting => {}
                other => {
                    tracing::warn!(node_execution_id = %id, "Node is already {}, completion dropped", other);
                    return Ok(());
                }
            }

            let payload = response.clone();
            match self
                .store
                .update_status_with_version(id, node.version, response.status, move |n| {
                    if payload.failure_info.is_some() {
                        n.failure_info = payload.failure_info;
                    }
                    n.outcomes.extend(payload.outcomes);
                    n.parked = None;
                })
                .await
            {
                Ok(updated) => break (updated, node.status),
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        };

        tracing::info!(
            node_execution_id = %id,
            "Node {} finished as {}",
            updated.identifier,
            updated.status
        );
        self.release_node(id).await?;
        self.advise_and_transition(updated, Some(previous_status)).await
    }

    /// 节点结束后的清理：超时实例、等待、持有的资源
    pub(crate) async fn release_node(&self, id: &str) -> Result<()> {
        let timeout_ids = self.store.remove_timeout_instances(id).await?;
        self.timeouts.discard(&timeout_ids);
        self.waits.cancel_for_node(id);
        let unblocked = self.constraints.release_entity(id).await;
        self.notify_unblocked(unblocked);
        Ok(())
    }

    pub(crate) fn notify_unblocked(&self, consumers: Vec<Consumer>) {
        for consumer in consumers {
            let consumer_id = consumer.id;
            tracing::info!(consumer_id = %consumer_id, "Resource granted to blocked consumer");
            self.notify(
                &consumer_id,
                ResponseData::ConstraintGranted {
                    consumer_id: consumer_id.clone(),
                },
            );
        }
    }

    pub(crate) async fn advise_and_transition(
        &self,
        node: NodeExecution,
        from_status: Option<Status>,
    ) -> Result<()> {
        let plan_node = self.store.plan_node(&node.plan_execution_id, &node.plan_node_id).await?;
        let advice = match adviser::advise(&self.advisers, &plan_node, &node, from_status) {
            Ok(advice) => advice,
            Err(e) => {
                tracing::error!(node_execution_id = %node.id, "Adviser failed: {}", e);
                let node = self.record_failure(&node.id, &e).await?;
                return self.end_transition(&node, Status::Failed).await;
            }
        };

        match advice {
            None => {
                let status = if node.status.is_positive() || node.status.is_broken() {
                    node.status
                } else {
                    Status::Failed
                };
                if !status.is_positive() && !plan_node.adviser_obtainments.is_empty() {
                    tracing::warn!(node_execution_id = %node.id, "No adviser matched {}", node.status);
                }
                self.end_transition(&node, status).await
            }
            Some(AdviserResponse::NextStep { next_node_id }) => self.start_next(&node, &next_node_id).await,
            Some(AdviserResponse::Retry { wait_interval_ms }) => {
                tracing::info!(
                    node_execution_id = %node.id,
                    "Retrying {} (attempt {}) in {} ms",
                    node.identifier,
                    node.retry_ids.len() + 2,
                    wait_interval_ms
                );
                self.send_after(
                    Duration::from_millis(wait_interval_ms),
                    EngineCommand::RetryNode {
                        node_execution_id: node.id.clone(),
                    },
                );
                Ok(())
            }
            Some(AdviserResponse::EndPlan { is_abort: true }) => {
                let package = InterruptPackage::for_plan(&node.plan_execution_id, InterruptType::Abort, "ADVISER");
                if let Err(e) = self.interrupts.register(package).await {
                    tracing::warn!("Abort requested by adviser was rejected: {}", e);
                }
                Ok(())
            }
            Some(AdviserResponse::EndPlan { is_abort: false }) => {
                self.end_plan(&node.plan_execution_id, node.status).await
            }
            Some(AdviserResponse::MarkStatus { status }) => self.end_transition(&node, status).await,
        }
    }

    async fn start_next(&self, node: &NodeExecution, next_node_id: &str) -> Result<()> {
        let plan_node = self.store.plan_node(&node.plan_execution_id, next_node_id).await?;
        let mut next = new_node_execution(&plan_node, &node.ambiance, Placement::Sibling).with_previous(&node.id);
        next.parent_id = node.parent_id.clone();
        next.notify_id = node.notify_id.clone();
        let next = self.store.save(next).await?;

        let next_id = next.id.clone();
        self.store.update(&node.id, move |n| n.next_id = Some(next_id)).await?;
        self.send(EngineCommand::StartNode {
            node_execution_id: next.id,
        });
        Ok(())
    }

    /// 为同一计划节点创建新的尝试
    async fn retry_node(&self, id: &str) -> Result<()> {
        let old = self.store.get(id).await?;
        if old.old_retry {
            return Ok(());
        }
        let plan = self.store.get_plan_execution(&old.plan_execution_id).await?;
        if plan.status.is_terminal() {
            tracing::info!(node_execution_id = %id, "Plan already ended, retry skipped");
            return Ok(());
        }

        let plan_node = self.store.plan_node(&old.plan_execution_id, &old.plan_node_id).await?;
        let mut retry_ids = old.retry_ids.clone();
        retry_ids.push(old.id.clone());
        let mut attempt = new_node_execution(&plan_node, &old.ambiance, Placement::Sibling).with_retry_ids(retry_ids);
        attempt.parent_id = old.parent_id.clone();
        attempt.notify_id = old.notify_id.clone();
        attempt.previous_id = old.previous_id.clone();
        let attempt = self.store.save(attempt).await?;

        self.store.mark_retried(&old.id).await?;
        self.store.update_relationships_for_retry(&old.id, &attempt.id).await;
        self.send(EngineCommand::StartNode {
            node_execution_id: attempt.id,
        });
        Ok(())
    }

    /// 分支结束：通知等待中的父节点（以子链头的 identifier 上报），根链则结束计划
    async fn end_transition(&self, node: &NodeExecution, status: Status) -> Result<()> {
        match &node.notify_id {
            Some(correlation_id) => {
                let identifier = match self.store.get(correlation_id).await {
                    Ok(head) => head.identifier,
                    Err(_) => node.identifier.clone(),
                };
                self.notify(
                    correlation_id,
                    ResponseData::NodeStatus {
                        node_execution_id: node.id.clone(),
                        identifier,
                        status,
                    },
                );
                Ok(())
            }
            None => self.end_plan(&node.plan_execution_id, status).await,
        }
    }

    /// 结束计划：丢弃残留节点、写入计划终态、释放计划持有的资源
    pub(crate) async fn end_plan(&self, plan_execution_id: &str, status: Status) -> Result<()> {
        let leftovers = self
            .store
            .fetch_node_executions(plan_execution_id)
            .await
            .into_iter()
            .filter(|n| !n.is_terminal());
        for node in leftovers {
            self.terminate_node(&node, Status::Discarded).await?;
        }

        let plan_status = if status.is_positive() {
            Status::Succeeded
        } else if status.is_terminal() && status != Status::Discarded {
            status
        } else {
            Status::Failed
        };
        match self.store.update_plan_status(plan_execution_id, plan_status).await {
            Ok(_) => {}
            Err(e @ OrchestrationError::InvalidTransition { .. }) => {
                tracing::debug!("Plan already ended: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.events.publish(OrchestrationEvent::for_plan(
            EventType::OrchestrationEnd,
            plan_execution_id,
            plan_status,
        ));
        let unblocked = self.constraints.release_entity(plan_execution_id).await;
        self.notify_unblocked(unblocked);
        self.interrupts.discard_registered(plan_execution_id).await;
        self.waits.release_plan(plan_execution_id);
        tracing::info!(plan_execution_id = %plan_execution_id, "Plan finished as {}", plan_status);
        self.plan_done.notify_waiters();
        Ok(())
    }

    /// 强制结束节点：经 DISCARDING 进入给定终态，竞争失败（已是终态）时静默返回
    pub(crate) async fn terminate_node(&self, node: &NodeExecution, final_status: Status) -> Result<()> {
        let id = node.id.as_str();
        if node.status != Status::Discarding {
            match self.store.update_status(id, Status::Discarding, |_| {}).await {
                Ok(_) => {}
                Err(OrchestrationError::InvalidTransition { .. }) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        match self.store.update_status(id, final_status, |n| n.parked = None).await {
            Ok(_) => {}
            Err(OrchestrationError::InvalidTransition { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        tracing::info!(node_execution_id = %id, "Node {} forced to {}", node.identifier, final_status);
        self.release_node(id).await
    }
}
