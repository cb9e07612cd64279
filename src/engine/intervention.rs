//! 中断处理：引擎作为 InterruptProcessor
//!
//! 计划级：ABORT / PAUSE / RESUME；节点级另有 RETRY、IGNORE、MARK_*、MARK_EXPIRED。
//! ABORT 与 MARK_EXPIRED 共用同一条级联路径：后代先于目标（后序），逐个经 DISCARDING 进入终态。

use super::{EngineCommand, EngineCore};
use crate::core::{OrchestrationError, Result};
use crate::execution::{NodeExecution, ParkedAction, Status};
use crate::interrupts::{Interrupt, InterruptProcessor, InterruptType};

const NON_TERMINAL: [Status; 5] = [
    Status::Queued,
    Status::Running,
    Status::Waiting,
    Status::Paused,
    Status::Discarding,
];

#[async_trait::async_trait]
impl InterruptProcessor for EngineCore {
    async fn process(&self, interrupt: &Interrupt) -> Result<()> {
        let plan_execution_id = interrupt.plan_execution_id.as_str();
        match (interrupt.node_execution_id.as_deref(), interrupt.interrupt_type) {
            (None, InterruptType::Abort) => self.abort_plan(plan_execution_id).await,
            (None, InterruptType::Pause) => self.pause_plan(plan_execution_id).await,
            (None, InterruptType::Resume) => self.resume_plan(plan_execution_id).await,
            (None, other) => Err(OrchestrationError::InvalidRequest(format!(
                "{} requires a node execution",
                other
            ))),
            (Some(id), InterruptType::Abort) => self.abort_node(id, Status::Aborted).await,
            (Some(id), InterruptType::MarkExpired) => self.abort_node(id, Status::Expired).await,
            (Some(id), InterruptType::Pause) => {
                let node = self.live_node(id).await?;
                for target in self.subtree(&node, true).await {
                    self.pause_node(&target).await?;
                }
                Ok(())
            }
            (Some(id), InterruptType::Resume) => {
                let node = self.live_node(id).await?;
                let mut targets = self.subtree(&node, true).await;
                targets.reverse();
                for target in targets.iter().filter(|n| n.status == Status::Paused) {
                    self.resume_paused(target).await?;
                }
                Ok(())
            }
            (Some(id), InterruptType::Retry) => self.retry_intervention(id).await,
            (Some(id), InterruptType::Ignore) => self.mark_node(id, Status::Skipped).await,
            (Some(id), InterruptType::MarkFailed) => self.mark_node(id, Status::Failed).await,
            (Some(id), InterruptType::MarkSuccess) => self.mark_node(id, Status::Succeeded).await,
        }
    }
}

impl EngineCore {
    async fn live_node(&self, id: &str) -> Result<NodeExecution> {
        let node = self.store.get(id).await?;
        if node.is_terminal() {
            return Err(OrchestrationError::InvalidRequest(format!(
                "node execution {} is already {}",
                id, node.status
            )));
        }
        Ok(node)
    }

    /// 未结束的后代（后序），可选包含节点自身
    async fn subtree(&self, node: &NodeExecution, include_self: bool) -> Vec<NodeExecution> {
        self.store
            .find_all_children_with_status_in(&node.plan_execution_id, &node.id, &NON_TERMINAL, include_self)
            .await
    }

    async fn abort_subtree(&self, node: &NodeExecution, final_status: Status) -> Result<()> {
        for target in self.subtree(node, true).await {
            let status = if target.id == node.id {
                final_status
            } else {
                Status::Aborted
            };
            self.terminate_node(&target, status).await?;
        }
        Ok(())
    }

    async fn abort_plan(&self, plan_execution_id: &str) -> Result<()> {
        let plan = self.store.get_plan_execution(plan_execution_id).await?;
        if plan.status.is_terminal() {
            return Err(OrchestrationError::InvalidRequest(format!(
                "plan execution {} is already {}",
                plan_execution_id, plan.status
            )));
        }
        if plan.status != Status::Discarding {
            self.store
                .update_plan_status(plan_execution_id, Status::Discarding)
                .await?;
        }
        for root in self.store.fetch_roots(plan_execution_id).await {
            if !root.is_terminal() {
                self.abort_subtree(&root, Status::Aborted).await?;
            }
        }
        self.end_plan(plan_execution_id, Status::Aborted).await
    }

    /// 节点级 ABORT / MARK_EXPIRED：级联结束后交给顾问
    async fn abort_node(&self, id: &str, final_status: Status) -> Result<()> {
        let node = self.live_node(id).await?;
        self.abort_subtree(&node, final_status).await?;
        self.send(EngineCommand::Advise {
            node_execution_id: id.to_string(),
        });
        Ok(())
    }

    async fn pause_plan(&self, plan_execution_id: &str) -> Result<()> {
        self.store
            .update_plan_status(plan_execution_id, Status::Paused)
            .await?;
        for node in self.store.fetch_node_executions(plan_execution_id).await {
            self.pause_node(&node).await?;
        }
        Ok(())
    }

    async fn pause_node(&self, node: &NodeExecution) -> Result<()> {
        let parked = match node.status {
            Status::Queued => Some(ParkedAction::Start),
            Status::Waiting if node.start_ts.is_none() => Some(ParkedAction::Invoke),
            Status::Running | Status::Waiting => None,
            _ => return Ok(()),
        };
        match self
            .store
            .update_status(&node.id, Status::Paused, move |n| {
                if parked.is_some() {
                    n.parked = parked;
                }
            })
            .await
        {
            Ok(_) | Err(OrchestrationError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn resume_plan(&self, plan_execution_id: &str) -> Result<()> {
        self.store
            .update_plan_status(plan_execution_id, Status::Running)
            .await?;
        let paused = self
            .store
            .fetch_node_executions(plan_execution_id)
            .await
            .into_iter()
            .filter(|n| n.status == Status::Paused);
        for node in paused {
            self.resume_paused(&node).await?;
        }
        Ok(())
    }

    /// 恢复一个暂停的节点并重放搁置的动作
    async fn resume_paused(&self, node: &NodeExecution) -> Result<()> {
        let id = node.id.clone();
        match node.parked.clone() {
            Some(ParkedAction::Start) => {
                self.store.update_status(&id, Status::Queued, |n| n.parked = None).await?;
                self.send(EngineCommand::StartNode { node_execution_id: id });
            }
            Some(ParkedAction::Invoke) => {
                self.store.update_status(&id, Status::Queued, |n| n.parked = None).await?;
                self.send(EngineCommand::InvokeNode { node_execution_id: id });
            }
            Some(ParkedAction::Conclude { response }) => {
                self.store.update_status(&id, Status::Running, |n| n.parked = None).await?;
                self.send(EngineCommand::Conclude {
                    node_execution_id: id,
                    response,
                });
            }
            None => {
                self.store.update_status(&id, Status::Running, |_| {}).await?;
            }
        }
        Ok(())
    }

    /// 丢弃当前尝试及其后代，再开始新的尝试
    async fn retry_intervention(&self, id: &str) -> Result<()> {
        let node = self.live_node(id).await?;
        for target in self.subtree(&node, true).await {
            self.terminate_node(&target, Status::Discarded).await?;
        }
        self.send(EngineCommand::RetryNode {
            node_execution_id: id.to_string(),
        });
        Ok(())
    }

    /// IGNORE / MARK_FAILED / MARK_SUCCESS：丢弃后代，目标写入给定状态后交给顾问
    async fn mark_node(&self, id: &str, status: Status) -> Result<()> {
        let node = self.live_node(id).await?;
        for child in self.subtree(&node, false).await {
            self.terminate_node(&child, Status::Discarded).await?;
        }
        self.terminate_node(&node, status).await?;
        self.send(EngineCommand::Advise {
            node_execution_id: id.to_string(),
        });
        Ok(())
    }
}
