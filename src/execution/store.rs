//! 节点 / 计划执行存储（内存版）
//!
//! 所有状态写入都经过状态图校验并递增 version；带版本号的写入在版本不一致时
//! 返回可重试的 `ConcurrentUpdate`。每次成功的状态更新：
//! - 同步通知 NodeStatusObserver（超时引擎据此暂停 / 恢复计时）
//! - 发布 NODE_EXECUTION_STATUS_UPDATE 事件

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{NodeExecution, Outcome, PlanExecution, Status};
use crate::core::{OrchestrationError, Result};
use crate::events::{EventBus, EventType, OrchestrationEvent};
use crate::plan::{Plan, PlanNode};

/// 一次节点状态更新
#[derive(Debug, Clone)]
pub struct NodeStatusUpdate {
    pub node_execution: NodeExecution,
    pub previous_status: Status,
    pub updated_at: i64,
}

/// 节点状态观察者，在写入线程上同步调用
pub trait NodeStatusObserver: Send + Sync {
    fn on_node_status_update(&self, update: &NodeStatusUpdate);
}

/// 执行存储
pub struct ExecutionStore {
    nodes: RwLock<HashMap<String, NodeExecution>>,
    plan_executions: RwLock<HashMap<String, PlanExecution>>,
    /// plan_execution_id -> 计划定义
    plans: RwLock<HashMap<String, Arc<Plan>>>,
    observers: std::sync::RwLock<Vec<Arc<dyn NodeStatusObserver>>>,
    events: Arc<EventBus>,
}

impl ExecutionStore {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            plan_executions: RwLock::new(HashMap::new()),
            plans: RwLock::new(HashMap::new()),
            observers: std::sync::RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn add_observer(&self, observer: Arc<dyn NodeStatusObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }

    // ---------- 计划执行 ----------

    /// 保存计划执行及其计划定义
    pub async fn save_plan_execution(&self, plan_execution: PlanExecution, plan: Arc<Plan>) {
        let id = plan_execution.id.clone();
        self.plans.write().await.insert(id.clone(), plan);
        self.plan_executions.write().await.insert(id, plan_execution);
    }

    pub async fn get_plan_execution(&self, id: &str) -> Result<PlanExecution> {
        self.plan_executions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestrationError::PlanExecutionNotFound(id.to_string()))
    }

    pub async fn plan(&self, plan_execution_id: &str) -> Result<Arc<Plan>> {
        self.plans
            .read()
            .await
            .get(plan_execution_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::PlanExecutionNotFound(plan_execution_id.to_string()))
    }

    pub async fn plan_node(&self, plan_execution_id: &str, node_id: &str) -> Result<PlanNode> {
        let plan = self.plan(plan_execution_id).await?;
        plan.fetch_node(node_id).cloned()
    }

    /// 尚未结束的计划执行
    pub async fn active_plan_executions(&self) -> Vec<PlanExecution> {
        let mut active: Vec<PlanExecution> = self
            .plan_executions
            .read()
            .await
            .values()
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|p| p.start_ts);
        active
    }

    /// 更新计划状态，校验计划状态图
    pub async fn update_plan_status(&self, id: &str, to: Status) -> Result<PlanExecution> {
        let updated = {
            let mut plans = self.plan_executions.write().await;
            let plan = plans
                .get_mut(id)
                .ok_or_else(|| OrchestrationError::PlanExecutionNotFound(id.to_string()))?;
            if !Status::can_plan_transition(plan.status, to) {
                return Err(OrchestrationError::InvalidTransition {
                    id: id.to_string(),
                    from: plan.status,
                    to,
                });
            }
            plan.status = to;
            plan.version += 1;
            if to.is_terminal() {
                plan.end_ts = Some(chrono::Utc::now().timestamp_millis());
            }
            plan.clone()
        };

        tracing::info!(plan_execution_id = %id, "Plan status updated to {}", to);
        self.events.publish(OrchestrationEvent::for_plan(
            EventType::PlanExecutionStatusUpdate,
            id,
            to,
        ));
        Ok(updated)
    }

    // ---------- 节点执行 ----------

    /// 保存新的节点执行；父节点必须处于 RUNNING 或 DISCARDING
    pub async fn save(&self, node: NodeExecution) -> Result<NodeExecution> {
        let mut nodes = self.nodes.write().await;
        if let Some(parent_id) = &node.parent_id {
            let parent = nodes
                .get(parent_id)
                .ok_or_else(|| OrchestrationError::NodeExecutionNotFound(parent_id.clone()))?;
            if !parent.status.is_flowing() {
                return Err(OrchestrationError::InvalidRequest(format!(
                    "parent {} is {}, children can only be created under a running parent",
                    parent_id, parent.status
                )));
            }
        }
        nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    pub async fn get(&self, id: &str) -> Result<NodeExecution> {
        self.nodes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestrationError::NodeExecutionNotFound(id.to_string()))
    }

    /// 状态更新：目标状态的允许起始集合不含当前状态时返回 InvalidTransition
    pub async fn update_status<F>(&self, id: &str, to: Status, ops: F) -> Result<NodeExecution>
    where
        F: FnOnce(&mut NodeExecution),
    {
        self.apply_status(id, None, to, ops).await
    }

    /// 带乐观锁的状态更新
    pub async fn update_status_with_version<F>(
        &self,
        id: &str,
        expected_version: u64,
        to: Status,
        ops: F,
    ) -> Result<NodeExecution>
    where
        F: FnOnce(&mut NodeExecution),
    {
        self.apply_status(id, Some(expected_version), to, ops).await
    }

    async fn apply_status<F>(
        &self,
        id: &str,
        expected_version: Option<u64>,
        to: Status,
        ops: F,
    ) -> Result<NodeExecution>
    where
        F: FnOnce(&mut NodeExecution),
    {
        let now = chrono::Utc::now().timestamp_millis();
        let (updated, previous_status) = {
            let mut nodes = self.nodes.write().await;
            let node = nodes
                .get_mut(id)
                .ok_or_else(|| OrchestrationError::NodeExecutionNotFound(id.to_string()))?;
            if let Some(expected) = expected_version {
                if node.version != expected {
                    return Err(OrchestrationError::ConcurrentUpdate {
                        id: id.to_string(),
                        expected,
                        actual: node.version,
                    });
                }
            }
            if !Status::can_node_transition(node.status, to) {
                return Err(OrchestrationError::InvalidTransition {
                    id: id.to_string(),
                    from: node.status,
                    to,
                });
            }
            let previous_status = node.status;
            node.status = to;
            ops(node);
            node.version += 1;
            if to == Status::Running && node.start_ts.is_none() {
                node.start_ts = Some(now);
            }
            if to.is_terminal() {
                node.end_ts = Some(now);
            }
            (node.clone(), previous_status)
        };

        tracing::debug!(
            node_execution_id = %id,
            "Node status {} -> {}",
            previous_status,
            to
        );

        let update = NodeStatusUpdate {
            node_execution: updated.clone(),
            previous_status,
            updated_at: now,
        };
        let observers: Vec<Arc<dyn NodeStatusObserver>> = self
            .observers
            .read()
            .map(|o| o.clone())
            .unwrap_or_default();
        for observer in observers {
            observer.on_node_status_update(&update);
        }
        self.events.publish(OrchestrationEvent::for_node(
            EventType::NodeExecutionStatusUpdate,
            &updated,
        ));
        Ok(updated)
    }

    /// 非状态字段更新，发布 NODE_EXECUTION_UPDATE
    pub async fn update<F>(&self, id: &str, ops: F) -> Result<NodeExecution>
    where
        F: FnOnce(&mut NodeExecution),
    {
        let updated = {
            let mut nodes = self.nodes.write().await;
            let node = nodes
                .get_mut(id)
                .ok_or_else(|| OrchestrationError::NodeExecutionNotFound(id.to_string()))?;
            ops(node);
            node.version += 1;
            node.clone()
        };
        self.events.publish(OrchestrationEvent::for_node(
            EventType::NodeExecutionUpdate,
            &updated,
        ));
        Ok(updated)
    }

    /// 直接子节点，按创建时间排序
    pub async fn find_children(&self, parent_id: &str) -> Vec<NodeExecution> {
        let nodes = self.nodes.read().await;
        let mut children: Vec<NodeExecution> = nodes
            .values()
            .filter(|n| n.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|n| n.created_at);
        children
    }

    /// 所有后代中状态在给定集合内的节点，深度优先后序（子先于父）
    pub async fn find_all_children_with_status_in(
        &self,
        plan_execution_id: &str,
        parent_id: &str,
        statuses: &[Status],
        include_parent: bool,
    ) -> Vec<NodeExecution> {
        let nodes = self.nodes.read().await;
        let mut by_parent: HashMap<&str, Vec<&NodeExecution>> = HashMap::new();
        for node in nodes.values().filter(|n| n.plan_execution_id == plan_execution_id) {
            if let Some(parent) = node.parent_id.as_deref() {
                by_parent.entry(parent).or_default().push(node);
            }
        }
        for children in by_parent.values_mut() {
            children.sort_by_key(|n| n.created_at);
        }

        let mut result = Vec::new();
        collect_post_order(parent_id, &by_parent, statuses, &mut result);
        if include_parent {
            if let Some(parent) = nodes.get(parent_id) {
                if statuses.contains(&parent.status) {
                    result.push(parent.clone());
                }
            }
        }
        result
    }

    pub async fn fetch_node_executions(&self, plan_execution_id: &str) -> Vec<NodeExecution> {
        let nodes = self.nodes.read().await;
        let mut result: Vec<NodeExecution> = nodes
            .values()
            .filter(|n| n.plan_execution_id == plan_execution_id)
            .cloned()
            .collect();
        result.sort_by_key(|n| n.created_at);
        result
    }

    pub async fn fetch_node_executions_without_old_retries(
        &self,
        plan_execution_id: &str,
    ) -> Vec<NodeExecution> {
        self.fetch_node_executions(plan_execution_id)
            .await
            .into_iter()
            .filter(|n| !n.old_retry)
            .collect()
    }

    /// 根链上的节点（无父节点）
    pub async fn fetch_roots(&self, plan_execution_id: &str) -> Vec<NodeExecution> {
        self.fetch_node_executions(plan_execution_id)
            .await
            .into_iter()
            .filter(|n| n.parent_id.is_none())
            .collect()
    }

    pub async fn mark_retried(&self, id: &str) -> Result<NodeExecution> {
        self.update(id, |n| n.old_retry = true).await
    }

    /// 把指向旧尝试的 previous_id 改为新尝试
    pub async fn update_relationships_for_retry(&self, old_id: &str, new_id: &str) {
        let mut nodes = self.nodes.write().await;
        for node in nodes.values_mut() {
            if node.previous_id.as_deref() == Some(old_id) {
                node.previous_id = Some(new_id.to_string());
                node.version += 1;
            }
        }
    }

    pub async fn append_timeout_instance(&self, id: &str, timeout_instance_id: &str) -> Result<NodeExecution> {
        let timeout_instance_id = timeout_instance_id.to_string();
        self.update(id, move |n| n.timeout_instance_ids.push(timeout_instance_id))
            .await
    }

    /// 摘除节点上的全部超时实例，返回被摘除的 ID
    pub async fn remove_timeout_instances(&self, id: &str) -> Result<Vec<String>> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| OrchestrationError::NodeExecutionNotFound(id.to_string()))?;
        node.version += 1;
        Ok(std::mem::take(&mut node.timeout_instance_ids))
    }

    /// 按 (计划执行, 节点 identifier, 产出名) 查找最新一次非旧重试的产出
    pub async fn resolve_outcome(
        &self,
        plan_execution_id: &str,
        identifier: &str,
        name: &str,
    ) -> Option<Outcome> {
        self.fetch_node_executions_without_old_retries(plan_execution_id)
            .await
            .into_iter()
            .rev()
            .filter(|n| n.identifier == identifier)
            .find_map(|n| n.outcomes.get(name).cloned())
    }
}

fn collect_post_order(
    parent_id: &str,
    by_parent: &HashMap<&str, Vec<&NodeExecution>>,
    statuses: &[Status],
    out: &mut Vec<NodeExecution>,
) {
    if let Some(children) = by_parent.get(parent_id) {
        for child in children {
            collect_post_order(&child.id, by_parent, statuses, out);
            if statuses.contains(&child.status) {
                out.push((*child).clone());
            }
        }
    }
}
