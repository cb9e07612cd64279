//! 资源约束：具名资源的准入队列
//!
//! 每个约束有固定容量（permits），消费者按 order 排队。
//! - FIFO：队列中已有阻塞者时，新消费者一律阻塞；释放时按顺序放行，遇到放不下的即停止
//! - ASAP：只看剩余容量，释放时跳过放不下的继续尝试
//! - ENSURE 模式下，同一持有范围（同一释放实体）已有活跃消费者时直接放行（重入），不再占用许可；
//!   注册时与重新评估时都按这条规则放行
//!
//! 所有准入判断在同一把锁内完成，这是编排核心中唯一串行化的准入点。

pub mod restraint;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::{OrchestrationError, RegistryError, Result};

pub use restraint::ResourceRestraintStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintStrategy {
    Fifo,
    Asap,
}

/// 具名资源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConstraint {
    pub id: String,
    pub name: String,
    pub capacity: u32,
    pub strategy: ConstraintStrategy,
}

impl ResourceConstraint {
    pub fn new(name: impl Into<String>, capacity: u32, strategy: ConstraintStrategy) -> Self {
        Self {
            id: format!("rc_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            capacity,
            strategy,
        }
    }
}

/// 许可的持有范围：范围结束时释放
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldingScope {
    Plan,
    Stage,
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquireMode {
    /// 同一范围已持有时不重复占用
    Ensure,
    /// 每次都占用新的许可
    Accumulate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumerState {
    Blocked,
    Active,
    Finished,
}

/// 消费者：一次许可申请
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consumer {
    pub id: String,
    pub constraint_id: String,
    pub resource_unit: String,
    pub permits: u32,
    pub state: ConsumerState,
    pub holding_scope: HoldingScope,
    pub release_entity_id: String,
    pub acquire_mode: AcquireMode,
    pub order: u64,
    pub acquired_at: Option<i64>,
}

/// 申请参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerRequest {
    pub resource_unit: String,
    pub permits: u32,
    pub holding_scope: HoldingScope,
    pub release_entity_id: String,
    pub acquire_mode: AcquireMode,
}

/// 当前占用情况
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveScope {
    pub release_entity_id: String,
    pub holding_scope: HoldingScope,
    pub resource_unit: String,
    pub permits: u32,
    pub acquired_at: Option<i64>,
}

#[derive(Default)]
struct ConstraintState {
    constraints: HashMap<String, ResourceConstraint>,
    consumers: HashMap<String, Consumer>,
    next_order: HashMap<String, u64>,
}

impl ConstraintState {
    fn constraint(&self, id: &str) -> Result<&ResourceConstraint> {
        self.constraints
            .get(id)
            .ok_or_else(|| OrchestrationError::ConstraintNotFound(id.to_string()))
    }

    fn used_permits(&self, constraint_id: &str, unit: &str) -> u32 {
        self.consumers
            .values()
            .filter(|c| {
                c.constraint_id == constraint_id
                    && c.resource_unit == unit
                    && c.state == ConsumerState::Active
            })
            .map(|c| c.permits)
            .sum()
    }

    fn queue(&self, constraint_id: &str, unit: &str, state: ConsumerState) -> Vec<Consumer> {
        let mut consumers: Vec<Consumer> = self
            .consumers
            .values()
            .filter(|c| c.constraint_id == constraint_id && c.resource_unit == unit && c.state == state)
            .cloned()
            .collect();
        consumers.sort_by_key(|c| c.order);
        consumers
    }

    /// 同一释放实体在同一范围内是否已有活跃消费者
    fn holds_scope(
        &self,
        constraint_id: &str,
        unit: &str,
        holding_scope: HoldingScope,
        release_entity_id: &str,
    ) -> bool {
        self.consumers.values().any(|c| {
            c.constraint_id == constraint_id
                && c.resource_unit == unit
                && c.state == ConsumerState::Active
                && c.holding_scope == holding_scope
                && c.release_entity_id == release_entity_id
        })
    }

    fn activate(&mut self, consumer_id: &str, permits: u32) -> Option<Consumer> {
        let consumer = self.consumers.get_mut(consumer_id)?;
        consumer.state = ConsumerState::Active;
        consumer.permits = permits;
        consumer.acquired_at = Some(chrono::Utc::now().timestamp_millis());
        Some(consumer.clone())
    }

    /// 重新评估阻塞的消费者，返回被放行的。
    /// ENSURE 消费者的范围已被同一实体持有时以 0 许可放行，FIFO 队头放不下也不影响它。
    fn unblock(&mut self, constraint_id: &str, unit: &str) -> Result<Vec<Consumer>> {
        let constraint = self.constraint(constraint_id)?.clone();
        let mut used = self.used_permits(constraint_id, unit);
        let mut unblocked = Vec::new();
        let mut queue_stopped = false;
        for blocked in self.queue(constraint_id, unit, ConsumerState::Blocked) {
            let reentrant = blocked.acquire_mode == AcquireMode::Ensure
                && self.holds_scope(constraint_id, unit, blocked.holding_scope, &blocked.release_entity_id);
            if reentrant {
                unblocked.extend(self.activate(&blocked.id, 0));
            } else if !queue_stopped && used + blocked.permits <= constraint.capacity {
                used += blocked.permits;
                unblocked.extend(self.activate(&blocked.id, blocked.permits));
            } else if constraint.strategy == ConstraintStrategy::Fifo {
                queue_stopped = true;
            }
        }
        Ok(unblocked)
    }
}

/// 资源约束服务
pub struct ResourceConstraintService {
    state: Mutex<ConstraintState>,
}

impl ResourceConstraintService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConstraintState::default()),
        }
    }

    /// 保存约束；名称重复时拒绝
    pub async fn save_constraint(&self, constraint: ResourceConstraint) -> Result<ResourceConstraint> {
        if constraint.capacity == 0 {
            return Err(OrchestrationError::InvalidPermits {
                requested: 0,
                capacity: 0,
            });
        }
        let mut state = self.state.lock().await;
        if state.constraints.values().any(|c| c.name == constraint.name) {
            return Err(RegistryError::DuplicateRegistry(constraint.name).into());
        }
        tracing::info!("Saved resource constraint {} (capacity {})", constraint.name, constraint.capacity);
        state.constraints.insert(constraint.id.clone(), constraint.clone());
        Ok(constraint)
    }

    pub async fn get_constraint(&self, id: &str) -> Result<ResourceConstraint> {
        self.state.lock().await.constraint(id).cloned()
    }

    pub async fn get_constraint_by_name(&self, name: &str) -> Result<ResourceConstraint> {
        self.state
            .lock()
            .await
            .constraints
            .values()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| OrchestrationError::ConstraintNotFound(name.to_string()))
    }

    /// 注册消费者；返回的 state 为 Active 表示已获得许可
    pub async fn register_consumer(&self, constraint_id: &str, request: ConsumerRequest) -> Result<Consumer> {
        let mut state = self.state.lock().await;
        let constraint = state.constraint(constraint_id)?.clone();
        if request.permits == 0 || request.permits > constraint.capacity {
            return Err(OrchestrationError::InvalidPermits {
                requested: request.permits,
                capacity: constraint.capacity,
            });
        }

        let order = {
            let next = state.next_order.entry(constraint_id.to_string()).or_insert(0);
            *next += 1;
            *next
        };

        let overlapping = request.acquire_mode == AcquireMode::Ensure
            && state.holds_scope(
                constraint_id,
                &request.resource_unit,
                request.holding_scope,
                &request.release_entity_id,
            );

        let used = state.used_permits(constraint_id, &request.resource_unit);
        let has_blocked = !state
            .queue(constraint_id, &request.resource_unit, ConsumerState::Blocked)
            .is_empty();
        let fits = used + request.permits <= constraint.capacity;
        let granted = overlapping
            || match constraint.strategy {
                ConstraintStrategy::Fifo => !has_blocked && fits,
                ConstraintStrategy::Asap => fits,
            };

        let consumer = Consumer {
            id: format!("consumer_{}", uuid::Uuid::new_v4()),
            constraint_id: constraint_id.to_string(),
            resource_unit: request.resource_unit,
            permits: if overlapping { 0 } else { request.permits },
            state: if granted {
                ConsumerState::Active
            } else {
                ConsumerState::Blocked
            },
            holding_scope: request.holding_scope,
            release_entity_id: request.release_entity_id,
            acquire_mode: request.acquire_mode,
            order,
            acquired_at: granted.then(|| chrono::Utc::now().timestamp_millis()),
        };
        tracing::info!(
            consumer_id = %consumer.id,
            "Consumer for {} / {} is {:?}",
            constraint.name,
            consumer.resource_unit,
            consumer.state
        );
        state.consumers.insert(consumer.id.clone(), consumer.clone());
        Ok(consumer)
    }

    pub async fn get_consumer(&self, consumer_id: &str) -> Option<Consumer> {
        self.state.lock().await.consumers.get(consumer_id).cloned()
    }

    /// 消费者结束，返回因此被放行的消费者
    pub async fn consumer_finished(&self, consumer_id: &str) -> Result<Vec<Consumer>> {
        let mut state = self.state.lock().await;
        let (constraint_id, unit) = {
            let consumer = state.consumers.get_mut(consumer_id).ok_or_else(|| {
                OrchestrationError::InvalidRequest(format!("unknown consumer {}", consumer_id))
            })?;
            if consumer.state == ConsumerState::Finished {
                return Ok(Vec::new());
            }
            consumer.state = ConsumerState::Finished;
            (consumer.constraint_id.clone(), consumer.resource_unit.clone())
        };
        state.unblock(&constraint_id, &unit)
    }

    /// 结束某个释放实体（计划 / 阶段 / 步骤）持有或排队的全部消费者
    pub async fn release_entity(&self, release_entity_id: &str) -> Vec<Consumer> {
        let mut state = self.state.lock().await;
        let mut touched: HashSet<(String, String)> = HashSet::new();
        for consumer in state.consumers.values_mut() {
            if consumer.release_entity_id == release_entity_id && consumer.state != ConsumerState::Finished {
                consumer.state = ConsumerState::Finished;
                touched.insert((consumer.constraint_id.clone(), consumer.resource_unit.clone()));
            }
        }
        let mut unblocked = Vec::new();
        for (constraint_id, unit) in touched {
            match state.unblock(&constraint_id, &unit) {
                Ok(mut released) => unblocked.append(&mut released),
                Err(e) => tracing::warn!("Failed to re-evaluate {}: {}", constraint_id, e),
            }
        }
        if !unblocked.is_empty() {
            tracing::info!("Released {}, unblocked {} consumers", release_entity_id, unblocked.len());
        }
        unblocked
    }

    /// 显式重新评估某个资源单元
    pub async fn unblock(&self, constraint_id: &str, unit: &str) -> Result<Vec<Consumer>> {
        self.state.lock().await.unblock(constraint_id, unit)
    }

    /// 当前活跃的占用
    pub async fn usage(&self, constraint_id: &str) -> Result<Vec<ActiveScope>> {
        let state = self.state.lock().await;
        state.constraint(constraint_id)?;
        let mut active: Vec<&Consumer> = state
            .consumers
            .values()
            .filter(|c| c.constraint_id == constraint_id && c.state == ConsumerState::Active)
            .collect();
        active.sort_by_key(|c| c.order);
        Ok(active
            .into_iter()
            .map(|c| ActiveScope {
                release_entity_id: c.release_entity_id.clone(),
                holding_scope: c.holding_scope,
                resource_unit: c.resource_unit.clone(),
                permits: c.permits,
                acquired_at: c.acquired_at,
            })
            .collect())
    }
}

impl Default for ResourceConstraintService {
    fn default() -> Self {
        Self::new()
    }
}
