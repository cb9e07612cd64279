//! 中断管理器
//!
//! 注册的中断进入队列，由分发循环按计划分道：每个计划同时只有一个中断在处理，
//! 排队中的中断按优先级、再按到达顺序取出；严格更高优先级的中断（ABORT 对 PAUSE）
//! 可以越过正在处理的中断。整体并发由信号量限制在 `workers` 个。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use super::{Interrupt, InterruptPackage, InterruptState};
use crate::core::{OrchestrationError, Result};
use crate::execution::ExecutionStore;

/// 中断的实际执行者（编排引擎实现）
#[async_trait::async_trait]
pub trait InterruptProcessor: Send + Sync {
    async fn process(&self, interrupt: &Interrupt) -> Result<()>;
}

pub struct InterruptManager {
    store: Arc<ExecutionStore>,
    interrupts: RwLock<HashMap<String, Interrupt>>,
    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    workers: usize,
}

impl InterruptManager {
    pub fn new(store: Arc<ExecutionStore>, workers: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            store,
            interrupts: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: std::sync::Mutex::new(Some(queue_rx)),
            workers: workers.max(1),
        }
    }

    /// 注册中断：目标必须存在且未结束，否则返回 InvalidRequest 且不创建中断
    pub async fn register(&self, package: InterruptPackage) -> Result<Interrupt> {
        let plan = self
            .store
            .get_plan_execution(&package.plan_execution_id)
            .await
            .map_err(|_| {
                OrchestrationError::InvalidRequest(format!(
                    "plan execution {} does not exist",
                    package.plan_execution_id
                ))
            })?;
        if plan.status.is_terminal() {
            return Err(OrchestrationError::InvalidRequest(format!(
                "plan execution {} is already {}",
                plan.id, plan.status
            )));
        }

        match &package.node_execution_id {
            None if !package.interrupt_type.allows_plan_level() => {
                return Err(OrchestrationError::InvalidRequest(format!(
                    "{} requires a node execution",
                    package.interrupt_type
                )));
            }
            None => {}
            Some(node_id) => {
                let node = self.store.get(node_id).await.map_err(|_| {
                    OrchestrationError::InvalidRequest(format!("node execution {} does not exist", node_id))
                })?;
                if node.plan_execution_id != package.plan_execution_id {
                    return Err(OrchestrationError::InvalidRequest(format!(
                        "node execution {} does not belong to plan {}",
                        node_id, package.plan_execution_id
                    )));
                }
                if node.status.is_terminal() {
                    return Err(OrchestrationError::InvalidRequest(format!(
                        "node execution {} is already {}",
                        node_id, node.status
                    )));
                }
            }
        }

        let interrupt = Interrupt::from_package(package);
        self.interrupts
            .write()
            .await
            .insert(interrupt.id.clone(), interrupt.clone());
        tracing::info!(
            interrupt_id = %interrupt.id,
            plan_execution_id = %interrupt.plan_execution_id,
            "Registered {} interrupt",
            interrupt.interrupt_type
        );
        if self.queue_tx.send(interrupt.id.clone()).is_err() {
            tracing::warn!("Interrupt dispatcher is not running");
        }
        Ok(interrupt)
    }

    pub async fn get(&self, id: &str) -> Option<Interrupt> {
        self.interrupts.read().await.get(id).cloned()
    }

    pub async fn list(&self, plan_execution_id: &str) -> Vec<Interrupt> {
        let mut interrupts: Vec<Interrupt> = self
            .interrupts
            .read()
            .await
            .values()
            .filter(|i| i.plan_execution_id == plan_execution_id)
            .cloned()
            .collect();
        interrupts.sort_by_key(|i| i.created_at);
        interrupts
    }

    async fn transition(&self, id: &str, to: InterruptState, reason: Option<String>) -> Result<Interrupt> {
        let mut interrupts = self.interrupts.write().await;
        let interrupt = interrupts
            .get_mut(id)
            .ok_or_else(|| OrchestrationError::InvalidRequest(format!("unknown interrupt {}", id)))?;
        if !interrupt.state.can_transition_to(to) {
            return Err(OrchestrationError::InvalidRequest(format!(
                "interrupt {} cannot move from {:?} to {:?}",
                id, interrupt.state, to
            )));
        }
        interrupt.state = to;
        interrupt.failure_reason = reason;
        interrupt.last_updated_at = chrono::Utc::now().timestamp_millis();
        interrupt.version += 1;
        Ok(interrupt.clone())
    }

    /// 计划结束后丢弃尚未处理的中断
    pub async fn discard_registered(&self, plan_execution_id: &str) -> usize {
        let mut interrupts = self.interrupts.write().await;
        let mut count = 0;
        for interrupt in interrupts.values_mut() {
            if interrupt.plan_execution_id == plan_execution_id
                && interrupt.state == InterruptState::Registered
            {
                interrupt.state = InterruptState::Discarded;
                interrupt.last_updated_at = chrono::Utc::now().timestamp_millis();
                interrupt.version += 1;
                count += 1;
            }
        }
        if count > 0 {
            tracing::info!(plan_execution_id = %plan_execution_id, "Discarded {} pending interrupts", count);
        }
        count
    }

    async fn process_one(&self, id: &str, processor: &dyn InterruptProcessor) {
        let interrupt = match self.transition(id, InterruptState::Processing, None).await {
            Ok(interrupt) => interrupt,
            Err(_) => {
                tracing::debug!(interrupt_id = %id, "Interrupt no longer registered, skipped");
                return;
            }
        };

        let result = processor.process(&interrupt).await;
        let (state, reason) = match result {
            Ok(()) => {
                tracing::info!(interrupt_id = %id, "{} interrupt processed", interrupt.interrupt_type);
                (InterruptState::ProcessedSuccessfully, None)
            }
            Err(e) => {
                tracing::warn!(interrupt_id = %id, "{} interrupt failed: {}", interrupt.interrupt_type, e);
                (InterruptState::ProcessedUnsuccessfully, Some(e.to_string()))
            }
        };
        if let Err(e) = self.transition(id, state, reason).await {
            tracing::error!(interrupt_id = %id, "Failed to record interrupt result: {}", e);
        }
    }

    /// 启动分发循环，只能启动一次
    pub fn start(
        self: &Arc<Self>,
        processor: Arc<dyn InterruptProcessor>,
        token: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let mut queue_rx = self.queue_rx.lock().ok()?.take()?;
        let manager = Arc::clone(self);

        Some(tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(manager.workers));
            let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(String, u8)>();
            let mut lanes: HashMap<String, Lane> = HashMap::new();
            let mut seq: u64 = 0;

            loop {
                let plan_execution_id = tokio::select! {
                    _ = token.cancelled() => break,
                    Some(id) = queue_rx.recv() => {
                        let Some(interrupt) = manager.get(&id).await else { continue };
                        seq += 1;
                        lanes.entry(interrupt.plan_execution_id.clone()).or_default().pending.push(Pending {
                            id,
                            priority: interrupt.interrupt_type.priority(),
                            seq,
                        });
                        interrupt.plan_execution_id
                    }
                    Some((plan_execution_id, priority)) = done_rx.recv() => {
                        if let Some(lane) = lanes.get_mut(&plan_execution_id) {
                            lane.finish(priority);
                        }
                        plan_execution_id
                    }
                };

                let Some(lane) = lanes.get_mut(&plan_execution_id) else { continue };
                while let Some(next) = lane.next_launchable() {
                    let manager = Arc::clone(&manager);
                    let processor = Arc::clone(&processor);
                    let semaphore = Arc::clone(&semaphore);
                    let done_tx = done_tx.clone();
                    let plan_id = plan_execution_id.clone();
                    tokio::spawn(async move {
                        if let Ok(_permit) = semaphore.acquire_owned().await {
                            manager.process_one(&next.id, processor.as_ref()).await;
                        }
                        let _ = done_tx.send((plan_id, next.priority));
                    });
                }
                if lane.is_idle() {
                    lanes.remove(&plan_execution_id);
                }
            }
            tracing::debug!("Interrupt dispatcher stopped");
        }))
    }
}

struct Pending {
    id: String,
    priority: u8,
    seq: u64,
}

#[derive(Default)]
struct Lane {
    pending: Vec<Pending>,
    /// 正在处理的中断优先级
    in_flight: Vec<u8>,
}

impl Lane {
    fn next_launchable(&mut self) -> Option<Pending> {
        let (index, best) = self
            .pending
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))?;
        let launchable = match self.in_flight.iter().max() {
            None => true,
            Some(&ceiling) => best.priority > ceiling,
        };
        if !launchable {
            return None;
        }
        let next = self.pending.remove(index);
        self.in_flight.push(next.priority);
        Some(next)
    }

    fn finish(&mut self, priority: u8) {
        if let Some(pos) = self.in_flight.iter().position(|p| *p == priority) {
            self.in_flight.remove(pos);
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }
}
