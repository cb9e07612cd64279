//! 编排引擎
//!
//! 控制循环：协调 → 执行 → 等待完成 → 顾问决策 → 转移。
//! 所有重入（完成信号、恢复、重试、顾问）都以 `EngineCommand` 形式进入同一条通道，
//! 由命令循环在信号量限制下并发处理；节点状态的线性化依赖存储层的版本检查。
//!
//! 后台任务：命令循环、中断分发、超时轮询、事件分发，均随 CancellationToken 停止。

mod executor;
mod intervention;
pub mod wait;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::adviser::{self, Adviser, AdviserRegistry, AdviserType};
use crate::config::AppConfig;
use crate::constraints::{ResourceConstraintService, ResourceRestraintStep};
use crate::core::{OrchestrationError, Result};
use crate::delegate::TaskDispatcher;
use crate::events::{EventBus, EventHandler, EventType, OrchestrationEvent};
use crate::execution::{Ambiance, ExecutionStore, PlanExecution, ResponseData, StepResponse};
use crate::facilitator::{self, Facilitator, FacilitatorRegistry, FacilitatorType};
use crate::interrupts::{Interrupt, InterruptManager, InterruptPackage, InterruptProcessor, InterruptType};
use crate::plan::Plan;
use crate::step::{self, Executable, StepRegistry};
use crate::timeout::{TimeoutCallback, TimeoutEngine};

pub use wait::{CompletedWait, WaitNotifyEngine};

/// 内置资源约束步骤的类型名
pub const RESOURCE_RESTRAINT: &str = "RESOURCE_RESTRAINT";

/// 引擎内部命令
#[derive(Debug, Clone)]
pub(crate) enum EngineCommand {
    StartNode { node_execution_id: String },
    InvokeNode { node_execution_id: String },
    Resume {
        node_execution_id: String,
        responses: HashMap<String, ResponseData>,
    },
    Conclude {
        node_execution_id: String,
        response: StepResponse,
    },
    Advise { node_execution_id: String },
    RetryNode { node_execution_id: String },
}

impl EngineCommand {
    fn node_execution_id(&self) -> &str {
        match self {
            EngineCommand::StartNode { node_execution_id }
            | EngineCommand::InvokeNode { node_execution_id }
            | EngineCommand::Resume { node_execution_id, .. }
            | EngineCommand::Conclude { node_execution_id, .. }
            | EngineCommand::Advise { node_execution_id }
            | EngineCommand::RetryNode { node_execution_id } => node_execution_id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            EngineCommand::StartNode { .. } => "start",
            EngineCommand::InvokeNode { .. } => "invoke",
            EngineCommand::Resume { .. } => "resume",
            EngineCommand::Conclude { .. } => "conclude",
            EngineCommand::Advise { .. } => "advise",
            EngineCommand::RetryNode { .. } => "retry",
        }
    }
}

/// 引擎共享状态
pub struct EngineCore {
    pub(crate) config: AppConfig,
    pub(crate) events: Arc<EventBus>,
    pub(crate) store: Arc<ExecutionStore>,
    pub(crate) steps: StepRegistry,
    pub(crate) facilitators: FacilitatorRegistry,
    pub(crate) advisers: AdviserRegistry,
    pub(crate) timeouts: Arc<TimeoutEngine>,
    pub(crate) interrupts: Arc<InterruptManager>,
    pub(crate) constraints: Arc<ResourceConstraintService>,
    pub(crate) waits: WaitNotifyEngine,
    pub(crate) dispatcher: Option<Arc<dyn TaskDispatcher>>,
    commands: mpsc::UnboundedSender<EngineCommand>,
    command_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<EngineCommand>>>,
    plan_done: Notify,
    started: AtomicBool,
}

impl EngineCore {
    pub(crate) fn send(&self, command: EngineCommand) {
        if self.commands.send(command).is_err() {
            tracing::warn!("Engine command loop stopped, command dropped");
        }
    }

    /// 延迟发送命令（初始等待、重试间隔）
    pub(crate) fn send_after(&self, delay: Duration, command: EngineCommand) {
        if delay.is_zero() {
            self.send(command);
            return;
        }
        let tx = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(command);
        });
    }

    /// 回复一个关联 ID，等待完成时恢复对应节点
    pub(crate) fn notify(&self, correlation_id: &str, data: ResponseData) {
        if let Some(done) = self.waits.done_with(correlation_id, data) {
            self.send(EngineCommand::Resume {
                node_execution_id: done.node_execution_id,
                responses: done.responses,
            });
        }
    }

    async fn fire_expired_timeouts(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        for instance in self.timeouts.poll_expired(now) {
            let TimeoutCallback::NodeExpiry {
                plan_execution_id,
                node_execution_id,
            } = instance.callback;
            let still_attached = match self.store.get(&node_execution_id).await {
                Ok(node) => !node.is_terminal() && node.timeout_instance_ids.contains(&instance.id),
                Err(_) => false,
            };
            if !still_attached {
                tracing::debug!(timeout_id = %instance.id, "Stale timeout ignored");
                continue;
            }
            tracing::warn!(
                node_execution_id = %node_execution_id,
                "Timeout {} ({}) expired",
                instance.id,
                instance.dimension
            );
            let package = InterruptPackage::for_node(
                plan_execution_id,
                node_execution_id,
                InterruptType::MarkExpired,
                "TIMEOUT_ENGINE",
            );
            if let Err(e) = self.interrupts.register(package).await {
                tracing::warn!("Failed to register expiry interrupt: {}", e);
            }
        }
    }
}

/// 编排引擎句柄（可克隆）
#[derive(Clone)]
pub struct OrchestrationEngine {
    core: Arc<EngineCore>,
}

impl OrchestrationEngine {
    pub fn builder() -> OrchestrationEngineBuilder {
        OrchestrationEngineBuilder::new()
    }

    pub fn store(&self) -> &Arc<ExecutionStore> {
        &self.core.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.core.events
    }

    pub fn interrupts(&self) -> &Arc<InterruptManager> {
        &self.core.interrupts
    }

    pub fn constraints(&self) -> &Arc<ResourceConstraintService> {
        &self.core.constraints
    }

    pub fn timeouts(&self) -> &Arc<TimeoutEngine> {
        &self.core.timeouts
    }

    /// 启动后台任务；重复调用返回空列表
    pub fn start(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        if self.core.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Orchestration engine already started");
            return Vec::new();
        }
        let mut handles = Vec::new();
        if let Some(handle) = self.core.events.start(token.clone()) {
            handles.push(handle);
        }
        let processor: Arc<dyn InterruptProcessor> = self.core.clone();
        if let Some(handle) = self.core.interrupts.start(processor, token.clone()) {
            handles.push(handle);
        }
        if let Some(handle) = self.spawn_command_loop(token.clone()) {
            handles.push(handle);
        }
        handles.push(self.spawn_timeout_poller(token));
        tracing::info!("Orchestration engine started");
        handles
    }

    fn spawn_command_loop(&self, token: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self.core.command_rx.lock().ok()?.take()?;
        let core = Arc::clone(&self.core);
        let permits = Arc::new(Semaphore::new(core.config.engine.max_concurrent_nodes.max(1)));

        Some(tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    _ = token.cancelled() => break,
                    command = rx.recv() => match command {
                        Some(command) => command,
                        None => break,
                    },
                };
                let permit = match Arc::clone(&permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let core = Arc::clone(&core);
                let span = tracing::info_span!(
                    "node",
                    node_execution_id = %command.node_execution_id(),
                    command = command.name()
                );
                tokio::spawn(
                    async move {
                        let _permit = permit;
                        core.handle_command(command).await;
                    }
                    .instrument(span),
                );
            }
            tracing::debug!("Engine command loop stopped");
        }))
    }

    fn spawn_timeout_poller(&self, token: CancellationToken) -> JoinHandle<()> {
        let core = Arc::clone(&self.core);
        let interval = Duration::from_millis(core.config.timeouts.poll_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => core.fire_expired_timeouts().await,
                }
            }
            tracing::debug!("Timeout poller stopped");
        })
    }

    /// 开始执行计划：校验节点图后创建计划执行与起始节点
    pub async fn start_plan(&self, plan: Plan, metadata: HashMap<String, String>) -> Result<PlanExecution> {
        plan.validate()?;
        let plan = Arc::new(plan);
        let start_node = plan
            .fetch_starting_node()
            .cloned()
            .ok_or_else(|| OrchestrationError::PlanNodeNotFound(plan.start_node_id.clone()))?;

        let mut plan_execution = PlanExecution::new(plan.uuid.clone());
        plan_execution.metadata = metadata;
        let plan_execution_id = plan_execution.id.clone();
        self.core
            .store
            .save_plan_execution(plan_execution.clone(), Arc::clone(&plan))
            .await;
        tracing::info!(plan_execution_id = %plan_execution_id, "Starting plan {}", plan.uuid);
        self.core.events.publish(OrchestrationEvent::for_plan(
            EventType::OrchestrationStart,
            &plan_execution_id,
            plan_execution.status,
        ));

        let node = executor::new_node_execution(
            &start_node,
            &Ambiance::new(&plan_execution_id),
            executor::Placement::Child,
        );
        let node = self.core.store.save(node).await?;
        self.core.send(EngineCommand::StartNode {
            node_execution_id: node.id,
        });
        Ok(plan_execution)
    }

    /// 异步回调入口：委托任务、资源放行、外部系统
    pub fn notify(&self, correlation_id: &str, data: ResponseData) {
        self.core.notify(correlation_id, data);
    }

    pub async fn register_interrupt(&self, package: InterruptPackage) -> Result<Interrupt> {
        self.core.interrupts.register(package).await
    }

    /// 等待计划结束；超时后返回当时的计划执行记录
    pub async fn wait_for_plan(&self, plan_execution_id: &str, timeout: Duration) -> Result<PlanExecution> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.core.plan_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let plan = self.core.store.get_plan_execution(plan_execution_id).await?;
            if plan.status.is_terminal() {
                return Ok(plan);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.core.store.get_plan_execution(plan_execution_id).await;
            }
        }
    }
}

/// 引擎构建器
pub struct OrchestrationEngineBuilder {
    config: AppConfig,
    steps: Vec<(String, Executable)>,
    facilitators: Vec<(FacilitatorType, Arc<dyn Facilitator>)>,
    advisers: Vec<(AdviserType, Arc<dyn Adviser>)>,
    handlers: Vec<(EventType, Arc<dyn EventHandler>)>,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    constraints: Option<Arc<ResourceConstraintService>>,
}

impl OrchestrationEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            steps: Vec::new(),
            facilitators: Vec::new(),
            advisers: Vec::new(),
            handlers: Vec::new(),
            dispatcher: None,
            constraints: None,
        }
    }

    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// 注册自定义步骤；与内置类型重名时 build 失败
    pub fn step(mut self, step_type: impl Into<String>, executable: Executable) -> Self {
        self.steps.push((step_type.into(), executable));
        self
    }

    pub fn facilitator(mut self, key: FacilitatorType, facilitator: Arc<dyn Facilitator>) -> Self {
        self.facilitators.push((key, facilitator));
        self
    }

    pub fn adviser(mut self, key: AdviserType, adviser: Arc<dyn Adviser>) -> Self {
        self.advisers.push((key, adviser));
        self
    }

    pub fn event_handler(mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push((event_type, handler));
        self
    }

    pub fn task_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// 共享一个外部创建的资源约束服务
    pub fn constraints(mut self, constraints: Arc<ResourceConstraintService>) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn build(self) -> Result<OrchestrationEngine> {
        let config = self.config;
        let events = Arc::new(EventBus::new(
            config.events.channel_capacity,
            Duration::from_secs(config.events.handler_timeout_secs),
        ));
        for (event_type, handler) in self.handlers {
            events.register(event_type, handler);
        }

        let store = Arc::new(ExecutionStore::new(Arc::clone(&events)));
        let timeouts = Arc::new(TimeoutEngine::new());
        store.add_observer(timeouts.clone());
        let interrupts = Arc::new(InterruptManager::new(Arc::clone(&store), config.interrupts.workers));
        let constraints = self
            .constraints
            .unwrap_or_else(|| Arc::new(ResourceConstraintService::new()));

        let mut steps = step::default_registry();
        steps.register(
            RESOURCE_RESTRAINT.to_string(),
            Executable::Async(Arc::new(ResourceRestraintStep::new(Arc::clone(&constraints)))),
        )?;
        for (key, executable) in self.steps {
            steps.register(key, executable)?;
        }

        let mut facilitators = facilitator::default_registry();
        for (key, value) in self.facilitators {
            facilitators.register(key, value)?;
        }

        let mut advisers = adviser::default_registry(config.engine.default_retry_wait_ms);
        for (key, value) in self.advisers {
            advisers.register(key, value)?;
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        tracing::debug!(
            "Engine built with {} step types, {} facilitators, {} advisers",
            steps.len(),
            facilitators.len(),
            advisers.len()
        );

        Ok(OrchestrationEngine {
            core: Arc::new(EngineCore {
                config,
                events,
                store,
                steps,
                facilitators,
                advisers,
                timeouts,
                interrupts,
                constraints,
                waits: WaitNotifyEngine::new(),
                dispatcher: self.dispatcher,
                commands,
                command_rx: std::sync::Mutex::new(Some(command_rx)),
                plan_done: Notify::new(),
                started: AtomicBool::new(false),
            }),
        })
    }
}

impl Default for OrchestrationEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
