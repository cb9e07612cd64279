//! 优雅关闭
//!
//! 关闭由三类来源触发：Ctrl+C / SIGTERM、主流程结束、致命错误，以最先到达的原因为准。
//! 触发后按顺序执行收尾步骤，每步带时限：
//! - 中止仍在运行的计划（ABORT 中断，发起方 SHUTDOWN）并等待其结束
//! - 取消引擎后台任务（命令循环、中断分发、超时轮询、事件分发）并等待退出

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::OrchestrationEngine;
use crate::interrupts::{InterruptPackage, InterruptType};

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 主流程正常结束
    Completed,
    FatalError(String),
}

/// 关闭信号：取消 token 并记录第一个触发原因
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            token: CancellationToken::new(),
            reason,
        }
    }

    /// 引擎后台任务使用的 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；已触发时保留原来的原因
    pub fn trigger(&self, reason: ShutdownReason) {
        let recorded = self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if recorded {
            tracing::info!("Shutdown triggered: {:?}", reason);
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM，收到后触发关闭；关闭先由别处触发时任务直接退出
    pub fn listen_for_signals(self: &Arc<Self>) -> JoinHandle<()> {
        let signal = Arc::clone(self);
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = signal.token.cancelled() => return,
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => ShutdownReason::UserInitiated,
                    Err(e) => {
                        tracing::warn!("Ctrl+C handler unavailable: {}", e);
                        return;
                    }
                },
                _ = terminate() => ShutdownReason::Signal,
            };
            signal.trigger(reason);
        })
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}

/// 关闭时执行的一个收尾步骤
#[async_trait::async_trait]
pub trait ShutdownStep: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 收尾结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: Vec<&'static str>,
    /// 出错或超时的步骤
    pub failed: Vec<&'static str>,
}

/// 按顺序执行的收尾步骤；某一步失败不影响后续步骤
pub struct ShutdownSequence {
    steps: Vec<Box<dyn ShutdownStep>>,
    step_timeout: Duration,
}

impl ShutdownSequence {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            steps: Vec::new(),
            step_timeout,
        }
    }

    pub fn then<S: ShutdownStep + 'static>(mut self, step: S) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub async fn run(self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        for step in &self.steps {
            let name = step.name();
            match tokio::time::timeout(self.step_timeout, step.run()).await {
                Ok(Ok(())) => {
                    tracing::info!("Shutdown step '{}' done", name);
                    report.completed.push(name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Shutdown step '{}' failed: {:#}", name, e);
                    report.failed.push(name);
                }
                Err(_) => {
                    tracing::warn!("Shutdown step '{}' exceeded {:?}", name, self.step_timeout);
                    report.failed.push(name);
                }
            }
        }
        report
    }
}

/// 中止仍在运行的计划，并等待它们结束
pub struct AbortRunningPlans {
    engine: OrchestrationEngine,
    wait: Duration,
}

impl AbortRunningPlans {
    pub fn new(engine: OrchestrationEngine, wait: Duration) -> Self {
        Self { engine, wait }
    }
}

#[async_trait::async_trait]
impl ShutdownStep for AbortRunningPlans {
    async fn run(&self) -> anyhow::Result<()> {
        let active = self.engine.store().active_plan_executions().await;
        for plan in &active {
            let package = InterruptPackage::for_plan(&plan.id, InterruptType::Abort, "SHUTDOWN");
            if let Err(e) = self.engine.register_interrupt(package).await {
                tracing::warn!(plan_execution_id = %plan.id, "Abort on shutdown rejected: {}", e);
            }
        }
        for plan in &active {
            let ended = self.engine.wait_for_plan(&plan.id, self.wait).await?;
            tracing::info!(plan_execution_id = %plan.id, "Plan is {} at shutdown", ended.status);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "abort-running-plans"
    }
}

/// 取消引擎后台任务并等待其退出
pub struct StopBackgroundTasks {
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl StopBackgroundTasks {
    pub fn new(token: CancellationToken, handles: Vec<JoinHandle<()>>) -> Self {
        Self {
            token,
            handles: Mutex::new(handles),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownStep for StopBackgroundTasks {
    async fn run(&self) -> anyhow::Result<()> {
        self.token.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stop-background-tasks"
    }
}

/// 运行主流程直到它结束或关闭被触发，然后执行收尾步骤
pub async fn run_until_shutdown<F>(
    signal: Arc<ShutdownSignal>,
    app: F,
    sequence: ShutdownSequence,
) -> ShutdownReport
where
    F: Future<Output = ()>,
{
    let listener = signal.listen_for_signals();
    tokio::select! {
        _ = app => signal.trigger(ShutdownReason::Completed),
        _ = signal.triggered() => {}
    }
    listener.abort();
    sequence.run().await
}
