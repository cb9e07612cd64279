//! 委托执行
//!
//! TASK 模式的步骤把 TaskPackage 交给 TaskDispatcher，得到任务 ID 作为关联 ID；
//! 委托端执行完毕后通过 `OrchestrationEngine::notify` 回报 ResponseData::TaskResult。
//! 内置实现：ChannelTaskDispatcher 把任务放进通道，DelegateWorkerPool 限流执行。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::{OrchestrationError, Result};
use crate::engine::OrchestrationEngine;
use crate::execution::{ResponseData, Status};

/// 交给委托端的任务包
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPackage {
    pub plan_execution_id: String,
    pub node_execution_id: String,
    pub parameters: Value,
    /// 执行该任务所需的能力（委托端选择依据）
    pub capabilities: Vec<String>,
    pub timeout_ms: Option<u64>,
}

/// 任务分发
#[async_trait::async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// 提交任务，返回任务 ID（即回调关联 ID）
    async fn dispatch(&self, package: TaskPackage) -> Result<String>;
}

/// 已分发的任务
#[derive(Debug, Clone)]
pub struct DelegateTask {
    pub task_id: String,
    pub package: TaskPackage,
}

/// 基于通道的分发器
pub struct ChannelTaskDispatcher {
    tx: mpsc::UnboundedSender<DelegateTask>,
}

impl ChannelTaskDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DelegateTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl TaskDispatcher for ChannelTaskDispatcher {
    async fn dispatch(&self, package: TaskPackage) -> Result<String> {
        let task_id = format!("task_{}", uuid::Uuid::new_v4());
        tracing::info!(
            node_execution_id = %package.node_execution_id,
            "Dispatching delegate task {}",
            task_id
        );
        self.tx
            .send(DelegateTask {
                task_id: task_id.clone(),
                package,
            })
            .map_err(|_| OrchestrationError::TaskDispatchFailed("delegate channel closed".to_string()))?;
        Ok(task_id)
    }
}

pub type TaskFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, String>> + Send>>;

/// 委托端执行器：信号量限制并发，结果回报给引擎
pub struct DelegateWorkerPool {
    engine: OrchestrationEngine,
    max_concurrent: usize,
}

impl DelegateWorkerPool {
    pub fn new(engine: OrchestrationEngine, max_concurrent: usize) -> Self {
        Self {
            engine,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// 启动执行器，直到通道关闭或收到关闭信号
    pub async fn start(
        self,
        mut task_rx: mpsc::UnboundedReceiver<DelegateTask>,
        token: CancellationToken,
        process_fn: impl Fn(TaskPackage) -> TaskFuture + Send + Sync + 'static,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let process_fn = Arc::new(process_fn);

        loop {
            let task = tokio::select! {
                _ = token.cancelled() => break,
                task = task_rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let engine = self.engine.clone();
            let process_fn = Arc::clone(&process_fn);

            tokio::spawn(async move {
                let _permit = permit;
                let DelegateTask { task_id, package } = task;
                let timeout = package.timeout_ms.map(Duration::from_millis);
                let run = process_fn(package);

                let outcome = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, run).await {
                        Ok(result) => result,
                        Err(_) => Err(format!("delegate task timed out after {:?}", limit)),
                    },
                    None => run.await,
                };

                let data = match outcome {
                    Ok(data) => ResponseData::TaskResult {
                        status: Status::Succeeded,
                        data,
                        error: None,
                    },
                    Err(error) => {
                        tracing::warn!("Delegate task {} failed: {}", task_id, error);
                        ResponseData::TaskResult {
                            status: Status::Failed,
                            data: Value::Null,
                            error: Some(error),
                        }
                    }
                };
                engine.notify(&task_id, data);
            });
        }
        tracing::debug!("Delegate worker pool stopped");
    }
}
