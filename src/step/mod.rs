//! 步骤：可执行体
//!
//! 每个步骤类型注册为一种 `Executable` 变体，变体决定它支持的执行方式；
//! 协调者选出的执行方式与变体不符时节点以 FAILED 结束（UnsupportedExecutionMode）。
//! 步骤代码返回 `anyhow::Result`，错误由引擎转换为 FailureInfo。

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::delegate::TaskPackage;
use crate::execution::{Ambiance, ExecutionMode, ResponseData, StepResponse};
use crate::registry::Registry;

pub use builtin::{DelegateTaskStep, FailStep, ForkStep, NoopStep, SectionStep};

/// 调用步骤时的上下文
#[derive(Debug, Clone)]
pub struct StepContext {
    pub ambiance: Ambiance,
    pub plan_execution_id: String,
    pub node_execution_id: String,
    pub identifier: String,
    pub step_parameters: Value,
    /// 协调者透传的数据
    pub pass_through: Value,
}

/// 异步步骤的启动结果
#[derive(Debug, Clone, Default)]
pub struct AsyncExecutableResponse {
    /// 需要等待的关联 ID；为空时立即进入 `handle_async_response`
    pub callback_ids: Vec<String>,
    /// 等待期间节点进入 WAITING（不计 Active 超时）
    pub waiting: bool,
}

/// 子节点描述：指向计划中的节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub child_node_id: String,
}

#[async_trait::async_trait]
pub trait SyncExecutable: Send + Sync {
    async fn execute_sync(&self, ctx: &StepContext) -> anyhow::Result<StepResponse>;
}

#[async_trait::async_trait]
pub trait AsyncExecutable: Send + Sync {
    async fn execute_async(&self, ctx: &StepContext) -> anyhow::Result<AsyncExecutableResponse>;

    async fn handle_async_response(
        &self,
        ctx: &StepContext,
        responses: &HashMap<String, ResponseData>,
    ) -> anyhow::Result<StepResponse>;
}

#[async_trait::async_trait]
pub trait ChildExecutable: Send + Sync {
    async fn obtain_child(&self, ctx: &StepContext) -> anyhow::Result<ChildSpec>;

    async fn handle_child_response(
        &self,
        ctx: &StepContext,
        responses: &HashMap<String, ResponseData>,
    ) -> anyhow::Result<StepResponse>;
}

#[async_trait::async_trait]
pub trait ChildrenExecutable: Send + Sync {
    async fn obtain_children(&self, ctx: &StepContext) -> anyhow::Result<Vec<ChildSpec>>;

    async fn handle_children_response(
        &self,
        ctx: &StepContext,
        responses: &HashMap<String, ResponseData>,
    ) -> anyhow::Result<StepResponse>;
}

#[async_trait::async_trait]
pub trait TaskExecutable: Send + Sync {
    async fn obtain_task(&self, ctx: &StepContext) -> anyhow::Result<TaskPackage>;

    async fn handle_task_result(
        &self,
        ctx: &StepContext,
        responses: &HashMap<String, ResponseData>,
    ) -> anyhow::Result<StepResponse>;
}

/// 已注册的步骤实现
#[derive(Clone)]
pub enum Executable {
    Sync(Arc<dyn SyncExecutable>),
    Async(Arc<dyn AsyncExecutable>),
    Child(Arc<dyn ChildExecutable>),
    Children(Arc<dyn ChildrenExecutable>),
    Task(Arc<dyn TaskExecutable>),
}

impl Executable {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Executable::Sync(_) => ExecutionMode::Sync,
            Executable::Async(_) => ExecutionMode::Async,
            Executable::Child(_) => ExecutionMode::Child,
            Executable::Children(_) => ExecutionMode::Children,
            Executable::Task(_) => ExecutionMode::Task,
        }
    }
}

pub type StepRegistry = Registry<String, Executable>;

/// 内置步骤：NOOP / FAIL / SECTION / FORK / TASK
pub fn default_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    let builtins = [
        ("NOOP", Executable::Sync(Arc::new(NoopStep))),
        ("FAIL", Executable::Sync(Arc::new(FailStep))),
        ("SECTION", Executable::Child(Arc::new(SectionStep))),
        ("FORK", Executable::Children(Arc::new(ForkStep))),
        ("TASK", Executable::Task(Arc::new(DelegateTaskStep))),
    ];
    for (key, executable) in builtins {
        let _ = registry.register(key.to_string(), executable);
    }
    registry
}
