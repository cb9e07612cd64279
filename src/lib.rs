//! Conductor - 流水线编排引擎
//!
//! 模块划分：
//! - **adviser**: 顾问协议（节点结束后决定下一步）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **constraints**: 资源约束（FIFO 准入、持有范围、重入）
//! - **core**: 错误类型与优雅关闭
//! - **delegate**: 委托任务分发与执行器
//! - **engine**: 编排控制循环、等待/通知、中断处理
//! - **events**: 编排事件发布与分发
//! - **execution**: 状态图、Ambiance、节点 / 计划执行存储
//! - **facilitator**: 协调者协议（决定执行方式）
//! - **interrupts**: 中断注册与按计划串行的处理
//! - **plan**: 计划定义与构建器
//! - **step**: 步骤可执行体与内置步骤
//! - **timeout**: 超时引擎与可暂停的追踪器

pub mod adviser;
pub mod config;
pub mod constraints;
pub mod core;
pub mod delegate;
pub mod engine;
pub mod events;
pub mod execution;
pub mod facilitator;
pub mod interrupts;
pub mod observability;
pub mod plan;
pub mod registry;
pub mod step;
pub mod timeout;

pub use engine::{OrchestrationEngine, OrchestrationEngineBuilder};
pub use execution::Status;
pub use plan::{Plan, PlanBuilder, PlanNode};
