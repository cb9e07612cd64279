//! 执行模型：状态图、Ambiance、节点 / 计划执行记录与存储

pub mod ambiance;
pub mod node;
pub mod status;
pub mod store;

pub use ambiance::{Ambiance, Level};
pub use node::{
    ChildOutcome, ExecutionMode, FailureInfo, NodeExecution, Outcome, ParkedAction,
    PlanExecution, ResponseData, StepResponse,
};
pub use status::Status;
pub use store::{ExecutionStore, NodeStatusObserver, NodeStatusUpdate};
