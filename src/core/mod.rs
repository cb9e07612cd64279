//! 核心：错误类型与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{OrchestrationError, RegistryError, Result};
pub use shutdown::{
    run_until_shutdown, AbortRunningPlans, ShutdownReason, ShutdownReport, ShutdownSequence, ShutdownSignal,
    ShutdownStep, StopBackgroundTasks,
};
