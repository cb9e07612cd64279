//! Conductor - 流水线编排引擎
//!
//! 入口：初始化日志与配置，读取计划 JSON 并执行，打印各节点的最终状态后优雅关闭。
//! 用法：`conductor [plan.json] [config.toml]`，计划默认 config/plans/demo.json。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use conductor::config::load_config;
use conductor::constraints::{ConstraintStrategy, ResourceConstraint, ResourceConstraintService};
use conductor::core::{
    run_until_shutdown, AbortRunningPlans, ShutdownReason, ShutdownSequence, ShutdownSignal, StopBackgroundTasks,
};
use conductor::delegate::{ChannelTaskDispatcher, DelegateWorkerPool, TaskFuture, TaskPackage};
use conductor::plan::Plan;
use conductor::{observability, OrchestrationEngine};

const DEFAULT_PLAN: &str = "config/plans/demo.json";

/// 演示用委托执行：回显任务参数
fn run_delegate_task(package: TaskPackage) -> TaskFuture {
    Box::pin(async move {
        let delay = package
            .parameters
            .get("sleep_ms")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if let Some(error) = package.parameters.get("fail").and_then(serde_json::Value::as_str) {
            return Err(error.to_string());
        }
        Ok(serde_json::json!({ "echo": package.parameters }))
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    observability::init();

    let mut args = std::env::args().skip(1);
    let plan_path = PathBuf::from(args.next().unwrap_or_else(|| DEFAULT_PLAN.to_string()));
    let config = load_config(args.next().map(PathBuf::from)).context("Failed to load config")?;

    let raw = std::fs::read_to_string(&plan_path)
        .with_context(|| format!("Failed to read plan {}", plan_path.display()))?;
    let plan: Plan = serde_json::from_str(&raw).context("Invalid plan JSON")?;

    // 演示计划使用的资源约束
    let constraints = Arc::new(ResourceConstraintService::new());
    constraints
        .save_constraint(ResourceConstraint::new("deploy-slot", 1, ConstraintStrategy::Fifo))
        .await
        .context("Failed to create resource constraint")?;

    let (dispatcher, task_rx) = ChannelTaskDispatcher::new();
    let engine = OrchestrationEngine::builder()
        .config(config.clone())
        .constraints(constraints)
        .task_dispatcher(Arc::new(dispatcher))
        .build()
        .context("Failed to build orchestration engine")?;

    let signal = Arc::new(ShutdownSignal::new());
    let token = signal.token();
    let mut handles = engine.start(token.clone());

    let pool = DelegateWorkerPool::new(engine.clone(), config.engine.delegate_workers);
    let pool_token = token.clone();
    handles.push(tokio::spawn(async move {
        pool.start(task_rx, pool_token, run_delegate_task).await;
    }));

    let grace = Duration::from_secs(config.engine.shutdown_grace_secs);
    let sequence = ShutdownSequence::new(grace)
        .then(AbortRunningPlans::new(engine.clone(), grace))
        .then(StopBackgroundTasks::new(token, handles));

    let app_signal = Arc::clone(&signal);
    let report = run_until_shutdown(
        Arc::clone(&signal),
        async move {
            if let Err(e) = run_plan(&engine, plan).await {
                tracing::error!("Plan run failed: {:#}", e);
                app_signal.trigger(ShutdownReason::FatalError(e.to_string()));
            }
        },
        sequence,
    )
    .await;

    if !report.failed.is_empty() {
        tracing::warn!("Shutdown steps failed: {:?}", report.failed);
    }
    if let Some(ShutdownReason::FatalError(message)) = signal.reason() {
        anyhow::bail!(message);
    }
    Ok(())
}

async fn run_plan(engine: &OrchestrationEngine, plan: Plan) -> anyhow::Result<()> {
    let metadata = HashMap::from([("project".to_string(), "demo".to_string())]);
    let plan_execution = engine.start_plan(plan, metadata).await?;
    let ended = engine
        .wait_for_plan(&plan_execution.id, Duration::from_secs(300))
        .await?;

    println!("Plan {} finished as {}", ended.id, ended.status);
    for node in engine.store().fetch_node_executions(&ended.id).await {
        let retried = if node.old_retry { " (retried)" } else { "" };
        println!("  {:<16} {:<12} {}{}", node.identifier, node.step_type, node.status, retried);
    }
    Ok(())
}
