//! 编排引擎集成测试：通过公开 API 驱动完整计划

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conductor::adviser::{Adviser, AdviserResponse, AdviserType, AdvisingEvent};
use conductor::config::AppConfig;
use conductor::constraints::{ConstraintStrategy, ResourceConstraint, ResourceConstraintService};
use conductor::core::OrchestrationError;
use conductor::delegate::{ChannelTaskDispatcher, DelegateWorkerPool, TaskFuture, TaskPackage};
use conductor::engine::RESOURCE_RESTRAINT;
use conductor::events::{EventHandler, EventType, OrchestrationEvent};
use conductor::execution::{NodeExecution, Outcome, ParkedAction, ResponseData, StepResponse};
use conductor::facilitator::FacilitatorType;
use conductor::interrupts::{InterruptPackage, InterruptState, InterruptType};
use conductor::step::{AsyncExecutable, AsyncExecutableResponse, Executable, StepContext};
use conductor::timeout::Dimension;
use conductor::{OrchestrationEngine, OrchestrationEngineBuilder, Plan, PlanBuilder, PlanNode, Status};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// 等待外部回调的异步步骤；参数 `key` 为关联 ID，缺省时用节点执行 ID
struct GateStep;

#[async_trait::async_trait]
impl AsyncExecutable for GateStep {
    async fn execute_async(&self, ctx: &StepContext) -> anyhow::Result<AsyncExecutableResponse> {
        let key = ctx
            .step_parameters
            .get("key")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| ctx.node_execution_id.clone());
        Ok(AsyncExecutableResponse {
            callback_ids: vec![key],
            waiting: true,
        })
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext,
        _responses: &HashMap<String, ResponseData>,
    ) -> anyhow::Result<StepResponse> {
        Ok(StepResponse::succeeded())
    }
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.timeouts.poll_interval_ms = 20;
    config
}

fn builder() -> OrchestrationEngineBuilder {
    OrchestrationEngine::builder()
        .config(test_config())
        .step("GATE", Executable::Async(Arc::new(GateStep)))
}

fn start(engine: &OrchestrationEngine) -> CancellationToken {
    let token = CancellationToken::new();
    engine.start(token.clone());
    token
}

fn sync_node(id: &str, step_type: &str) -> PlanNode {
    PlanNode::new(id, id, step_type).facilitator(FacilitatorType::Sync)
}

fn gate_node(id: &str, key: Option<&str>) -> PlanNode {
    let params = match key {
        Some(key) => json!({ "key": key }),
        None => Value::Null,
    };
    PlanNode::new(id, id, "GATE")
        .facilitator(FacilitatorType::Async)
        .step_parameters(params)
}

async fn run(engine: &OrchestrationEngine, plan: Plan) -> String {
    engine.start_plan(plan, HashMap::new()).await.unwrap().id
}

async fn current_nodes(engine: &OrchestrationEngine, plan_execution_id: &str) -> Vec<NodeExecution> {
    engine
        .store()
        .fetch_node_executions_without_old_retries(plan_execution_id)
        .await
}

/// 轮询直到某个 identifier 的最新执行处于给定状态
async fn wait_for_node(
    engine: &OrchestrationEngine,
    plan_execution_id: &str,
    identifier: &str,
    status: Status,
) -> NodeExecution {
    for _ in 0..500 {
        let found = current_nodes(engine, plan_execution_id)
            .await
            .into_iter()
            .find(|n| n.identifier == identifier && n.status == status);
        if let Some(node) = found {
            return node;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("node {identifier} never reached {status}");
}

async fn wait_for_plan_status(engine: &OrchestrationEngine, plan_execution_id: &str, status: Status) {
    for _ in 0..500 {
        let plan = engine.store().get_plan_execution(plan_execution_id).await.unwrap();
        if plan.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("plan never reached {status}");
}

async fn finish(engine: &OrchestrationEngine, plan_execution_id: &str) -> Status {
    engine
        .wait_for_plan(plan_execution_id, Duration::from_secs(5))
        .await
        .unwrap()
        .status
}

fn status_of(nodes: &[NodeExecution], identifier: &str) -> Status {
    nodes
        .iter()
        .find(|n| n.identifier == identifier)
        .map(|n| n.status)
        .unwrap_or_else(|| panic!("no execution for {identifier}"))
}

#[tokio::test]
async fn test_linear_plan_succeeds() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new()
        .node(sync_node("a", "NOOP").step_parameters(json!({ "output": { "commit": "abc" } })))
        .node(sync_node("b", "NOOP"))
        .node(sync_node("c", "NOOP"))
        .sequential("a", "b")
        .sequential("b", "c")
        .build()
        .unwrap();
    let id = run(&engine, plan).await;

    assert_eq!(finish(&engine, &id).await, Status::Succeeded);
    let nodes = current_nodes(&engine, &id).await;
    assert_eq!(nodes.len(), 3);
    assert!(nodes.iter().all(|n| n.status == Status::Succeeded));

    let a = nodes.iter().find(|n| n.identifier == "a").unwrap();
    let b = nodes.iter().find(|n| n.identifier == "b").unwrap();
    assert_eq!(a.next_id.as_deref(), Some(b.id.as_str()));
    assert_eq!(b.previous_id.as_deref(), Some(a.id.as_str()));

    let outcome = engine.store().resolve_outcome(&id, "a", "output").await;
    assert_eq!(outcome, Some(Outcome::Output { data: json!({ "commit": "abc" }) }));
    token.cancel();
}

#[tokio::test]
async fn test_failed_node_ends_plan_through_on_abort() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new()
        .node(sync_node("a", "NOOP"))
        .node(sync_node("b", "FAIL").adviser(AdviserType::OnAbort, json!({ "statuses": ["FAILED"] })))
        .node(sync_node("c", "NOOP"))
        .sequential("a", "b")
        .sequential("b", "c")
        .build()
        .unwrap();
    let id = run(&engine, plan).await;

    assert_eq!(finish(&engine, &id).await, Status::Failed);
    let nodes = current_nodes(&engine, &id).await;
    assert_eq!(status_of(&nodes, "a"), Status::Succeeded);
    assert_eq!(status_of(&nodes, "b"), Status::Failed);
    assert!(nodes.iter().all(|n| n.identifier != "c"));
    token.cancel();
}

#[tokio::test]
async fn test_retry_creates_new_attempts_then_hands_over() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new()
        .node(
            sync_node("flaky", "FAIL")
                .adviser(AdviserType::Retry, json!({ "retry_count": 2 }))
                .adviser(AdviserType::OnFail, json!({ "next_node_id": "cleanup" })),
        )
        .node(sync_node("cleanup", "NOOP"))
        .build()
        .unwrap();
    let id = run(&engine, plan).await;

    assert_eq!(finish(&engine, &id).await, Status::Succeeded);
    let all = engine.store().fetch_node_executions(&id).await;
    let attempts: Vec<&NodeExecution> = all.iter().filter(|n| n.identifier == "flaky").collect();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|n| n.status == Status::Failed));
    assert_eq!(attempts.iter().filter(|n| n.old_retry).count(), 2);

    let latest = attempts.iter().find(|n| !n.old_retry).unwrap();
    assert_eq!(latest.retry_ids.len(), 2);
    assert_eq!(status_of(&all, "cleanup"), Status::Succeeded);
    token.cancel();
}

#[tokio::test]
async fn test_fork_collects_children_by_identifier() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new()
        .node(
            PlanNode::new("fork", "fork", "FORK")
                .facilitator(FacilitatorType::Children)
                .step_parameters(json!({ "children_node_ids": ["b", "a"] })),
        )
        .node(sync_node("a", "NOOP"))
        .node(sync_node("b", "NOOP"))
        .start("fork")
        .build()
        .unwrap();
    let id = run(&engine, plan).await;

    assert_eq!(finish(&engine, &id).await, Status::Succeeded);
    let nodes = current_nodes(&engine, &id).await;
    let fork = nodes.iter().find(|n| n.identifier == "fork").unwrap();
    assert_eq!(fork.status, Status::Succeeded);
    for child in nodes.iter().filter(|n| n.identifier != "fork") {
        assert_eq!(child.parent_id.as_deref(), Some(fork.id.as_str()));
    }

    match engine.store().resolve_outcome(&id, "fork", "fork").await {
        Some(Outcome::Fork { children }) => {
            let keys: Vec<&str> = children.keys().map(String::as_str).collect();
            assert_eq!(keys, vec!["a", "b"]);
            assert!(children.values().all(|c| c.status == Status::Succeeded));
        }
        other => panic!("unexpected fork outcome {other:?}"),
    }
    token.cancel();
}

fn fork_node(children: &[&str]) -> PlanNode {
    PlanNode::new("fork", "fork", "FORK")
        .facilitator(FacilitatorType::Children)
        .step_parameters(json!({ "children_node_ids": children }))
}

async fn fork_children(engine: &OrchestrationEngine, plan_execution_id: &str) -> Vec<(String, Status, String)> {
    match engine.store().resolve_outcome(plan_execution_id, "fork", "fork").await {
        Some(Outcome::Fork { children }) => children
            .into_iter()
            .map(|(key, child)| (key, child.status, child.node_execution_id))
            .collect(),
        other => panic!("unexpected fork outcome {other:?}"),
    }
}

#[tokio::test]
async fn test_fork_fails_when_one_child_fails() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new()
        .node(fork_node(&["z_ok", "z_bad"]))
        .node(PlanNode::new("z_ok", "z", "NOOP").facilitator(FacilitatorType::Sync))
        .node(PlanNode::new("z_bad", "z", "FAIL").facilitator(FacilitatorType::Sync))
        .start("fork")
        .build()
        .unwrap();
    let id = run(&engine, plan).await;

    assert_eq!(finish(&engine, &id).await, Status::Failed);
    let nodes = current_nodes(&engine, &id).await;
    assert_eq!(status_of(&nodes, "fork"), Status::Failed);

    let children = fork_children(&engine, &id).await;
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|(key, _, _)| key.starts_with("z#")));
    let mut statuses: Vec<Status> = children.iter().map(|(_, status, _)| *status).collect();
    statuses.sort_by_key(|s| s.to_string());
    assert_eq!(statuses, vec![Status::Failed, Status::Succeeded]);
    token.cancel();
}

#[tokio::test]
async fn test_fork_outcome_keyed_by_forked_child() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new()
        .node(fork_node(&["x"]))
        .node(sync_node("x", "NOOP"))
        .node(sync_node("y", "NOOP"))
        .sequential("x", "y")
        .start("fork")
        .build()
        .unwrap();
    let id = run(&engine, plan).await;

    assert_eq!(finish(&engine, &id).await, Status::Succeeded);
    let nodes = current_nodes(&engine, &id).await;
    let y = nodes.iter().find(|n| n.identifier == "y").unwrap();

    let children = fork_children(&engine, &id).await;
    assert_eq!(children, vec![("x".to_string(), Status::Succeeded, y.id.clone())]);
    token.cancel();
}

#[tokio::test]
async fn test_plan_with_dangling_reference_is_rejected() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let a = sync_node("a", "NOOP").adviser(AdviserType::OnSuccess, json!({ "next_node_id": "missing" }));
    let plan = Plan {
        uuid: "dangling".to_string(),
        start_node_id: "a".to_string(),
        nodes: [("a".to_string(), a)].into_iter().collect(),
    };
    let result = engine.start_plan(plan, HashMap::new()).await;
    assert!(matches!(result, Err(OrchestrationError::PlanNodeNotFound(id)) if id == "missing"));
    assert!(engine.store().active_plan_executions().await.is_empty());
    token.cancel();
}

/// 成功后跳到参数 `target` 指定的节点，不做存在性检查
struct JumpAdviser;

impl Adviser for JumpAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        event.to_status.is_positive()
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> conductor::core::Result<AdviserResponse> {
        let target = event
            .adviser_parameters
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(AdviserResponse::NextStep {
            next_node_id: target.to_string(),
        })
    }
}

#[tokio::test]
async fn test_unknown_next_node_at_runtime_fails_plan() {
    let jump = AdviserType::Custom("JUMP".to_string());
    let engine = builder().adviser(jump.clone(), Arc::new(JumpAdviser)).build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new()
        .node(sync_node("a", "NOOP").adviser(jump, json!({ "target": "nowhere" })))
        .build()
        .unwrap();
    let id = run(&engine, plan).await;

    assert_eq!(finish(&engine, &id).await, Status::Failed);
    let node = current_nodes(&engine, &id).await.remove(0);
    let info = node.failure_info.expect("failure recorded on the node");
    assert!(info.error_message.contains("nowhere"));
    assert_eq!(info.failure_types, vec!["CONFIGURATION".to_string()]);
    token.cancel();
}

/// 查询时总是出错的顾问
struct BrokenAdviser;

impl Adviser for BrokenAdviser {
    fn can_advise(&self, _event: &AdvisingEvent) -> bool {
        true
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> conductor::core::Result<AdviserResponse> {
        Err(OrchestrationError::NoAdviserFound(event.node_execution_id.clone()))
    }
}

#[tokio::test]
async fn test_adviser_error_recorded_on_node() {
    let broken = AdviserType::Custom("BROKEN".to_string());
    let engine = builder().adviser(broken.clone(), Arc::new(BrokenAdviser)).build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new()
        .node(sync_node("a", "NOOP").adviser(broken, Value::Null))
        .build()
        .unwrap();
    let id = run(&engine, plan).await;

    assert_eq!(finish(&engine, &id).await, Status::Failed);
    let node = current_nodes(&engine, &id).await.remove(0);
    assert_eq!(node.status, Status::Succeeded);
    let info = node.failure_info.expect("adviser error recorded");
    assert!(info.error_message.contains("No adviser found"));
    token.cancel();
}

#[tokio::test]
async fn test_section_takes_child_chain_status() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new()
        .node(
            PlanNode::new("stage", "stage", "SECTION")
                .group("STAGE")
                .facilitator(FacilitatorType::Child)
                .step_parameters(json!({ "child_node_id": "first" })),
        )
        .node(sync_node("first", "NOOP"))
        .node(sync_node("second", "FAIL"))
        .sequential("first", "second")
        .start("stage")
        .build()
        .unwrap();
    let id = run(&engine, plan).await;

    assert_eq!(finish(&engine, &id).await, Status::Failed);
    let nodes = current_nodes(&engine, &id).await;
    assert_eq!(status_of(&nodes, "first"), Status::Succeeded);
    assert_eq!(status_of(&nodes, "second"), Status::Failed);
    assert_eq!(status_of(&nodes, "stage"), Status::Failed);
    token.cancel();
}

#[tokio::test]
async fn test_plan_abort_cascades_to_running_children() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new()
        .node(
            PlanNode::new("fork", "fork", "FORK")
                .facilitator(FacilitatorType::Children)
                .step_parameters(json!({ "children_node_ids": ["left", "right"] })),
        )
        .node(gate_node("left", None))
        .node(gate_node("right", None))
        .start("fork")
        .build()
        .unwrap();
    let id = run(&engine, plan).await;
    wait_for_node(&engine, &id, "left", Status::Waiting).await;
    wait_for_node(&engine, &id, "right", Status::Waiting).await;

    engine
        .register_interrupt(InterruptPackage::for_plan(&id, InterruptType::Abort, "tester"))
        .await
        .unwrap();

    assert_eq!(finish(&engine, &id).await, Status::Aborted);
    let nodes = current_nodes(&engine, &id).await;
    assert_eq!(nodes.len(), 3);
    assert!(nodes.iter().all(|n| n.status == Status::Aborted));
    token.cancel();
}

#[tokio::test]
async fn test_pause_parks_completion_until_resume() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new()
        .node(gate_node("gate", Some("approval")))
        .node(sync_node("after", "NOOP"))
        .sequential("gate", "after")
        .build()
        .unwrap();
    let id = run(&engine, plan).await;
    wait_for_node(&engine, &id, "gate", Status::Waiting).await;

    engine
        .register_interrupt(InterruptPackage::for_plan(&id, InterruptType::Pause, "tester"))
        .await
        .unwrap();
    wait_for_plan_status(&engine, &id, Status::Paused).await;
    wait_for_node(&engine, &id, "gate", Status::Paused).await;

    // 暂停期间到达的回调只被搁置
    engine.notify("approval", ResponseData::Custom { data: json!({ "approved": true }) });
    let mut parked = None;
    for _ in 0..200 {
        let gate = current_nodes(&engine, &id).await.into_iter().find(|n| n.identifier == "gate").unwrap();
        assert_eq!(gate.status, Status::Paused);
        if gate.parked.is_some() {
            parked = gate.parked;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(matches!(parked, Some(ParkedAction::Conclude { .. })));
    let nodes = current_nodes(&engine, &id).await;
    assert!(nodes.iter().all(|n| n.identifier != "after"));

    engine
        .register_interrupt(InterruptPackage::for_plan(&id, InterruptType::Resume, "tester"))
        .await
        .unwrap();

    assert_eq!(finish(&engine, &id).await, Status::Succeeded);
    let nodes = current_nodes(&engine, &id).await;
    assert_eq!(status_of(&nodes, "gate"), Status::Succeeded);
    assert_eq!(status_of(&nodes, "after"), Status::Succeeded);
    token.cancel();
}

#[tokio::test]
async fn test_absolute_timeout_expires_node() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new()
        .node(gate_node("slow", None).timeout(Dimension::Absolute, 50))
        .build()
        .unwrap();
    let id = run(&engine, plan).await;

    assert_eq!(finish(&engine, &id).await, Status::Expired);
    let nodes = current_nodes(&engine, &id).await;
    assert_eq!(status_of(&nodes, "slow"), Status::Expired);
    assert!(nodes[0].timeout_instance_ids.is_empty());

    let interrupts = engine.interrupts().list(&id).await;
    let expiry = interrupts
        .iter()
        .find(|i| i.interrupt_type == InterruptType::MarkExpired)
        .unwrap();
    assert_eq!(expiry.issued_by.issuer, "TIMEOUT_ENGINE");
    token.cancel();
}

#[tokio::test]
async fn test_mark_success_interrupt_moves_plan_forward() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new()
        .node(gate_node("manual", None))
        .node(sync_node("after", "NOOP"))
        .sequential("manual", "after")
        .build()
        .unwrap();
    let id = run(&engine, plan).await;
    let manual = wait_for_node(&engine, &id, "manual", Status::Waiting).await;

    let interrupt = engine
        .register_interrupt(InterruptPackage::for_node(
            &id,
            &manual.id,
            InterruptType::MarkSuccess,
            "tester",
        ))
        .await
        .unwrap();

    assert_eq!(finish(&engine, &id).await, Status::Succeeded);
    let nodes = current_nodes(&engine, &id).await;
    assert_eq!(status_of(&nodes, "manual"), Status::Succeeded);
    assert_eq!(status_of(&nodes, "after"), Status::Succeeded);

    for _ in 0..200 {
        let state = engine.interrupts().get(&interrupt.id).await.unwrap().state;
        if state.is_final() {
            assert_eq!(state, InterruptState::ProcessedSuccessfully);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    token.cancel();
}

#[tokio::test]
async fn test_resource_constraint_serializes_plans() {
    let constraints = Arc::new(ResourceConstraintService::new());
    let slot = constraints
        .save_constraint(ResourceConstraint::new("slot", 1, ConstraintStrategy::Fifo))
        .await
        .unwrap();
    let engine = builder().constraints(Arc::clone(&constraints)).build().unwrap();
    let token = start(&engine);

    let plan_for = |key: &str| {
        PlanBuilder::new()
            .node(
                PlanNode::new("lock", "lock", RESOURCE_RESTRAINT)
                    .facilitator(FacilitatorType::Async)
                    .step_parameters(json!({ "resource_name": "slot" })),
            )
            .node(gate_node("work", Some(key)))
            .sequential("lock", "work")
            .build()
            .unwrap()
    };

    let first = run(&engine, plan_for("first-done")).await;
    wait_for_node(&engine, &first, "work", Status::Waiting).await;

    let second = run(&engine, plan_for("second-done")).await;
    wait_for_node(&engine, &second, "lock", Status::Waiting).await;
    let usage = constraints.usage(&slot.id).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].release_entity_id, first);

    engine.notify("first-done", ResponseData::Custom { data: Value::Null });
    assert_eq!(finish(&engine, &first).await, Status::Succeeded);

    wait_for_node(&engine, &second, "work", Status::Waiting).await;
    let usage = constraints.usage(&slot.id).await.unwrap();
    assert_eq!(usage[0].release_entity_id, second);

    engine.notify("second-done", ResponseData::Custom { data: Value::Null });
    assert_eq!(finish(&engine, &second).await, Status::Succeeded);
    assert!(constraints.usage(&slot.id).await.unwrap().is_empty());
    token.cancel();
}

#[tokio::test]
async fn test_ensure_locks_of_one_plan_granted_together() {
    let constraints = Arc::new(ResourceConstraintService::new());
    constraints
        .save_constraint(ResourceConstraint::new("slot", 1, ConstraintStrategy::Fifo))
        .await
        .unwrap();
    let engine = builder().constraints(Arc::clone(&constraints)).build().unwrap();
    let token = start(&engine);

    let lock = |uuid: &str| {
        PlanNode::new(uuid, uuid, RESOURCE_RESTRAINT)
            .facilitator(FacilitatorType::Async)
            .step_parameters(json!({ "resource_name": "slot", "acquire_mode": "ENSURE" }))
    };
    let holder = PlanBuilder::new()
        .node(lock("lock"))
        .node(gate_node("work", Some("holder-done")))
        .sequential("lock", "work")
        .build()
        .unwrap();
    let holder = run(&engine, holder).await;
    wait_for_node(&engine, &holder, "work", Status::Waiting).await;

    let queued = PlanBuilder::new()
        .node(fork_node(&["lock_a", "lock_b"]))
        .node(lock("lock_a"))
        .node(lock("lock_b"))
        .start("fork")
        .build()
        .unwrap();
    let queued = run(&engine, queued).await;
    wait_for_node(&engine, &queued, "lock_a", Status::Waiting).await;
    wait_for_node(&engine, &queued, "lock_b", Status::Waiting).await;

    engine.notify("holder-done", ResponseData::Custom { data: Value::Null });
    assert_eq!(finish(&engine, &holder).await, Status::Succeeded);
    assert_eq!(finish(&engine, &queued).await, Status::Succeeded);
    let nodes = current_nodes(&engine, &queued).await;
    assert_eq!(status_of(&nodes, "lock_a"), Status::Succeeded);
    assert_eq!(status_of(&nodes, "lock_b"), Status::Succeeded);
    token.cancel();
}

fn echo_task(package: TaskPackage) -> TaskFuture {
    Box::pin(async move {
        if package.parameters.get("fail").is_some() {
            return Err("boom".to_string());
        }
        Ok(json!({ "ran": package.parameters }))
    })
}

#[tokio::test]
async fn test_delegate_task_reports_back() {
    let (dispatcher, task_rx) = ChannelTaskDispatcher::new();
    let engine = builder().task_dispatcher(Arc::new(dispatcher)).build().unwrap();
    let token = start(&engine);
    let pool = DelegateWorkerPool::new(engine.clone(), 2);
    let pool_token = token.clone();
    tokio::spawn(async move { pool.start(task_rx, pool_token, echo_task).await });

    let plan = PlanBuilder::new()
        .node(
            PlanNode::new("build", "build", "TASK")
                .facilitator(FacilitatorType::Task)
                .step_parameters(json!({ "parameters": { "script": "make" } })),
        )
        .node(
            PlanNode::new("broken", "broken", "TASK")
                .facilitator(FacilitatorType::Task)
                .step_parameters(json!({ "parameters": { "fail": true } })),
        )
        .sequential("build", "broken")
        .build()
        .unwrap();
    let id = run(&engine, plan).await;

    assert_eq!(finish(&engine, &id).await, Status::Failed);
    let nodes = current_nodes(&engine, &id).await;
    let build = nodes.iter().find(|n| n.identifier == "build").unwrap();
    assert_eq!(build.status, Status::Succeeded);
    assert!(build.task_id.is_some());
    assert_eq!(
        build.outcomes.get("output"),
        Some(&Outcome::Output { data: json!({ "ran": { "script": "make" } }) })
    );
    let broken = nodes.iter().find(|n| n.identifier == "broken").unwrap();
    assert_eq!(broken.status, Status::Failed);
    assert_eq!(broken.failure_info.as_ref().unwrap().error_message, "boom");
    token.cancel();
}

struct CountingHandler {
    count: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, _event: &OrchestrationEvent) -> anyhow::Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct BrokenHandler;

#[async_trait::async_trait]
impl EventHandler for BrokenHandler {
    async fn handle(&self, _event: &OrchestrationEvent) -> anyhow::Result<()> {
        anyhow::bail!("handler failure")
    }
}

#[tokio::test]
async fn test_event_handlers_see_plan_end_despite_failing_peer() {
    let ends = Arc::new(AtomicUsize::new(0));
    let engine = builder()
        .event_handler(EventType::OrchestrationEnd, Arc::new(BrokenHandler))
        .event_handler(
            EventType::OrchestrationEnd,
            Arc::new(CountingHandler { count: Arc::clone(&ends) }),
        )
        .build()
        .unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new().node(sync_node("only", "NOOP")).build().unwrap();
    let id = run(&engine, plan).await;
    assert_eq!(finish(&engine, &id).await, Status::Succeeded);

    for _ in 0..200 {
        if ends.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ends.load(Ordering::SeqCst), 1);
    token.cancel();
}

#[tokio::test]
async fn test_terminal_nodes_reject_further_updates() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new().node(sync_node("only", "NOOP")).build().unwrap();
    let id = run(&engine, plan).await;
    assert_eq!(finish(&engine, &id).await, Status::Succeeded);

    let node = current_nodes(&engine, &id).await.remove(0);
    let result = engine.store().update_status(&node.id, Status::Running, |_| {}).await;
    assert!(result.is_err());
    assert_eq!(engine.store().get(&node.id).await.unwrap().status, Status::Succeeded);

    // 计划已结束，不再接受中断
    let rejected = engine
        .register_interrupt(InterruptPackage::for_plan(&id, InterruptType::Abort, "tester"))
        .await;
    assert!(rejected.is_err());
    token.cancel();
}

#[tokio::test]
async fn test_missing_facilitator_fails_node() {
    let engine = builder().build().unwrap();
    let token = start(&engine);

    let plan = PlanBuilder::new().node(PlanNode::new("bare", "bare", "NOOP")).build().unwrap();
    let id = run(&engine, plan).await;

    assert_eq!(finish(&engine, &id).await, Status::Failed);
    let node = current_nodes(&engine, &id).await.remove(0);
    assert_eq!(node.status, Status::Failed);
    assert!(node.failure_info.is_some());
    token.cancel();
}
