//! 节点执行与计划执行记录
//!
//! NodeExecution 是一个计划节点的一次运行（重试会产生新的记录，旧记录标记 old_retry）。
//! 所有可变字段只通过 ExecutionStore 修改，version 在每次写入时递增。

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Ambiance, Status};

/// 协调者选定的执行方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Child,
    Children,
    Task,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionMode::Sync => "SYNC",
            ExecutionMode::Async => "ASYNC",
            ExecutionMode::Child => "CHILD",
            ExecutionMode::Children => "CHILDREN",
            ExecutionMode::Task => "TASK",
        };
        f.write_str(s)
    }
}

/// 失败信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub error_message: String,
    pub failure_types: Vec<String>,
}

impl FailureInfo {
    pub fn new(error_message: impl Into<String>, failure_type: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            failure_types: vec![failure_type.into()],
        }
    }
}

/// 子节点在分叉结果中的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildOutcome {
    pub node_execution_id: String,
    pub status: Status,
}

/// 步骤产出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// 任意结构化输出
    Output { data: Value },
    /// 分叉汇总，按子节点 identifier 排序
    Fork { children: BTreeMap<String, ChildOutcome> },
}

/// 步骤完成时上报的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcomes: HashMap<String, Outcome>,
}

impl StepResponse {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            failure_info: None,
            outcomes: HashMap::new(),
        }
    }

    pub fn succeeded() -> Self {
        Self::new(Status::Succeeded)
    }

    pub fn failed(error_message: impl Into<String>, failure_type: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            failure_info: Some(FailureInfo::new(error_message, failure_type)),
            outcomes: HashMap::new(),
        }
    }

    pub fn with_outcome(mut self, name: impl Into<String>, outcome: Outcome) -> Self {
        self.outcomes.insert(name.into(), outcome);
        self
    }
}

/// 异步回调携带的数据，按关联 ID 归集后交给步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseData {
    /// 子节点链结束
    NodeStatus {
        /// 结束子链的节点
        node_execution_id: String,
        /// 子链头（被派生的子节点）的 identifier
        identifier: String,
        status: Status,
    },
    /// 委托任务结果
    TaskResult {
        status: Status,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        error: Option<String>,
    },
    /// 资源约束放行
    ConstraintGranted { consumer_id: String },
    /// 外部系统的任意回调
    Custom { data: Value },
}

/// 被暂停期间搁置的动作，恢复时重放
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParkedAction {
    /// 启动前被暂停
    Start,
    /// 初始等待结束时处于暂停
    Invoke,
    /// 完成信号到达时处于暂停
    Conclude { response: StepResponse },
}

/// 节点执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub plan_execution_id: String,
    /// 计划节点（模板）ID
    pub plan_node_id: String,
    pub identifier: String,
    pub step_type: String,
    pub status: Status,
    pub mode: Option<ExecutionMode>,
    /// 协调者透传给步骤的数据
    #[serde(default)]
    pub pass_through: Value,
    pub ambiance: Ambiance,
    pub parent_id: Option<String>,
    /// 链结束时需要通知的节点（子链 → 父节点）
    pub notify_id: Option<String>,
    pub previous_id: Option<String>,
    pub next_id: Option<String>,
    /// 之前的重试尝试，按时间顺序
    pub retry_ids: Vec<String>,
    pub old_retry: bool,
    pub timeout_instance_ids: Vec<String>,
    pub failure_info: Option<FailureInfo>,
    pub outcomes: HashMap<String, Outcome>,
    pub parked: Option<ParkedAction>,
    /// 委托任务 ID（TASK 模式）
    pub task_id: Option<String>,
    pub start_ts: Option<i64>,
    pub end_ts: Option<i64>,
    pub created_at: i64,
    pub version: u64,
}

impl NodeExecution {
    pub fn new(
        plan_execution_id: impl Into<String>,
        plan_node_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: impl Into<String>,
        ambiance: Ambiance,
    ) -> Self {
        Self {
            id: format!("node_exec_{}", uuid::Uuid::new_v4()),
            plan_execution_id: plan_execution_id.into(),
            plan_node_id: plan_node_id.into(),
            identifier: identifier.into(),
            step_type: step_type.into(),
            status: Status::Queued,
            mode: None,
            pass_through: Value::Null,
            ambiance,
            parent_id: None,
            notify_id: None,
            previous_id: None,
            next_id: None,
            retry_ids: Vec::new(),
            old_retry: false,
            timeout_instance_ids: Vec::new(),
            failure_info: None,
            outcomes: HashMap::new(),
            parked: None,
            task_id: None,
            start_ts: None,
            end_ts: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            version: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_notify(mut self, notify_id: impl Into<String>) -> Self {
        self.notify_id = Some(notify_id.into());
        self
    }

    pub fn with_previous(mut self, previous_id: impl Into<String>) -> Self {
        self.previous_id = Some(previous_id.into());
        self
    }

    pub fn with_retry_ids(mut self, retry_ids: Vec<String>) -> Self {
        self.retry_ids = retry_ids;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 计划执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: String,
    pub plan_id: String,
    pub status: Status,
    /// account / org / project 等归属信息
    pub metadata: HashMap<String, String>,
    pub start_ts: i64,
    pub end_ts: Option<i64>,
    pub version: u64,
}

impl PlanExecution {
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            id: format!("plan_exec_{}", uuid::Uuid::new_v4()),
            plan_id: plan_id.into(),
            status: Status::Running,
            metadata: HashMap::new(),
            start_ts: chrono::Utc::now().timestamp_millis(),
            end_ts: None,
            version: 0,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_response_serde_tags() {
        let response = StepResponse::succeeded().with_outcome(
            "output",
            Outcome::Output {
                data: serde_json::json!({"k": "v"}),
            },
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "SUCCEEDED");
        assert_eq!(json["outcomes"]["output"]["kind"], "OUTPUT");
    }

    #[test]
    fn test_response_data_tagged() {
        let data: ResponseData = serde_json::from_value(serde_json::json!({
            "kind": "TASK_RESULT",
            "status": "FAILED",
            "error": "exit 1"
        }))
        .unwrap();
        assert_eq!(
            data,
            ResponseData::TaskResult {
                status: Status::Failed,
                data: Value::Null,
                error: Some("exit 1".to_string()),
            }
        );
    }

    #[test]
    fn test_new_node_is_queued() {
        let node = NodeExecution::new("p1", "a", "a", "NOOP", Ambiance::new("p1"));
        assert_eq!(node.status, Status::Queued);
        assert!(node.id.starts_with("node_exec_"));
        assert_eq!(node.version, 0);
    }
}
