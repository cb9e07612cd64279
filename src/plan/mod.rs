//! 计划定义：静态节点图
//!
//! 计划节点只描述「做什么」（step_type + 参数）与「怎么决策」（协调者 / 顾问 / 超时的获取列表），
//! 运行期状态全部落在 NodeExecution 上。

pub mod builder;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adviser::{self, AdviserType};
use crate::core::{OrchestrationError, Result};
use crate::facilitator::FacilitatorType;
use crate::timeout::Dimension;

pub use builder::PlanBuilder;

/// 协调者获取项：按声明顺序尝试
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorObtainment {
    #[serde(rename = "type")]
    pub facilitator_type: FacilitatorType,
    #[serde(default)]
    pub parameters: Value,
}

/// 顾问获取项：按声明顺序尝试，第一个 can_advise 为真者胜出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    #[serde(rename = "type")]
    pub adviser_type: AdviserType,
    #[serde(default)]
    pub parameters: Value,
}

/// 超时获取项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutObtainment {
    pub dimension: Dimension,
    pub timeout_ms: i64,
}

/// 计划中的一个节点（步骤、分支、分段）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub uuid: String,
    pub name: String,
    pub identifier: String,
    pub step_type: String,
    /// 分组标签（STAGE / STEP_GROUP 等）
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub step_parameters: Value,
    #[serde(default)]
    pub facilitator_obtainments: Vec<FacilitatorObtainment>,
    #[serde(default)]
    pub adviser_obtainments: Vec<AdviserObtainment>,
    #[serde(default)]
    pub timeout_obtainments: Vec<TimeoutObtainment>,
}

impl PlanNode {
    pub fn new(
        uuid: impl Into<String>,
        identifier: impl Into<String>,
        step_type: impl Into<String>,
    ) -> Self {
        let identifier = identifier.into();
        Self {
            uuid: uuid.into(),
            name: identifier.clone(),
            identifier,
            step_type: step_type.into(),
            group: None,
            step_parameters: Value::Null,
            facilitator_obtainments: Vec::new(),
            adviser_obtainments: Vec::new(),
            timeout_obtainments: Vec::new(),
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn step_parameters(mut self, parameters: Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    pub fn facilitator(mut self, facilitator_type: FacilitatorType) -> Self {
        self.facilitator_obtainments.push(FacilitatorObtainment {
            facilitator_type,
            parameters: Value::Null,
        });
        self
    }

    pub fn adviser(mut self, adviser_type: AdviserType, parameters: Value) -> Self {
        self.adviser_obtainments.push(AdviserObtainment {
            adviser_type,
            parameters,
        });
        self
    }

    /// 顾问的 next_node_id 以及子节点参数（child_node_id / children_node_ids）引用的节点
    pub fn referenced_node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .adviser_obtainments
            .iter()
            .filter_map(|o| o.parameters.get("next_node_id").and_then(Value::as_str))
            .collect();
        if let Some(child) = self.step_parameters.get("child_node_id").and_then(Value::as_str) {
            ids.push(child);
        }
        if let Some(children) = self.step_parameters.get("children_node_ids").and_then(Value::as_array) {
            ids.extend(children.iter().filter_map(Value::as_str));
        }
        ids
    }

    pub fn timeout(mut self, dimension: Dimension, timeout_ms: i64) -> Self {
        self.timeout_obtainments.push(TimeoutObtainment {
            dimension,
            timeout_ms,
        });
        self
    }
}

/// 一次流水线运行所依据的计划
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub uuid: String,
    pub start_node_id: String,
    pub nodes: HashMap<String, PlanNode>,
}

impl Plan {
    pub fn fetch_starting_node(&self) -> Option<&PlanNode> {
        self.nodes.get(&self.start_node_id)
    }

    pub fn fetch_node(&self, node_id: &str) -> Result<&PlanNode> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| OrchestrationError::PlanNodeNotFound(node_id.to_string()))
    }

    /// 校验节点图：起始节点与所有引用的节点都存在，超时预算为正，内置顾问参数可解析
    pub fn validate(&self) -> Result<()> {
        self.fetch_node(&self.start_node_id)?;
        for node in self.nodes.values() {
            for referenced in node.referenced_node_ids() {
                self.fetch_node(referenced)?;
            }
            for obtainment in &node.adviser_obtainments {
                adviser::check_parameters(&obtainment.adviser_type, &obtainment.parameters)?;
            }
            if let Some(timeout) = node.timeout_obtainments.iter().find(|t| t.timeout_ms <= 0) {
                return Err(OrchestrationError::InvalidRequest(format!(
                    "node {} has a non-positive {} timeout ({} ms)",
                    node.identifier, timeout.dimension, timeout.timeout_ms
                )));
            }
        }
        Ok(())
    }
}
