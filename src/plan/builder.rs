//! 计划构建器
//!
//! 提供流畅的API来构建计划

use std::collections::HashMap;

use serde_json::json;

use crate::adviser::AdviserType;
use crate::core::{OrchestrationError, Result};
use crate::plan::{Plan, PlanNode};

/// 计划构建器
pub struct PlanBuilder {
    uuid: String,
    start_node_id: Option<String>,
    nodes: HashMap<String, PlanNode>,
}

impl PlanBuilder {
    /// 创建新的计划构建器
    pub fn new() -> Self {
        Self {
            uuid: format!("plan_{}", uuid::Uuid::new_v4()),
            start_node_id: None,
            nodes: HashMap::new(),
        }
    }

    /// 添加节点；第一个添加的节点默认为起始节点
    pub fn node(mut self, node: PlanNode) -> Self {
        if self.start_node_id.is_none() {
            self.start_node_id = Some(node.uuid.clone());
        }
        self.nodes.insert(node.uuid.clone(), node);
        self
    }

    /// 显式指定起始节点
    pub fn start(mut self, node_id: impl Into<String>) -> Self {
        self.start_node_id = Some(node_id.into());
        self
    }

    /// 设置顺序依赖：from 成功后进入 to
    pub fn sequential(mut self, from: &str, to: &str) -> Self {
        if let Some(node) = self.nodes.get_mut(from) {
            node.adviser_obtainments.push(crate::plan::AdviserObtainment {
                adviser_type: AdviserType::OnSuccess,
                parameters: json!({ "next_node_id": to }),
            });
        }
        self
    }

    /// 构建计划并校验节点图
    pub fn build(self) -> Result<Plan> {
        let start_node_id = self.start_node_id.ok_or_else(|| {
            OrchestrationError::InvalidRequest("plan has no nodes".to_string())
        })?;
        let plan = Plan {
            uuid: self.uuid,
            start_node_id,
            nodes: self.nodes,
        };
        plan.validate()?;
        Ok(plan)
    }
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}
