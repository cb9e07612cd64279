//! Ambiance：节点在计划树中的完整路径
//!
//! 不可变的层级列表，每次进入子节点都通过 `with_level` 产生新值。

use serde::{Deserialize, Serialize};

/// 路径中的一层
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    /// 节点执行 ID（运行期）
    pub runtime_id: String,
    /// 计划节点 ID（定义期）
    pub setup_id: String,
    pub identifier: String,
    pub step_type: String,
    /// 分组（如 STAGE / STEP_GROUP），资源约束的持有范围据此定位
    pub group: Option<String>,
}

/// 执行上下文路径，所有进出核心的调用都携带它
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: String,
    levels: Vec<Level>,
}

impl Ambiance {
    pub fn new(plan_execution_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            levels: Vec::new(),
        }
    }

    /// 返回追加一层后的新 Ambiance
    pub fn with_level(&self, level: Level) -> Self {
        let mut levels = self.levels.clone();
        levels.push(level);
        Self {
            plan_execution_id: self.plan_execution_id.clone(),
            levels,
        }
    }

    /// 同级替换：去掉当前层再追加（用于兄弟节点）
    pub fn sibling(&self, level: Level) -> Self {
        let mut levels = self.levels.clone();
        levels.pop();
        levels.push(level);
        Self {
            plan_execution_id: self.plan_execution_id.clone(),
            levels,
        }
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn current_runtime_id(&self) -> Option<&str> {
        self.levels.last().map(|l| l.runtime_id.as_str())
    }

    /// 由近及远查找指定分组所在层
    pub fn nearest_group(&self, group: &str) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.group.as_deref() == Some(group))
    }
}
