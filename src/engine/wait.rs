//! 等待 / 通知
//!
//! 节点在等待子节点、委托任务或资源放行时按关联 ID 注册一个等待；
//! 所有关联 ID 都收到回复后等待完成，引擎据此恢复节点。
//! 先到的回复会被暂存（数量有上限），重复的回复被忽略。
//! 计划结束后 `release_plan` 清掉该计划留下的全部记录。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::execution::ResponseData;

/// 已完成的等待
#[derive(Debug, Clone)]
pub struct CompletedWait {
    pub node_execution_id: String,
    pub responses: HashMap<String, ResponseData>,
}

/// 暂存的提前回复上限，超出时丢弃最早的
pub const MAX_EARLY_RESPONSES: usize = 1024;

struct Wait {
    plan_execution_id: String,
    node_execution_id: String,
    correlation_ids: Vec<String>,
    responses: HashMap<String, ResponseData>,
}

#[derive(Default)]
struct WaitState {
    waits: HashMap<String, Wait>,
    by_correlation: HashMap<String, String>,
    /// 早于等待注册到达的回复
    early: HashMap<String, ResponseData>,
    early_order: VecDeque<String>,
    /// 已被消费的关联 ID -> 所属计划
    answered: HashMap<String, String>,
}

impl WaitState {
    fn buffer_early(&mut self, correlation_id: &str, data: ResponseData) {
        if self.early.contains_key(correlation_id) {
            return;
        }
        while self.early_order.len() >= MAX_EARLY_RESPONSES {
            if let Some(oldest) = self.early_order.pop_front() {
                tracing::warn!("Early response for {} dropped, buffer full", oldest);
                self.early.remove(&oldest);
            }
        }
        self.early.insert(correlation_id.to_string(), data);
        self.early_order.push_back(correlation_id.to_string());
    }

    fn take_early(&mut self, correlation_id: &str) -> Option<ResponseData> {
        let data = self.early.remove(correlation_id)?;
        self.early_order.retain(|id| id != correlation_id);
        Some(data)
    }
}

#[derive(Default)]
pub struct WaitNotifyEngine {
    state: Mutex<WaitState>,
}

impl WaitNotifyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为节点注册等待；若回复已全部提前到达，直接返回完成的等待
    pub fn wait_for_all(
        &self,
        plan_execution_id: &str,
        node_execution_id: &str,
        correlation_ids: Vec<String>,
    ) -> Option<CompletedWait> {
        let mut state = self.state.lock().ok()?;
        let wait_id = format!("wait_{}", uuid::Uuid::new_v4());
        let mut wait = Wait {
            plan_execution_id: plan_execution_id.to_string(),
            node_execution_id: node_execution_id.to_string(),
            correlation_ids: correlation_ids.clone(),
            responses: HashMap::new(),
        };
        for id in &correlation_ids {
            if let Some(data) = state.take_early(id) {
                wait.responses.insert(id.clone(), data);
            }
        }
        if wait.responses.len() == wait.correlation_ids.len() {
            for id in &correlation_ids {
                state.answered.insert(id.clone(), wait.plan_execution_id.clone());
            }
            return Some(CompletedWait {
                node_execution_id: wait.node_execution_id,
                responses: wait.responses,
            });
        }
        for id in correlation_ids {
            state.by_correlation.insert(id, wait_id.clone());
        }
        state.waits.insert(wait_id, wait);
        None
    }

    /// 回复一个关联 ID；等待因此完成时返回它
    pub fn done_with(&self, correlation_id: &str, data: ResponseData) -> Option<CompletedWait> {
        let mut state = self.state.lock().ok()?;
        if state.answered.contains_key(correlation_id) {
            tracing::debug!("Duplicate response for {} ignored", correlation_id);
            return None;
        }
        let Some(wait_id) = state.by_correlation.get(correlation_id).cloned() else {
            state.buffer_early(correlation_id, data);
            return None;
        };
        let complete = {
            let wait = state.waits.get_mut(&wait_id)?;
            if wait.responses.contains_key(correlation_id) {
                return None;
            }
            wait.responses.insert(correlation_id.to_string(), data);
            wait.responses.len() == wait.correlation_ids.len()
        };
        if !complete {
            return None;
        }
        let wait = state.waits.remove(&wait_id)?;
        for id in &wait.correlation_ids {
            state.by_correlation.remove(id);
            state.answered.insert(id.clone(), wait.plan_execution_id.clone());
        }
        Some(CompletedWait {
            node_execution_id: wait.node_execution_id,
            responses: wait.responses,
        })
    }

    /// 取消节点注册的全部等待
    pub fn cancel_for_node(&self, node_execution_id: &str) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let wait_ids: Vec<String> = state
            .waits
            .iter()
            .filter(|(_, w)| w.node_execution_id == node_execution_id)
            .map(|(id, _)| id.clone())
            .collect();
        for wait_id in &wait_ids {
            if let Some(wait) = state.waits.remove(wait_id) {
                for id in wait.correlation_ids {
                    state.by_correlation.remove(&id);
                    state.answered.insert(id, wait.plan_execution_id.clone());
                }
            }
        }
        wait_ids.len()
    }

    /// 计划结束：丢弃该计划的等待与已回复记录
    pub fn release_plan(&self, plan_execution_id: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let wait_ids: Vec<String> = state
            .waits
            .iter()
            .filter(|(_, w)| w.plan_execution_id == plan_execution_id)
            .map(|(id, _)| id.clone())
            .collect();
        for wait_id in wait_ids {
            if let Some(wait) = state.waits.remove(&wait_id) {
                for id in wait.correlation_ids {
                    state.by_correlation.remove(&id);
                }
            }
        }
        state.answered.retain(|_, plan| plan != plan_execution_id);
    }

    pub fn pending_waits(&self) -> usize {
        self.state.lock().map(|s| s.waits.len()).unwrap_or(0)
    }

    /// 已回复记录与暂存回复的数量
    pub fn retained_entries(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.answered.len() + s.early.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Status;

    fn data(id: &str) -> ResponseData {
        ResponseData::NodeStatus {
            node_execution_id: id.to_string(),
            identifier: id.to_string(),
            status: Status::Succeeded,
        }
    }

    #[test]
    fn test_completes_after_all_responses() {
        let engine = WaitNotifyEngine::new();
        assert!(engine.wait_for_all("p1", "parent", vec!["a".into(), "b".into()]).is_none());
        assert!(engine.done_with("a", data("a")).is_none());
        assert!(engine.done_with("a", data("a")).is_none());
        let done = engine.done_with("b", data("b")).unwrap();
        assert_eq!(done.node_execution_id, "parent");
        assert_eq!(done.responses.len(), 2);
        assert!(engine.done_with("b", data("b")).is_none());
        assert_eq!(engine.pending_waits(), 0);
    }

    #[test]
    fn test_early_response_is_kept() {
        let engine = WaitNotifyEngine::new();
        assert!(engine.done_with("task", data("task")).is_none());
        let done = engine.wait_for_all("p1", "node", vec!["task".into()]).unwrap();
        assert!(done.responses.contains_key("task"));
    }

    #[test]
    fn test_cancel_for_node() {
        let engine = WaitNotifyEngine::new();
        engine.wait_for_all("p1", "node", vec!["x".into()]);
        assert_eq!(engine.cancel_for_node("node"), 1);
        assert!(engine.done_with("x", data("x")).is_none());
        assert_eq!(engine.pending_waits(), 0);
    }

    #[test]
    fn test_release_plan_forgets_answered_ids() {
        let engine = WaitNotifyEngine::new();
        engine.wait_for_all("p1", "a", vec!["x".into()]);
        engine.wait_for_all("p2", "b", vec!["y".into()]);
        assert!(engine.done_with("x", data("x")).is_some());
        assert!(engine.done_with("y", data("y")).is_some());
        assert_eq!(engine.retained_entries(), 2);

        engine.release_plan("p1");
        assert_eq!(engine.retained_entries(), 1);
        assert!(engine.done_with("y", data("y")).is_none());

        engine.wait_for_all("p1", "c", vec!["z".into()]);
        engine.release_plan("p1");
        assert_eq!(engine.pending_waits(), 0);
    }

    #[test]
    fn test_early_buffer_is_bounded() {
        let engine = WaitNotifyEngine::new();
        for i in 0..MAX_EARLY_RESPONSES + 10 {
            let id = format!("cb_{i}");
            engine.done_with(&id, data(&id));
        }
        assert_eq!(engine.retained_entries(), MAX_EARLY_RESPONSES);
        assert!(engine.wait_for_all("p1", "n", vec!["cb_0".into()]).is_none());
        let last = format!("cb_{}", MAX_EARLY_RESPONSES + 9);
        assert!(engine.wait_for_all("p1", "m", vec![last]).is_some());
    }
}
