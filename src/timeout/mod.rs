//! 超时引擎
//!
//! 超时实例由一个或多个追踪器组成，最早的到期时刻即实例的到期时刻。
//! 引擎作为 NodeStatusObserver 挂在存储上：节点状态变化时同步把事件应用到
//! 该节点持有的实例；节点进入终态时丢弃其实例。到期检查由编排引擎的轮询任务驱动。

pub mod tracker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::core::{OrchestrationError, Result};
use crate::execution::{NodeStatusObserver, NodeStatusUpdate};
use crate::registry::Registry;

pub use tracker::{
    AbsoluteTimeoutTracker, AbsoluteTrackerFactory, ActiveState, ActiveTimeoutTracker,
    ActiveTrackerFactory, Dimension, TimeoutEvent, TimeoutTracker, TimeoutTrackerFactory,
};

/// 到期回调
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutCallback {
    /// 节点超时：引擎据此注册 MARK_EXPIRED 中断
    NodeExpiry {
        plan_execution_id: String,
        node_execution_id: String,
    },
}

/// 超时实例
#[derive(Debug, Clone)]
pub struct TimeoutInstance {
    pub id: String,
    pub dimension: Dimension,
    pub trackers: Vec<Arc<dyn TimeoutTracker>>,
    pub callback: TimeoutCallback,
    pub created_at: i64,
}

impl TimeoutInstance {
    /// 所有正在计时的追踪器中最早的到期时刻
    pub fn expiry_time(&self) -> Option<i64> {
        self.trackers.iter().filter_map(|t| t.expiry_time()).min()
    }
}

pub type TrackerFactoryRegistry = Registry<Dimension, Arc<dyn TimeoutTrackerFactory>>;

/// 超时引擎
pub struct TimeoutEngine {
    instances: Mutex<HashMap<String, TimeoutInstance>>,
    factories: TrackerFactoryRegistry,
}

impl TimeoutEngine {
    pub fn new() -> Self {
        let mut factories = TrackerFactoryRegistry::new();
        let _ = factories.register(Dimension::Absolute, Arc::new(AbsoluteTrackerFactory));
        let _ = factories.register(Dimension::Active, Arc::new(ActiveTrackerFactory));
        Self::with_factories(factories)
    }

    pub fn with_factories(factories: TrackerFactoryRegistry) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            factories,
        }
    }

    /// 通过已注册的工厂创建追踪器
    pub fn create_tracker(
        &self,
        dimension: Dimension,
        timeout_ms: i64,
        now_ms: i64,
        flowing: bool,
    ) -> Result<Arc<dyn TimeoutTracker>> {
        if timeout_ms <= 0 {
            return Err(OrchestrationError::InvalidRequest(format!(
                "{} timeout must be positive, got {} ms",
                dimension, timeout_ms
            )));
        }
        let factory = self.factories.obtain(&dimension)?;
        Ok(factory.create(timeout_ms, now_ms, flowing))
    }

    /// 注册超时实例，返回实例 ID
    pub fn register_timeout(
        &self,
        dimension: Dimension,
        trackers: Vec<Arc<dyn TimeoutTracker>>,
        callback: TimeoutCallback,
    ) -> Result<String> {
        if trackers.is_empty() {
            return Err(OrchestrationError::InvalidRequest(
                "timeout instance needs at least one tracker".to_string(),
            ));
        }
        let id = format!("timeout_{}", uuid::Uuid::new_v4());
        let instance = TimeoutInstance {
            id: id.clone(),
            dimension,
            trackers,
            callback,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        if let Ok(mut instances) = self.instances.lock() {
            instances.insert(id.clone(), instance);
        }
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<TimeoutInstance> {
        self.instances.lock().ok()?.get(id).cloned()
    }

    /// 把事件应用到实例的每个追踪器，替换发生变化的快照
    pub fn on_event(&self, id: &str, event: &TimeoutEvent) {
        let Ok(mut instances) = self.instances.lock() else {
            return;
        };
        if let Some(instance) = instances.get_mut(id) {
            for tracker in instance.trackers.iter_mut() {
                if let Some(next) = tracker.apply(event) {
                    *tracker = next;
                }
            }
        }
    }

    pub fn discard(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if let Ok(mut instances) = self.instances.lock() {
            for id in ids {
                instances.remove(id);
            }
        }
        tracing::debug!("Discarded {} timeout instances", ids.len());
    }

    /// 取出所有在 `now_ms` 前到期的实例
    pub fn poll_expired(&self, now_ms: i64) -> Vec<TimeoutInstance> {
        let Ok(mut instances) = self.instances.lock() else {
            return Vec::new();
        };
        let expired: Vec<String> = instances
            .values()
            .filter(|i| i.expiry_time().is_some_and(|e| now_ms >= e))
            .map(|i| i.id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| instances.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimeoutEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStatusObserver for TimeoutEngine {
    fn on_node_status_update(&self, update: &NodeStatusUpdate) {
        let node = &update.node_execution;
        if node.timeout_instance_ids.is_empty() {
            return;
        }
        if node.status.is_terminal() {
            self.discard(&node.timeout_instance_ids);
            return;
        }
        let event = TimeoutEvent::StatusUpdate {
            status: node.status,
            at_ms: update.updated_at,
        };
        for id in &node.timeout_instance_ids {
            self.on_event(id, &event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Ambiance, NodeExecution, Status};

    fn callback() -> TimeoutCallback {
        TimeoutCallback::NodeExpiry {
            plan_execution_id: "p1".to_string(),
            node_execution_id: "n1".to_string(),
        }
    }

    #[test]
    fn test_poll_expired_removes_instances() {
        let engine = TimeoutEngine::new();
        let tracker = engine.create_tracker(Dimension::Absolute, 100, 0, false).unwrap();
        let id = engine.register_timeout(Dimension::Absolute, vec![tracker], callback()).unwrap();

        assert!(engine.poll_expired(99).is_empty());
        let expired = engine.poll_expired(100);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id);
        assert!(engine.get(&id).is_none());
    }

    #[test]
    fn test_observer_pauses_active_tracker() {
        let engine = TimeoutEngine::new();
        let tracker = engine.create_tracker(Dimension::Active, 1_000, 0, true).unwrap();
        let id = engine.register_timeout(Dimension::Active, vec![tracker], callback()).unwrap();

        let mut node = NodeExecution::new("p1", "a", "a", "NOOP", Ambiance::new("p1"));
        node.timeout_instance_ids.push(id.clone());
        node.status = Status::Paused;
        engine.on_node_status_update(&NodeStatusUpdate {
            node_execution: node.clone(),
            previous_status: Status::Running,
            updated_at: 400,
        });

        assert!(engine.poll_expired(10_000).is_empty());
        assert_eq!(engine.get(&id).unwrap().expiry_time(), None);

        node.status = Status::Succeeded;
        engine.on_node_status_update(&NodeStatusUpdate {
            node_execution: node,
            previous_status: Status::Paused,
            updated_at: 500,
        });
        assert!(engine.is_empty());
    }

    #[test]
    fn test_unregistered_dimension() {
        let engine = TimeoutEngine::with_factories(TrackerFactoryRegistry::new());
        assert!(engine.create_tracker(Dimension::Active, 1, 0, true).is_err());
    }

    #[test]
    fn test_non_positive_budget_rejected() {
        let engine = TimeoutEngine::new();
        assert!(matches!(
            engine.create_tracker(Dimension::Absolute, 0, 0, true),
            Err(OrchestrationError::InvalidRequest(_))
        ));
        assert!(engine.create_tracker(Dimension::Active, -5, 0, true).is_err());
    }
}
