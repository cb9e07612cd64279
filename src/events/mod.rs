//! 编排事件发布与分发
//!
//! 存储层与引擎在每次状态变化后发布事件；事件经无界通道进入单个分发任务，
//! 按事件类型查分发表，每个处理器在独立任务中执行并带超时，
//! 某个处理器出错、超时或 panic 只记录日志，不影响其它处理器和引擎。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::execution::{Ambiance, NodeExecution, Status};

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    OrchestrationStart,
    OrchestrationEnd,
    NodeExecutionStatusUpdate,
    NodeExecutionUpdate,
    PlanExecutionStatusUpdate,
}

/// 编排事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    pub event_type: EventType,
    pub ambiance: Ambiance,
    pub plan_execution_id: String,
    pub node_execution: Option<NodeExecution>,
    pub status: Status,
    pub created_at: i64,
}

impl OrchestrationEvent {
    pub fn for_node(event_type: EventType, node: &NodeExecution) -> Self {
        Self {
            event_type,
            ambiance: node.ambiance.clone(),
            plan_execution_id: node.plan_execution_id.clone(),
            node_execution: Some(node.clone()),
            status: node.status,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn for_plan(event_type: EventType, plan_execution_id: &str, status: Status) -> Self {
        Self {
            event_type,
            ambiance: Ambiance::new(plan_execution_id),
            plan_execution_id: plan_execution_id.to_string(),
            node_execution: None,
            status,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 事件处理器；同一事件可能被投递多次，实现需幂等
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &OrchestrationEvent) -> anyhow::Result<()>;

    /// 处理器名称（用于日志）
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// 事件总线
pub struct EventBus {
    tx: mpsc::UnboundedSender<OrchestrationEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<OrchestrationEvent>>>,
    /// 分发表
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    /// 实时订阅（测试与外部观察者）
    sender: broadcast::Sender<OrchestrationEvent>,
    handler_timeout: Duration,
}

impl EventBus {
    pub fn new(channel_capacity: usize, handler_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: RwLock::new(HashMap::new()),
            sender,
            handler_timeout,
        }
    }

    /// 为某一事件类型注册处理器
    pub fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.entry(event_type).or_default().push(handler);
        }
    }

    /// 发布事件（不阻塞）
    pub fn publish(&self, event: OrchestrationEvent) {
        let _ = self.sender.send(event.clone());
        if self.tx.send(event).is_err() {
            tracing::debug!("Event dispatcher stopped, event dropped");
        }
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }

    /// 把事件交给对应的处理器，每个处理器相互隔离
    pub async fn dispatch(&self, event: &OrchestrationEvent) {
        let handlers: Vec<Arc<dyn EventHandler>> = match self.handlers.read() {
            Ok(table) => table.get(&event.event_type).cloned().unwrap_or_default(),
            Err(_) => return,
        };
        if handlers.is_empty() {
            return;
        }

        let timeout = self.handler_timeout;
        let runs = handlers.into_iter().map(|handler| {
            let event = event.clone();
            async move {
                let name = handler.name().to_string();
                let task = tokio::spawn(async move { handler.handle(&event).await });
                match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => {
                        tracing::warn!(handler = %name, "Event handler failed: {}", e);
                    }
                    Ok(Err(join_err)) => {
                        tracing::error!(handler = %name, "Event handler panicked: {}", join_err);
                    }
                    Err(_) => {
                        tracing::warn!(handler = %name, "Event handler timed out after {:?}", timeout);
                    }
                }
            }
        });
        futures_util::future::join_all(runs).await;
    }

    /// 启动分发循环，只能启动一次
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        let mut rx = self.rx.lock().ok()?.take()?;
        let bus = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("Event dispatcher stopped");
                        break;
                    }
                    event = rx.recv() => {
                        match event {
                            Some(event) => bus.dispatch(&event).await,
                            None => break,
                        }
                    }
                }
            }
        }))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024, Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _event: &OrchestrationEvent) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &OrchestrationEvent) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl EventHandler for Panicking {
        async fn handle(&self, _event: &OrchestrationEvent) -> anyhow::Result<()> {
            panic!("handler panic")
        }
    }

    #[tokio::test]
    async fn test_failing_handlers_are_isolated() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(EventType::OrchestrationEnd, Arc::new(Failing));
        bus.register(EventType::OrchestrationEnd, Arc::new(Panicking));
        bus.register(EventType::OrchestrationEnd, Arc::new(Counting(count.clone())));

        let event = OrchestrationEvent::for_plan(EventType::OrchestrationEnd, "p1", Status::Succeeded);
        bus.dispatch(&event).await;
        bus.dispatch(&event).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dispatch_only_matching_type() {
        let bus = Arc::new(EventBus::default());
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(EventType::OrchestrationStart, Arc::new(Counting(count.clone())));
        let token = CancellationToken::new();
        let handle = bus.start(token.clone()).expect("dispatcher starts once");
        assert!(bus.start(token.clone()).is_none());

        bus.publish(OrchestrationEvent::for_plan(EventType::OrchestrationEnd, "p1", Status::Succeeded));
        bus.publish(OrchestrationEvent::for_plan(EventType::OrchestrationStart, "p1", Status::Running));

        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        token.cancel();
        let _ = handle.await;
    }
}
