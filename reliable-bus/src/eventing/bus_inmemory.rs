//! 内存版事件总线（InMemoryEventBus）
//!
//! 基于 `DashMap` 的轻量进程内总线，满足 `EventBus` 协议：
//! - `publish`：并发调用匹配的处理器（含订阅 `ALL_EVENTS` 的处理器），全部成功才返回 `true`；
//! - `subscribe` / `unsubscribe`：按事件类型登记/移除处理器；
//! - 典型用途：测试环境、示例与本地开发。
//!
//! 注意：该实现不做持久化，无订阅者时发布视为成功；`retry` 选项开启时，
//! 失败的处理器会在同一次调用内重跑，最多 `attempts` 次。

use super::{ALL_EVENTS, EventBus, EventHandler, PublishOptions};
use crate::error::BusResult as Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

type HandlerList = Vec<Arc<dyn EventHandler>>;

/// 简单的内存事件总线实现
#[derive(Clone)]
pub struct InMemoryEventBus {
    handlers: Arc<DashMap<String, HandlerList>>,
    attempts: u32,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
            attempts: 1,
        }
    }

    /// `retry` 开启时单次发布内每个处理器的最大尝试次数
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.handlers.get(event).map(|l| l.len()).unwrap_or(0)
    }

    fn matching(&self, event: &str) -> HandlerList {
        let mut merged: HandlerList = Vec::new();
        if let Some(list) = self.handlers.get(event) {
            merged.extend(list.iter().cloned());
        }
        if event != ALL_EVENTS {
            if let Some(list) = self.handlers.get(ALL_EVENTS) {
                merged.extend(list.iter().cloned());
            }
        }
        merged
    }

    async fn run_handler(
        handler: &Arc<dyn EventHandler>,
        event: &str,
        payload: &Value,
        attempts: u32,
    ) -> bool {
        for attempt in 1..=attempts {
            match handler.handle(event, payload).await {
                Ok(()) => return true,
                Err(err) => {
                    warn!(
                        handler = handler.handler_name(),
                        event,
                        attempt,
                        error = %err,
                        "event handler failed"
                    );
                }
            }
        }
        false
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(
        &self,
        event: &str,
        payload: &Value,
        options: &PublishOptions,
    ) -> Result<bool> {
        // 先克隆出处理器列表，避免跨 await 持有 DashMap 的分片锁
        let handlers = self.matching(event);
        if handlers.is_empty() {
            debug!(event, "no subscribers for event");
            return Ok(true);
        }

        let attempts = if options.retry { self.attempts } else { 1 };
        let results = join_all(
            handlers
                .iter()
                .map(|h| Self::run_handler(h, event, payload, attempts)),
        )
        .await;

        Ok(results.into_iter().all(|ok| ok))
    }

    async fn subscribe(&self, event: &str, handler: Arc<dyn EventHandler>) {
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    async fn unsubscribe(&self, event: &str, handler: &Arc<dyn EventHandler>) {
        if let Some(mut list) = self.handlers.get_mut(event) {
            list.retain(|h| !Arc::ptr_eq(h, handler));
        }
        self.handlers.remove_if(event, |_, list| list.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl Counting {
        fn new(name: &'static str, fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                fail_first,
            })
        }
    }

    #[async_trait]
    impl EventHandler for Counting {
        fn handler_name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _event: &str, _payload: &Value) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                anyhow::bail!("{} failing call {n}", self.name);
            }
            Ok(())
        }
    }

    fn no_retry() -> PublishOptions {
        PublishOptions::builder().retry(false).build()
    }

    #[tokio::test]
    async fn publish_reaches_typed_and_wildcard_subscribers() {
        let bus = InMemoryEventBus::new();
        let typed = Counting::new("typed", 0);
        let wildcard = Counting::new("wildcard", 0);
        bus.subscribe("kit.created", typed.clone()).await;
        bus.subscribe(ALL_EVENTS, wildcard.clone()).await;

        assert!(bus.publish("kit.created", &json!({}), &no_retry()).await.unwrap());
        assert!(bus.publish("shift.created", &json!({}), &no_retry()).await.unwrap());

        assert_eq!(typed.calls.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = InMemoryEventBus::new();
        assert!(bus.publish("nobody.listens", &json!(1), &no_retry()).await.unwrap());
    }

    #[tokio::test]
    async fn failing_handler_makes_publish_return_false() {
        let bus = InMemoryEventBus::new().with_retry_attempts(3);
        let flaky = Counting::new("flaky", 2);
        bus.subscribe("expense.approved", flaky.clone()).await;

        assert!(!bus.publish("expense.approved", &json!({}), &no_retry()).await.unwrap());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);

        // retry 开启时同一次发布内重跑，第三次成功
        let flaky = Counting::new("flaky", 2);
        let bus = InMemoryEventBus::new().with_retry_attempts(3);
        bus.subscribe("expense.approved", flaky.clone()).await;
        assert!(bus
            .publish("expense.approved", &json!({}), &PublishOptions::default())
            .await
            .unwrap());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unsubscribe_removes_by_identity() {
        let bus = InMemoryEventBus::new();
        let a: Arc<dyn EventHandler> = Counting::new("a", 0);
        let b: Arc<dyn EventHandler> = Counting::new("b", 0);
        bus.subscribe("kit.returned", a.clone()).await;
        bus.subscribe("kit.returned", b.clone()).await;
        assert_eq!(bus.subscriber_count("kit.returned"), 2);

        bus.unsubscribe("kit.returned", &a).await;
        assert_eq!(bus.subscriber_count("kit.returned"), 1);

        bus.unsubscribe("kit.returned", &b).await;
        assert_eq!(bus.subscriber_count("kit.returned"), 0);
    }
}
