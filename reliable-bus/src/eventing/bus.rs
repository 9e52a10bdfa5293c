//! 事件总线（EventBus）协议
//!
//! 底层发布/订阅原语的最小协议：单次发布返回成功与否，订阅与退订按事件类型进行。
//! `ReliableEventBus` 既包装该协议，也实现该协议，可在任何需要底层总线的位置替换使用。
//!
use super::EventHandler;
use crate::{error::BusResult as Result, message::Priority};
use async_trait::async_trait;
use bon::Builder;
use serde_json::{Map, Value};
use std::sync::Arc;

/// 发布选项
///
/// 底层总线只读取 `retry`；其余字段由可靠总线使用。
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct PublishOptions {
    /// 是否允许底层总线自行重试
    #[builder(default = true)]
    pub retry: bool,
    /// 重试上限，缺省取可靠总线配置
    pub max_retries: Option<u32>,
    /// 是否在持久化后立即同步尝试一次投递
    #[builder(default)]
    pub immediate: bool,
    #[builder(default)]
    pub priority: Priority,
    pub metadata: Option<Map<String, Value>>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// 事件总线：负责分发事件与管理订阅
#[async_trait]
pub trait EventBus: Send + Sync {
    /// 发布一次，返回本次尝试是否成功
    async fn publish(&self, event: &str, payload: &Value, options: &PublishOptions)
    -> Result<bool>;

    async fn subscribe(&self, event: &str, handler: Arc<dyn EventHandler>);

    /// 按 `Arc` 指针身份退订
    async fn unsubscribe(&self, event: &str, handler: &Arc<dyn EventHandler>);
}
