//! 事件处理器（EventHandler）
//!
//! 订阅在底层总线上的消费逻辑。处理器的错误对总线不透明，只记录其文本。
//!
use async_trait::async_trait;
use serde_json::Value;

/// 订阅该事件类型的处理器会收到所有事件
pub const ALL_EVENTS: &str = "*";

/// 事件处理器：处理某一类型的事件
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于日志与失败记录）
    fn handler_name(&self) -> &str;
    /// 处理事件
    async fn handle(&self, event: &str, payload: &Value) -> anyhow::Result<()>;
}
