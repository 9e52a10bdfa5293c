/// 可靠事件总线（内存版）示例
/// 展示 publish -> 持久化 -> 处理循环 -> 重试退避 -> 死信 -> 人工重新入队 的闭环
use anyhow::Result as AnyResult;
use reliable_bus::eventing::{
    ALL_EVENTS, EventBus, EventHandler, InMemoryEventBus, PublishOptions, ReliableBusConfig,
    ReliableEventBus,
};
use reliable_bus::storage::InMemoryMessageStorage;
use serde_json::{Value, json};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

// ============================================================================
// 示例处理器（EventHandler）
// ============================================================================

struct PrintHandler;

#[async_trait::async_trait]
impl EventHandler for PrintHandler {
    fn handler_name(&self) -> &str {
        "printer"
    }

    async fn handle(&self, event: &str, payload: &Value) -> anyhow::Result<()> {
        println!("handler=printer event={event} payload={payload}");
        Ok(())
    }
}

/// 下游未恢复前总是失败的处理器
struct LedgerHandler {
    healthy: AtomicBool,
}

#[async_trait::async_trait]
impl EventHandler for LedgerHandler {
    fn handler_name(&self) -> &str {
        "ledger"
    }

    async fn handle(&self, event: &str, payload: &Value) -> anyhow::Result<()> {
        if !self.healthy.load(Ordering::SeqCst) {
            anyhow::bail!("ledger service unavailable");
        }
        println!("handler=ledger event={event} amount={}", payload["amount"]);
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> AnyResult<()> {
    println!("=== 可靠事件总线（内存版）示例 ===\n");

    // 底层总线与订阅
    let inner = Arc::new(InMemoryEventBus::new());
    let ledger = Arc::new(LedgerHandler {
        healthy: AtomicBool::new(false),
    });
    inner.subscribe(ALL_EVENTS, Arc::new(PrintHandler)).await;
    inner.subscribe("expense.approved", ledger.clone()).await;

    // 可靠总线
    let storage = Arc::new(InMemoryMessageStorage::new());
    let bus = Arc::new(
        ReliableEventBus::builder()
            .event_bus(inner)
            .storage(storage.clone())
            .config(ReliableBusConfig {
                processing_interval: Duration::from_millis(100),
                retry_interval: Duration::from_millis(150),
                health_check_interval: Duration::from_millis(500),
                retry_initial_delay: Duration::from_millis(50),
                ..Default::default()
            })
            .build(),
    );

    let handle = bus.start();
    println!("✅ 可靠总线已启动");

    bus.publish(
        "kit.checked_out",
        &json!({"kit_id": "k-1", "member": "m-7"}),
        &PublishOptions::default(),
    )
    .await?;
    bus.publish(
        "expense.approved",
        &json!({"expense_id": "x-1", "amount": 120}),
        &PublishOptions::builder().max_retries(2).build(),
    )
    .await?;
    println!("✅ 已入队: kit.checked_out, expense.approved(max_retries=2)");

    // 等待 expense.approved 耗尽重试
    tokio::time::sleep(Duration::from_secs(2)).await;

    let dlq = bus.dead_letter_queue();
    let dead = dlq.get_dead_letter_messages(None).await?;
    println!("\n死信数量: {}", dead.len());
    for m in &dead {
        println!(
            "  id={} event={} retry_count={} error={}",
            m.id(),
            m.event(),
            m.retry_count(),
            m.error().unwrap_or_default()
        );
    }

    // 下游恢复后人工重新入队
    ledger.healthy.store(true, Ordering::SeqCst);
    for m in &dead {
        dlq.requeue_message(m.id()).await?;
    }
    println!("✅ 下游已恢复，死信已重新入队");

    tokio::time::sleep(Duration::from_millis(500)).await;

    let status = bus.get_status();
    println!("\n状态: {}", serde_json::to_string_pretty(&status)?);
    println!("剩余消息: {}", storage.len().await);

    bus.dispose();
    handle.join().await;
    println!("\n✅ 优雅关闭完成");
    Ok(())
}
