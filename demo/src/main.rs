use anyhow::{Context, Result};
use async_trait::async_trait;
use reliable_bus::eventing::{
    ALL_EVENTS, EventBus, EventHandler, InMemoryEventBus, PublishOptions, ReliableBusConfig,
    ReliableEventBus,
};
use reliable_bus::message::Priority;
use reliable_bus::storage::InMemoryMessageStorage;
use serde_json::{Value, json};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 审计处理器：订阅全部事件
#[derive(Default)]
struct AuditLog {
    seen: AtomicUsize,
}

#[async_trait]
impl EventHandler for AuditLog {
    fn handler_name(&self) -> &str {
        "audit-log"
    }

    async fn handle(&self, event: &str, payload: &Value) -> anyhow::Result<()> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        tracing::info!(event, %payload, "audit");
        Ok(())
    }
}

/// 排班通知：下游短信网关未恢复时总是失败
struct ShiftNotifier {
    gateway_up: AtomicBool,
}

#[async_trait]
impl EventHandler for ShiftNotifier {
    fn handler_name(&self) -> &str {
        "shift-notifier"
    }

    async fn handle(&self, event: &str, payload: &Value) -> anyhow::Result<()> {
        if !self.gateway_up.load(Ordering::SeqCst) {
            anyhow::bail!("sms gateway unavailable");
        }
        tracing::info!(event, volunteer = %payload["volunteer"], "shift notification sent");
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a valid value, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default_ms: u64) -> Result<Duration> {
    env_or(key, default_ms).map(Duration::from_millis)
}

/// 从环境变量加载配置；演示用的缺省周期远短于生产缺省值
fn config_from_env() -> Result<ReliableBusConfig> {
    let defaults = ReliableBusConfig::default();

    Ok(ReliableBusConfig {
        processing_interval: env_millis("RELIABLE_BUS_PROCESSING_INTERVAL_MS", 200)?,
        retry_interval: env_millis("RELIABLE_BUS_RETRY_INTERVAL_MS", 300)?,
        health_check_interval: env_millis("RELIABLE_BUS_HEALTH_CHECK_INTERVAL_MS", 1_000)?,
        default_max_retries: env_or("RELIABLE_BUS_DEFAULT_MAX_RETRIES", defaults.default_max_retries)?,
        batch_size: env_or("RELIABLE_BUS_BATCH_SIZE", defaults.batch_size)?,
        retry_backoff_factor: env_or(
            "RELIABLE_BUS_RETRY_BACKOFF_FACTOR",
            defaults.retry_backoff_factor,
        )?,
        retry_initial_delay: env_millis("RELIABLE_BUS_RETRY_INITIAL_DELAY_MS", 100)?,
        max_concurrent_processing: env_or(
            "RELIABLE_BUS_MAX_CONCURRENT_PROCESSING",
            defaults.max_concurrent_processing,
        )?,
        attempt_timeout: match env::var("RELIABLE_BUS_ATTEMPT_TIMEOUT_MS") {
            Ok(_) => Some(env_millis("RELIABLE_BUS_ATTEMPT_TIMEOUT_MS", 0)?),
            Err(_) => None,
        },
    })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reliable_bus=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config_from_env()?;
    tracing::info!(?config, "configuration loaded");

    // 底层总线与订阅
    let inner = Arc::new(InMemoryEventBus::new());
    let audit = Arc::new(AuditLog::default());
    let notifier = Arc::new(ShiftNotifier {
        gateway_up: AtomicBool::new(false),
    });
    inner.subscribe(ALL_EVENTS, audit.clone()).await;
    inner.subscribe("shift.assigned", notifier.clone()).await;

    let storage = Arc::new(InMemoryMessageStorage::new());
    let bus = Arc::new(
        ReliableEventBus::builder()
            .event_bus(inner)
            .storage(storage.clone())
            .config(config)
            .build(),
    );
    let handle = bus.start();

    // 1. 普通事件：入队后由处理循环投递
    bus.publish(
        "kit.checked_out",
        &json!({"kit_id": "kit-12", "volunteer": "v-3"}),
        &PublishOptions::default(),
    )
    .await?;

    // 2. 立即投递：返回值即本次尝试结果
    let delivered = bus
        .publish(
            "kit.returned",
            &json!({"kit_id": "kit-9", "condition": "good"}),
            &PublishOptions::builder()
                .immediate(true)
                .priority(Priority::High)
                .build(),
        )
        .await?;
    tracing::info!(delivered, "immediate publish finished");

    // 3. 下游不可用：重试耗尽后进入死信
    bus.publish(
        "shift.assigned",
        &json!({"shift_id": "s-44", "volunteer": "v-8"}),
        &PublishOptions::builder().max_retries(1).build(),
    )
    .await?;

    let dlq = bus.dead_letter_queue();
    tokio::time::timeout(Duration::from_secs(10), async {
        while dlq.count().await.unwrap_or_default() == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("shift.assigned did not reach the dead-letter queue")?;

    for message in dlq.get_dead_letter_messages(None).await? {
        tracing::warn!(
            message_id = %message.id(),
            event = message.event(),
            retry_count = message.retry_count(),
            error = message.error().unwrap_or_default(),
            "dead-lettered"
        );

        // 网关恢复后人工重新入队
        notifier.gateway_up.store(true, Ordering::SeqCst);
        dlq.requeue_message(message.id()).await?;
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        while !storage.is_empty().await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("requeued message was not delivered")?;

    bus.report_health();
    let status = bus.get_status();
    tracing::info!(
        audited = audit.seen.load(Ordering::SeqCst),
        status = %serde_json::to_string(&status)?,
        "demo finished"
    );

    bus.dispose();
    handle.join().await;
    Ok(())
}
