//! 可靠事件总线（ReliableEventBus）
//!
//! 在尽力而为的底层总线之前加一层可靠性保障，提供至少一次投递：
//! - 发布时先持久化再确认，`publish` 返回 `true` 仅表示“已可靠入队”；
//! - 处理循环周期拉取 pending 消息，按并发上限分块投递，成功即删除、失败标记 failed；
//!   每个处理 tick 独立运行，卡住的投递只占用一个并发槽位，不会阻塞后续 tick；
//! - 重试循环按指数退避把 failed 消息送回 pending，或在重试耗尽时转入死信；
//! - 健康循环周期输出累计计数；
//! - 支持暂停/恢复与关闭，二者都不会打断正在进行的投递。
//!
//! 存储协议提供 `transition_state` 乐观领取，因此多个处理循环（或多个实例）
//! 共享同一存储时，同一条消息不会被同时领取。
//!
use super::{
    BusStatus, EventBus, EventHandler, PublishOptions, ReliableBusConfig, Scheduler,
    SchedulerHandle, StatsSnapshot, stats::BusStats,
};
use crate::{
    clock::{Clock, SystemClock},
    dead_letter::DeadLetterQueue,
    error::{BusError, BusResult as Result},
    message::{EventMessage, MessageState, RetryStep},
    storage::MessageStorage,
};
use async_trait::async_trait;
use bon::Builder;
use futures_util::future::join_all;
use serde_json::Value;
use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 单条消息一次投递尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    Failed,
    /// 未能领取（已被其他循环领取或存储出错），本次未尝试
    Skipped,
}

/// 一次处理循环的汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// 一次重试循环的汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOutcome {
    pub requeued: usize,
    pub dead_lettered: usize,
    pub waiting: usize,
}

#[derive(Builder)]
pub struct ReliableEventBus {
    event_bus: Arc<dyn EventBus>,
    storage: Arc<dyn MessageStorage>,
    #[builder(default)]
    config: ReliableBusConfig,
    #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)]
    clock: Arc<dyn Clock>,
    #[builder(skip)]
    stats: BusStats,
    #[builder(skip)]
    paused: AtomicBool,
    #[builder(skip)]
    shutdown: CancellationToken,
    /// 跨处理 tick 共享的投递槽位，容量为 `max_concurrent_processing`
    #[builder(skip)]
    slots: OnceLock<Semaphore>,
}

impl ReliableEventBus {
    /// 启动处理、重试与健康三个周期任务
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        let mut scheduler = Scheduler::new(self.shutdown.child_token());

        {
            let bus = self.clone();
            let period = self.config.processing_interval;
            scheduler.spawn_detached_periodic("processing", period, move || {
                let bus = bus.clone();
                async move {
                    if let Err(err) = bus.process_pending().await {
                        warn!(error = %err, "processing tick failed");
                    }
                }
            });
        }

        {
            let bus = self.clone();
            scheduler.spawn_periodic("retry", self.config.retry_interval, move || {
                let bus = bus.clone();
                async move {
                    if let Err(err) = bus.process_retries().await {
                        warn!(error = %err, "retry tick failed");
                    }
                }
            });
        }

        {
            let bus = self.clone();
            scheduler.spawn_periodic("health", self.config.health_check_interval, move || {
                let bus = bus.clone();
                async move { bus.report_health() }
            });
        }

        info!(
            processing_interval_ms = self.config.processing_interval.as_millis() as u64,
            retry_interval_ms = self.config.retry_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_concurrent_processing = self.config.max_concurrent_processing,
            "reliable event bus started"
        );

        scheduler.into_handle()
    }

    /// 停止所有周期任务；进行中的投递不受影响
    pub fn dispose(&self) {
        self.shutdown.cancel();
        info!("reliable event bus disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn pause_processing(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("reliable event bus paused");
    }

    pub fn resume_processing(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("reliable event bus resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn get_status(&self) -> BusStatus {
        BusStatus {
            paused: self.is_paused(),
            stats: self.stats.snapshot(),
            config: self.config.clone(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &ReliableBusConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn MessageStorage> {
        &self.storage
    }

    /// 共享同一存储与时钟的死信处理器
    pub fn dead_letter_queue(&self) -> DeadLetterQueue {
        DeadLetterQueue::with_clock(self.storage.clone(), self.clock.clone())
    }

    /// 对一条刚入队的消息同步尝试一次投递
    ///
    /// 仅在本次尝试失败时返回 `false`，失败的消息留在存储中，由常规重试循环接手。
    /// 消息已被处理循环领取时不做尝试，消息仍处于可靠入队状态，返回 `true`。
    pub async fn publish_immediately(&self, message: &EventMessage) -> bool {
        self.attempt_delivery(message).await != AttemptOutcome::Failed
    }

    /// 处理循环的单个 tick：拉取一批 pending 消息并按并发上限分块投递
    pub async fn process_pending(&self) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        if self.is_paused() {
            return Ok(outcome);
        }

        let slots = self.slots();
        if slots.available_permits() == 0 {
            debug!("all delivery slots busy, skipping tick");
            return Ok(outcome);
        }

        let batch = self
            .storage
            .get_messages(MessageState::Pending, Some(self.config.batch_size.max(1)))
            .await?;
        if batch.is_empty() {
            return Ok(outcome);
        }

        debug!(count = batch.len(), "processing pending batch");

        // 逐块等待，块内并发；槽位跨 tick 共享，同时在途的投递不超过上限
        for chunk in batch.chunks(self.config.max_concurrent_processing.max(1)) {
            let results = join_all(chunk.iter().map(|m| self.attempt_in_slot(slots, m))).await;
            for result in results {
                match result {
                    AttemptOutcome::Delivered => outcome.delivered += 1,
                    AttemptOutcome::Failed => outcome.failed += 1,
                    AttemptOutcome::Skipped => outcome.skipped += 1,
                }
            }
        }

        Ok(outcome)
    }

    /// 重试循环的单个 tick：推进全部 failed 消息
    pub async fn process_retries(&self) -> Result<RetryOutcome> {
        let mut outcome = RetryOutcome::default();
        if self.is_paused() {
            return Ok(outcome);
        }

        let failed = self
            .storage
            .get_messages(MessageState::Failed, None)
            .await?;
        let now = self.clock.now();

        for mut message in failed {
            let step = match message.schedule_retry(
                now,
                self.config.retry_initial_delay,
                self.config.retry_backoff_factor,
            ) {
                Ok(step) => step,
                Err(err) => {
                    warn!(message_id = %message.id(), error = %err, "cannot schedule retry");
                    continue;
                }
            };

            if step == RetryStep::Waiting {
                outcome.waiting += 1;
                continue;
            }

            if let Err(err) = self.storage.save_message(&message).await {
                warn!(message_id = %message.id(), error = %err, "failed to persist retry decision");
                continue;
            }

            match step {
                RetryStep::Requeued => {
                    self.stats.record_retry();
                    outcome.requeued += 1;
                    debug!(
                        message_id = %message.id(),
                        event = message.event(),
                        retry_count = message.retry_count(),
                        "message requeued for retry"
                    );
                }
                RetryStep::DeadLettered => {
                    self.stats.record_dead_letter();
                    outcome.dead_lettered += 1;
                    error!(
                        message_id = %message.id(),
                        event = message.event(),
                        retry_count = message.retry_count(),
                        max_retries = message.max_retries(),
                        error = message.error().unwrap_or_default(),
                        "retries exhausted, message moved to dead-letter"
                    );
                }
                RetryStep::Waiting => {}
            }
        }

        Ok(outcome)
    }

    /// 健康循环的单个 tick：仅输出累计计数
    pub fn report_health(&self) {
        let stats = self.stats.snapshot();
        info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            paused = self.is_paused(),
            "reliable event bus health"
        );
    }

    fn slots(&self) -> &Semaphore {
        self.slots
            .get_or_init(|| Semaphore::new(self.config.max_concurrent_processing.max(1)))
    }

    async fn attempt_in_slot(&self, slots: &Semaphore, message: &EventMessage) -> AttemptOutcome {
        // 槽位在投递结束前一直被占用；永不返回的投递会永久占用一个槽位
        let Ok(_permit) = slots.acquire().await else {
            return AttemptOutcome::Skipped;
        };
        self.attempt_delivery(message).await
    }

    async fn attempt_delivery(&self, message: &EventMessage) -> AttemptOutcome {
        let id = message.id();

        match self
            .storage
            .transition_state(
                id,
                MessageState::Pending,
                MessageState::Processing,
                None,
                self.clock.now(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(message_id = %id, "message already claimed, skipping");
                return AttemptOutcome::Skipped;
            }
            Err(err) => {
                warn!(message_id = %id, error = %err, "failed to claim message");
                return AttemptOutcome::Skipped;
            }
        }

        match self.deliver(message).await {
            Ok(true) => {
                self.finish_delivered(message).await;
                AttemptOutcome::Delivered
            }
            Ok(false) => {
                self.finish_failed(message, "underlying bus rejected the event")
                    .await;
                AttemptOutcome::Failed
            }
            Err(err) => {
                self.finish_failed(message, &err.to_string()).await;
                AttemptOutcome::Failed
            }
        }
    }

    async fn deliver(&self, message: &EventMessage) -> Result<bool> {
        // 底层总线不得再做自己的重试
        let options = PublishOptions::builder()
            .retry(false)
            .priority(message.priority())
            .maybe_metadata(message.metadata().cloned())
            .build();

        let publish = self
            .event_bus
            .publish(message.event(), message.payload(), &options);

        match self.config.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, publish)
                .await
                .map_err(|_| BusError::Timeout {
                    elapsed_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })?,
            None => publish.await,
        }
    }

    async fn finish_delivered(&self, message: &EventMessage) {
        let id = message.id();
        self.stats.record_success();
        debug!(message_id = %id, event = message.event(), "message delivered");

        if let Err(err) = self
            .storage
            .transition_state(
                id,
                MessageState::Processing,
                MessageState::Delivered,
                None,
                self.clock.now(),
            )
            .await
        {
            warn!(message_id = %id, error = %err, "failed to mark message delivered");
        }

        if let Err(err) = self.storage.delete_message(id).await {
            error!(message_id = %id, error = %err, "failed to delete delivered message");
        }
    }

    async fn finish_failed(&self, message: &EventMessage, reason: &str) {
        let id = message.id();
        self.stats.record_failure();
        warn!(
            message_id = %id,
            event = message.event(),
            retry_count = message.retry_count(),
            error = reason,
            "delivery attempt failed"
        );

        if let Err(err) = self
            .storage
            .transition_state(
                id,
                MessageState::Processing,
                MessageState::Failed,
                Some(reason),
                self.clock.now(),
            )
            .await
        {
            warn!(message_id = %id, error = %err, "failed to mark message failed");
        }
    }
}

#[async_trait]
impl EventBus for ReliableEventBus {
    /// 持久化后确认；`immediate` 时追加一次同步投递并返回其结果
    ///
    /// 持久化失败时返回错误，该事件不会入队。
    async fn publish(
        &self,
        event: &str,
        payload: &Value,
        options: &PublishOptions,
    ) -> Result<bool> {
        let message = EventMessage::builder()
            .event(event)
            .payload(payload.clone())
            .timestamp(self.clock.now())
            .max_retries(options.max_retries.unwrap_or(self.config.default_max_retries))
            .priority(options.priority)
            .maybe_metadata(options.metadata.clone())
            .build();

        if let Err(err) = self.storage.save_message(&message).await {
            error!(event, error = %err, "failed to persist event message, event dropped");
            return Err(err);
        }

        debug!(message_id = %message.id(), event, immediate = options.immediate, "event message queued");

        if !options.immediate {
            return Ok(true);
        }

        Ok(self.publish_immediately(&message).await)
    }

    async fn subscribe(&self, event: &str, handler: Arc<dyn EventHandler>) {
        self.event_bus.subscribe(event, handler).await;
    }

    async fn unsubscribe(&self, event: &str, handler: &Arc<dyn EventHandler>) {
        self.event_bus.unsubscribe(event, handler).await;
    }
}
