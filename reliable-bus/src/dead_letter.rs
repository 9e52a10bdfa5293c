//! 死信队列处理器（DeadLetterQueue）
//!
//! 面向运维的管理操作，不由定时器驱动：
//! - 分页查看死信；
//! - 单条重新入队（重置重试计数与错误，回到 pending）；
//! - 单条删除与整体清空。
//!
use crate::{
    clock::{Clock, SystemClock},
    error::{BusError, BusResult as Result},
    message::{EventMessage, MessageState},
    storage::MessageStorage,
};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct DeadLetterQueue {
    storage: Arc<dyn MessageStorage>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterQueue {
    pub fn new(storage: Arc<dyn MessageStorage>) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: Arc<dyn MessageStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub async fn get_dead_letter_messages(&self, limit: Option<usize>) -> Result<Vec<EventMessage>> {
        self.storage
            .get_messages(MessageState::DeadLetter, limit)
            .await
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.get_dead_letter_messages(None).await?.len())
    }

    /// 重新入队；id 不存在或不处于死信状态时返回 `NotFound`
    pub async fn requeue_message(&self, id: Uuid) -> Result<EventMessage> {
        let mut message = self
            .storage
            .get_message(id)
            .await?
            .filter(|m| m.state() == MessageState::DeadLetter)
            .ok_or_else(|| BusError::NotFound {
                reason: format!("dead-letter message {id}"),
            })?;

        message.requeue(self.clock.now())?;
        self.storage.save_message(&message).await?;

        info!(message_id = %id, event = message.event(), "dead-letter message requeued");
        Ok(message)
    }

    pub async fn delete_dead_letter_message(&self, id: Uuid) -> Result<()> {
        self.storage.delete_message(id).await?;
        info!(message_id = %id, "dead-letter message deleted");
        Ok(())
    }

    /// 删除全部死信，返回删除条数
    ///
    /// 删除前逐条复查状态，列出之后已被重新入队的消息不会被删除。
    /// 复查与删除之间仍有很小的窗口，存储协议没有按状态删除的原子操作。
    pub async fn purge_dead_letter_queue(&self) -> Result<usize> {
        let mut purged = 0;
        for listed in self.get_dead_letter_messages(None).await? {
            let still_dead = self
                .storage
                .get_message(listed.id())
                .await?
                .is_some_and(|m| m.state() == MessageState::DeadLetter);
            if !still_dead {
                debug!(message_id = %listed.id(), "message left dead-letter before purge, kept");
                continue;
            }

            self.storage.delete_message(listed.id()).await?;
            purged += 1;
        }

        info!(purged, "dead-letter queue purged");
        Ok(purged)
    }
}
