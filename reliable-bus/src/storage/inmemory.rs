//! 内存版消息存储
//!
//! 以插入顺序保存消息的列表实现，适用于开发与测试；进程退出即丢失。
//! 所有写操作在同一把写锁内完成，因此 `transition_state` 是原子的。
//!
use super::MessageStorage;
use crate::error::{BusError, BusResult as Result};
use crate::message::{EventMessage, MessageState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct InMemoryMessageStorage {
    messages: RwLock<Vec<EventMessage>>,
}

impl InMemoryMessageStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    /// 全部消息的快照
    pub async fn snapshot(&self) -> Vec<EventMessage> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl MessageStorage for InMemoryMessageStorage {
    async fn save_message(&self, message: &EventMessage) -> Result<()> {
        let mut messages = self.messages.write().await;
        match messages.iter_mut().find(|m| m.id() == message.id()) {
            Some(existing) => *existing = message.clone(),
            None => messages.push(message.clone()),
        }
        Ok(())
    }

    async fn get_messages(
        &self,
        state: MessageState,
        limit: Option<usize>,
    ) -> Result<Vec<EventMessage>> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| m.state() == state)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<EventMessage>> {
        let messages = self.messages.read().await;
        Ok(messages.iter().find(|m| m.id() == id).cloned())
    }

    async fn update_message_state(
        &self,
        id: Uuid,
        state: MessageState,
        error: Option<&str>,
        attempted_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut messages = self.messages.write().await;
        let message = messages
            .iter_mut()
            .find(|m| m.id() == id)
            .ok_or_else(|| BusError::NotFound {
                reason: format!("message {id}"),
            })?;

        // 无条件写入，不经状态机校验
        message.overwrite_state(state, error, attempted_at);
        Ok(())
    }

    async fn transition_state(
        &self,
        id: Uuid,
        expected: MessageState,
        next: MessageState,
        error: Option<&str>,
        attempted_at: DateTime<Utc>,
    ) -> Result<bool> {
        expected.ensure_transition(next)?;

        let mut messages = self.messages.write().await;
        match messages
            .iter_mut()
            .find(|m| m.id() == id && m.state() == expected)
        {
            Some(message) => {
                message.transition_to(next, error, attempted_at)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_message(&self, id: Uuid) -> Result<()> {
        self.messages.write().await.retain(|m| m.id() != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(event: &str) -> EventMessage {
        EventMessage::builder()
            .event(event)
            .payload(json!({"event": event}))
            .timestamp(Utc::now())
            .max_retries(3)
            .build()
    }

    #[tokio::test]
    async fn save_is_an_upsert_by_id() {
        let storage = InMemoryMessageStorage::new();
        let msg = pending("kit.created");
        storage.save_message(&msg).await.unwrap();
        storage.save_message(&msg).await.unwrap();
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn get_messages_filters_by_state_and_honours_limit() {
        let storage = InMemoryMessageStorage::new();
        for i in 0..5 {
            storage
                .save_message(&pending(&format!("e{i}")))
                .await
                .unwrap();
        }
        let first = storage.get_messages(MessageState::Pending, Some(2)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].event(), "e0");
        assert_eq!(first[1].event(), "e1");

        let all = storage.get_messages(MessageState::Pending, None).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(storage
            .get_messages(MessageState::Failed, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn update_message_state_stamps_last_attempt() {
        let storage = InMemoryMessageStorage::new();
        let msg = pending("shift.started");
        storage.save_message(&msg).await.unwrap();

        let at = Utc::now();
        storage
            .update_message_state(msg.id(), MessageState::Failed, Some("down"), at)
            .await
            .unwrap();

        let stored = storage.get_message(msg.id()).await.unwrap().unwrap();
        assert_eq!(stored.state(), MessageState::Failed);
        assert_eq!(stored.error(), Some("down"));
        assert_eq!(stored.last_attempt(), Some(at));

        let missing = storage
            .update_message_state(Uuid::new_v4(), MessageState::Failed, None, at)
            .await;
        assert!(matches!(missing, Err(BusError::NotFound { .. })));
    }

    #[tokio::test]
    async fn transition_state_only_wins_once() {
        let storage = InMemoryMessageStorage::new();
        let msg = pending("expense.submitted");
        storage.save_message(&msg).await.unwrap();

        let now = Utc::now();
        let first = storage
            .transition_state(msg.id(), MessageState::Pending, MessageState::Processing, None, now)
            .await
            .unwrap();
        let second = storage
            .transition_state(msg.id(), MessageState::Pending, MessageState::Processing, None, now)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        let illegal = storage
            .transition_state(msg.id(), MessageState::Pending, MessageState::Delivered, None, now)
            .await;
        assert!(matches!(illegal, Err(BusError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let storage = InMemoryMessageStorage::new();
        let msg = pending("kit.returned");
        storage.save_message(&msg).await.unwrap();
        storage.delete_message(msg.id()).await.unwrap();
        storage.delete_message(msg.id()).await.unwrap();
        assert!(storage.is_empty().await);
    }
}
