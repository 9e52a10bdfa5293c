//! 消息存储（MessageStorage）
//!
//! 可靠总线唯一的共享可变资源。协议包含：
//! - `save_message`：按 id 幂等 upsert；
//! - `get_messages`：按状态获取快照列表（顺序对批处理足够稳定即可）；
//! - `update_message_state`：写入新状态与错误，并记录最近尝试时间；
//! - `transition_state`：带期望旧状态的乐观迁移，用于“领取”消息；
//! - `delete_message`：删除（投递成功或运维清理）。
//!
//! 内置内存实现（开发/测试）与 Postgres 实现（`postgres` 特性）。
//!
mod inmemory;
#[cfg(feature = "postgres")]
mod postgres;

pub use inmemory::InMemoryMessageStorage;
#[cfg(feature = "postgres")]
pub use postgres::PostgresMessageStorage;

use crate::{
    error::BusResult as Result,
    message::{EventMessage, MessageState},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait MessageStorage: Send + Sync {
    /// 按 id upsert
    async fn save_message(&self, message: &EventMessage) -> Result<()>;

    /// 获取处于 `state` 的消息，`limit` 为 `None` 时返回全部
    async fn get_messages(
        &self,
        state: MessageState,
        limit: Option<usize>,
    ) -> Result<Vec<EventMessage>>;

    async fn get_message(&self, id: Uuid) -> Result<Option<EventMessage>>;

    /// 无条件写入状态；id 不存在时返回 `NotFound`
    async fn update_message_state(
        &self,
        id: Uuid,
        state: MessageState,
        error: Option<&str>,
        attempted_at: DateTime<Utc>,
    ) -> Result<()>;

    /// 仅当当前状态等于 `expected` 时迁移到 `next`，返回是否迁移成功
    ///
    /// 非法的迁移对（见 `MessageState::can_transition_to`）返回 `InvalidTransition`。
    async fn transition_state(
        &self,
        id: Uuid,
        expected: MessageState,
        next: MessageState,
        error: Option<&str>,
        attempted_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// 删除消息；id 不存在时视为成功
    async fn delete_message(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
impl<T> MessageStorage for Arc<T>
where
    T: MessageStorage + ?Sized,
{
    async fn save_message(&self, message: &EventMessage) -> Result<()> {
        (**self).save_message(message).await
    }

    async fn get_messages(
        &self,
        state: MessageState,
        limit: Option<usize>,
    ) -> Result<Vec<EventMessage>> {
        (**self).get_messages(state, limit).await
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<EventMessage>> {
        (**self).get_message(id).await
    }

    async fn update_message_state(
        &self,
        id: Uuid,
        state: MessageState,
        error: Option<&str>,
        attempted_at: DateTime<Utc>,
    ) -> Result<()> {
        (**self)
            .update_message_state(id, state, error, attempted_at)
            .await
    }

    async fn transition_state(
        &self,
        id: Uuid,
        expected: MessageState,
        next: MessageState,
        error: Option<&str>,
        attempted_at: DateTime<Utc>,
    ) -> Result<bool> {
        (**self)
            .transition_state(id, expected, next, error, attempted_at)
            .await
    }

    async fn delete_message(&self, id: Uuid) -> Result<()> {
        (**self).delete_message(id).await
    }
}
