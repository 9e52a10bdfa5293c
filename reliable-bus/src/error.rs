//! 可靠事件总线统一错误定义
//!
//! 聚焦解析、消息存储、底层总线、状态迁移与投递超时等最小必要集合，
//! 便于各存储/传输实现统一转换为 `BusError`。
//!
use crate::message::MessageState;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    // --- 解析 ---
    #[error("parse error: {reason}")]
    Parse { reason: String },

    // --- 存储 ---
    #[error("storage error: {reason}")]
    Storage { reason: String },
    #[error("database error: {reason}")]
    Database { reason: String },
    #[error("not found: {reason}")]
    NotFound { reason: String },

    // --- 事件系统 ---
    #[error("event bus error: {reason}")]
    EventBus { reason: String },
    #[error("invalid transition: from={from}, to={to}")]
    InvalidTransition {
        from: MessageState,
        to: MessageState,
    },
    #[error("delivery attempt timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
}

/// 统一 Result 类型别名
pub type BusResult<T> = Result<T, BusError>;

// 允许在存储实现中直接使用 `?` 将 sqlx 错误转换为 BusError

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for BusError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BusError::NotFound {
                reason: "row not found".to_string(),
            },
            other => BusError::Database {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_failure_detail() {
        let timeout = BusError::Timeout { elapsed_ms: 250 };
        assert_eq!(timeout.to_string(), "delivery attempt timed out after 250ms");

        let transition = BusError::InvalidTransition {
            from: MessageState::Delivered,
            to: MessageState::Pending,
        };
        assert_eq!(
            transition.to_string(),
            "invalid transition: from=delivered, to=pending"
        );
    }
}
