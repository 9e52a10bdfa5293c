//! 事件消息（EventMessage）与投递状态机
//!
//! `EventMessage` 是可靠总线的持久化单元：领域事件本身（类型 + 负载）外加
//! 投递跟踪元信息（重试计数、状态、最近尝试时间、错误描述）。
//!
//! 状态迁移表（其余迁移一律拒绝）：
//!
//! ```text
//! pending     -> processing   处理循环领取
//! processing  -> delivered    底层发布成功（随后立即删除）
//! processing  -> failed       底层发布返回 false 或出错
//! failed      -> pending      重试循环：退避已过且未达上限
//! failed      -> dead-letter  重试循环：达到重试上限
//! dead-letter -> pending      运维手动重新入队
//! ```
//!
use crate::error::{BusError, BusResult};
use bon::Builder;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr, time::Duration};
use uuid::Uuid;

/// 消息生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageState {
    Pending,
    Processing,
    Delivered,
    Failed,
    DeadLetter,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Pending => "pending",
            MessageState::Processing => "processing",
            MessageState::Delivered => "delivered",
            MessageState::Failed => "failed",
            MessageState::DeadLetter => "dead-letter",
        }
    }

    /// 是否允许从当前状态迁移到 `next`
    pub fn can_transition_to(&self, next: MessageState) -> bool {
        use MessageState::*;

        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Delivered)
                | (Processing, Failed)
                | (Failed, Pending)
                | (Failed, DeadLetter)
                | (DeadLetter, Pending)
        )
    }

    pub(crate) fn ensure_transition(&self, next: MessageState) -> BusResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(BusError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageState {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageState::Pending),
            "processing" => Ok(MessageState::Processing),
            "delivered" => Ok(MessageState::Delivered),
            "failed" => Ok(MessageState::Failed),
            "dead-letter" => Ok(MessageState::DeadLetter),
            other => Err(BusError::Parse {
                reason: format!("unknown message state: {other}"),
            }),
        }
    }
}

/// 发布优先级，仅作为提示记录，不参与调度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(BusError::Parse {
                reason: format!("unknown priority: {other}"),
            }),
        }
    }
}

/// 重试循环对单条失败消息的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// 退避窗口未到，本轮跳过
    Waiting,
    /// 重新回到 pending，等待下一次处理循环
    Requeued,
    /// 重试耗尽，进入死信
    DeadLettered,
}

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct EventMessage {
    /// 消息唯一标识，发布时生成
    #[builder(default = Uuid::new_v4())]
    id: Uuid,
    /// 领域事件类型
    #[builder(into)]
    event: String,
    /// 事件负载，形状由调用方按事件类型约定
    payload: Value,
    /// 创建时间
    timestamp: DateTime<Utc>,
    /// 已执行的重试轮数
    #[builder(default)]
    retry_count: u32,
    /// 重试上限，创建时确定
    max_retries: u32,
    #[builder(default = MessageState::Pending)]
    state: MessageState,
    #[builder(default)]
    #[serde(default)]
    priority: Priority,
    /// 最近一次投递尝试时间
    last_attempt: Option<DateTime<Utc>>,
    /// 最近一次失败描述
    error: Option<String>,
    /// 调用方附带的注解，原样透传
    metadata: Option<Map<String, Value>>,
}

impl EventMessage {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.last_attempt
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        self.metadata.as_ref()
    }

    /// 按状态机迁移，并记录尝试时间与错误
    pub fn transition_to(
        &mut self,
        next: MessageState,
        error: Option<&str>,
        attempted_at: DateTime<Utc>,
    ) -> BusResult<()> {
        self.state.ensure_transition(next)?;
        self.overwrite_state(next, error, attempted_at);
        Ok(())
    }

    pub(crate) fn overwrite_state(
        &mut self,
        state: MessageState,
        error: Option<&str>,
        attempted_at: DateTime<Utc>,
    ) {
        self.state = state;
        self.error = error.map(str::to_string);
        self.last_attempt = Some(attempted_at);
    }

    /// 下一次允许重试的时间：`last_attempt + initial_delay * factor^retry_count`
    ///
    /// 尚无尝试记录时以创建时间为基准。
    pub fn next_retry_at(&self, initial_delay: Duration, factor: f64) -> DateTime<Utc> {
        let base = self.last_attempt.unwrap_or(self.timestamp);
        let exponent = i32::try_from(self.retry_count).unwrap_or(i32::MAX);
        let delay_ms = initial_delay.as_millis() as f64 * factor.powi(exponent);
        // NaN 与负数按 0 处理，溢出饱和到 i64::MAX
        let delay = TimeDelta::try_milliseconds(delay_ms.max(0.0) as i64).unwrap_or(TimeDelta::MAX);

        base.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_retry_due(&self, now: DateTime<Utc>, initial_delay: Duration, factor: f64) -> bool {
        now >= self.next_retry_at(initial_delay, factor)
    }

    /// 重试循环对 `failed` 消息的推进
    ///
    /// 每轮计数加一；计数达到 `max_retries` 即转入死信，因此 `max_retries = 2`
    /// 的消息最多被投递两次。
    pub fn schedule_retry(
        &mut self,
        now: DateTime<Utc>,
        initial_delay: Duration,
        factor: f64,
    ) -> BusResult<RetryStep> {
        if self.state != MessageState::Failed {
            return Err(BusError::InvalidTransition {
                from: self.state,
                to: MessageState::Pending,
            });
        }

        if !self.is_retry_due(now, initial_delay, factor) {
            return Ok(RetryStep::Waiting);
        }

        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.last_attempt = Some(now);
        }

        if self.retry_count >= self.max_retries {
            self.state = MessageState::DeadLetter;
            return Ok(RetryStep::DeadLettered);
        }

        self.state = MessageState::Pending;
        self.error = None;
        Ok(RetryStep::Requeued)
    }

    /// 运维手动重新入队：重置计数与错误，回到 pending
    pub fn requeue(&mut self, now: DateTime<Utc>) -> BusResult<()> {
        if self.state != MessageState::DeadLetter {
            return Err(BusError::InvalidTransition {
                from: self.state,
                to: MessageState::Pending,
            });
        }

        self.state = MessageState::Pending;
        self.retry_count = 0;
        self.error = None;
        self.last_attempt = Some(now);
        Ok(())
    }
}
