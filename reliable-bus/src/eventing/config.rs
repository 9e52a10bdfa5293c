//! 可靠总线配置
//!
//! 时长字段以毫秒序列化（`processing_interval_ms` 等），便于从 JSON/环境配置加载。
//!
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliableBusConfig {
    /// 处理循环周期
    #[serde(rename = "processing_interval_ms", with = "millis")]
    pub processing_interval: Duration,
    /// 重试循环周期
    #[serde(rename = "retry_interval_ms", with = "millis")]
    pub retry_interval: Duration,
    /// 健康日志周期
    #[serde(rename = "health_check_interval_ms", with = "millis")]
    pub health_check_interval: Duration,
    /// 发布时未指定 `max_retries` 时的缺省值
    pub default_max_retries: u32,
    /// 单次处理循环最多拉取的 pending 消息数
    pub batch_size: usize,
    /// 指数退避的底数
    pub retry_backoff_factor: f64,
    /// 退避基准时长
    #[serde(rename = "retry_initial_delay_ms", with = "millis")]
    pub retry_initial_delay: Duration,
    /// 单次处理循环内并发投递的上限
    pub max_concurrent_processing: usize,
    /// 单次投递尝试的超时，`None` 表示不限制
    #[serde(rename = "attempt_timeout_ms", with = "millis::option")]
    pub attempt_timeout: Option<Duration>,
}

impl Default for ReliableBusConfig {
    fn default() -> Self {
        Self {
            processing_interval: Duration::from_millis(5_000),
            retry_interval: Duration::from_millis(60_000),
            health_check_interval: Duration::from_millis(300_000),
            default_max_retries: 3,
            batch_size: 10,
            retry_backoff_factor: 2.0,
            retry_initial_delay: Duration::from_millis(1_000),
            max_concurrent_processing: 5,
            attempt_timeout: None,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_table() {
        let cfg = ReliableBusConfig::default();
        assert_eq!(
            serde_json::to_value(&cfg).unwrap(),
            json!({
                "processing_interval_ms": 5000,
                "retry_interval_ms": 60000,
                "health_check_interval_ms": 300000,
                "default_max_retries": 3,
                "batch_size": 10,
                "retry_backoff_factor": 2.0,
                "retry_initial_delay_ms": 1000,
                "max_concurrent_processing": 5,
                "attempt_timeout_ms": null
            })
        );
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let cfg: ReliableBusConfig = serde_json::from_value(json!({
            "batch_size": 25,
            "attempt_timeout_ms": 1500
        }))
        .unwrap();

        assert_eq!(cfg.batch_size, 25);
        assert_eq!(cfg.attempt_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(cfg.retry_interval, Duration::from_secs(60));
    }
}
