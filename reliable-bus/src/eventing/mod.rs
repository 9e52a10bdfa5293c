//! 事件子系统（eventing）
//!
//! 提供底层发布/订阅协议与其上的可靠投递编排：
//! - `EventBus`：统一发布/订阅接口，`InMemoryEventBus` 为进程内实现；
//! - `EventHandler`：订阅在总线上的消费逻辑；
//! - `ReliableEventBus`：持久化、分块并发投递、指数退避重试与死信的编排器；
//! - `Scheduler`：可替换的周期任务调度。
//!
pub mod bus;
pub mod bus_inmemory;
pub mod config;
pub mod handler;
pub mod reliable;
pub mod scheduler;
mod stats;

pub use bus::{EventBus, PublishOptions};
pub use bus_inmemory::InMemoryEventBus;
pub use config::ReliableBusConfig;
pub use handler::{ALL_EVENTS, EventHandler};
pub use reliable::{AttemptOutcome, BatchOutcome, ReliableEventBus, RetryOutcome};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use stats::{BusStatus, StatsSnapshot};
