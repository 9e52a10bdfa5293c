//! 可靠事件总线（reliable-bus）
//!
//! 在尽力而为的发布/订阅原语之前加一层可靠性保障，把事件投递升级为
//! 至少一次投递：
//! - 事件消息（`message`）：领域事件 + 投递元信息 + 生命周期状态机；
//! - 消息存储（`storage`）：可插拔的持久化协议，内置内存与 Postgres 实现；
//! - 事件系统（`eventing`）：底层总线协议、可靠总线编排器与周期调度；
//! - 死信处理（`dead_letter`）：查看、重新入队、删除与清空死信。
//!
//! 本 crate 不提供跨进程协调与恰好一次语义；一个逻辑队列对应一个编排实例，
//! 由调用方显式注入配置、存储与底层总线。
//!
//! 典型用法：
//! 1. 选择底层总线（如 `InMemoryEventBus`）并订阅处理器；
//! 2. 选择存储（`InMemoryMessageStorage` 或 `PostgresMessageStorage`）；
//! 3. 通过 `ReliableEventBus::builder()` 组装并 `start`；
//! 4. 使用 `EventBus::publish` 发布，借助 `DeadLetterQueue` 处理死信。
//!
pub mod clock;
pub mod dead_letter;
pub mod error;
pub mod eventing;
pub mod message;
pub mod storage;
