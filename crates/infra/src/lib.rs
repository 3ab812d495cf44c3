//! Infrastructure layer: the transactional receiving engine, its stores, the
//! event outbox and the notification collaborators.

pub mod config;
pub mod engine;
pub mod notification;
pub mod outbox;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::Settings;
pub use engine::{
    ChainSummary, EngineError, EngineResult, MaterializeOutcome, ReceiptOutcome, ReceivingEngine,
    ShortageFulfillment,
};
pub use notification::{
    HttpNotificationSink, InMemoryNotificationSink, NotificationError, NotificationPriority,
    NotificationRequest, NotificationSink, TracingNotificationSink,
};
pub use outbox::{DrainReport, OutboxMessage, OutboxRelay, OutboxStatus};
pub use store::{
    InMemoryReceivingStore, PostgresReceivingStore, ReceivingStore, ReceivingTx, StoreError,
};
