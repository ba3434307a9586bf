//! Ports - 抽象化レイヤー
//!
//! Each trait is a seam to something outside the pipeline core: the broker, the
//! wall clock, id generation, dead-letter storage and result storage.

pub mod broker;
pub mod clock;
pub mod dead_letter;
pub mod id_generator;
pub mod result_store;

pub use self::broker::{
    Broker, BrokerError, CONTENT_TYPE_JSON, Delivery, PublishOptions, Subscription, settle,
};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dead_letter::DeadLetterSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::result_store::{ResultStore, StoreError};
