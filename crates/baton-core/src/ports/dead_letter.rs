//! DeadLetterSink port - where discarded messages are recorded.

use async_trait::async_trait;

use crate::domain::DeadLetter;
use crate::ports::BrokerError;

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> Result<(), BrokerError>;
}
