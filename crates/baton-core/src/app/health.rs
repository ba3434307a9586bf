//! HealthProbe - liveness flag read by external supervision.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ports::Broker;

/// "Accepting work" flag of one worker. Clones share the flag.
///
/// Only the worker writes it: true once its subscription is open, false after
/// it stops taking deliveries. A probe linked to a broker also reads false while
/// that broker reports its connection as down.
#[derive(Clone, Default)]
pub struct HealthProbe {
    accepting: Arc<AtomicBool>,
    connection: Option<Arc<dyn Broker>>,
}

impl HealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn linked(broker: Arc<dyn Broker>) -> Self {
        Self {
            accepting: Arc::default(),
            connection: Some(broker),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
            && self.connection.as_ref().is_none_or(|broker| broker.is_connected())
    }

    pub(crate) fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }
}

impl fmt::Debug for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthProbe")
            .field("accepting", &self.is_accepting())
            .field("linked", &self.connection.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryBroker;

    #[test]
    fn clones_share_state() {
        let probe = HealthProbe::new();
        let seen_by_supervisor = probe.clone();
        assert!(!seen_by_supervisor.is_accepting());
        probe.set_accepting(true);
        assert!(seen_by_supervisor.is_accepting());
    }

    #[test]
    fn linked_probe_follows_the_connection() {
        let broker = InMemoryBroker::new();
        let probe = HealthProbe::linked(Arc::new(broker.clone()));
        probe.set_accepting(true);
        assert!(probe.is_accepting());

        broker.disconnect();
        assert!(!probe.is_accepting());

        broker.reconnect();
        assert!(probe.is_accepting());

        broker.close();
        assert!(!probe.is_accepting());
    }
}
