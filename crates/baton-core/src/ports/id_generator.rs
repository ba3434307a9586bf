//! IdGenerator port - envelope id の生成
//!
//! ULIDs sort by creation time and need no coordination between ingress
//! instances. The clock is injected so tests can pin the timestamp half.

use ulid::Ulid;

use crate::domain::EnvelopeId;
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_envelope_id(&self) -> EnvelopeId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_envelope_id(&self) -> EnvelopeId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        EnvelopeId::new(ulid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_envelope_id();
        let id2 = id_gen.generate_envelope_id();

        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 26);
    }

    #[test]
    fn fixed_clock_pins_the_timestamp_part() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_envelope_id();
        let id2 = id_gen.generate_envelope_id();

        // ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);

        let u1 = Ulid::from_string(id1.as_str()).unwrap();
        let u2 = Ulid::from_string(id2.as_str()).unwrap();
        assert_eq!(u1.timestamp_ms(), u2.timestamp_ms());
        assert_eq!(u1.timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }
}
