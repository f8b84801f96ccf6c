//! Daily routing key rotation.
//!
//! `routing_key = BLAKE3(key || "yyyyMMdd")` using the UTC date. Every router
//! derives the same mapping for the same day, and the whole keyspace is
//! reshuffled at UTC midnight.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Days, Utc};

use crate::identity::{Identity, RoutingKey};
use crate::protocols::KeyRotation;

#[derive(Clone, Copy, Debug, Default)]
pub struct DailyRoutingKey;

impl DailyRoutingKey {
    pub fn new() -> Self {
        Self
    }

    fn date_modifier(when: SystemTime) -> String {
        DateTime::<Utc>::from(when).format("%Y%m%d").to_string()
    }

    /// Time from `now` to the next UTC midnight.
    pub fn until_midnight(now: SystemTime) -> Duration {
        let now: DateTime<Utc> = now.into();
        let next_midnight = now
            .date_naive()
            .checked_add_days(Days::new(1))
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc());
        match next_midnight {
            Some(midnight) => (midnight - now).to_std().unwrap_or_default(),
            None => Duration::ZERO,
        }
    }
}

impl KeyRotation for DailyRoutingKey {
    fn routing_key_for(&self, key: &Identity, when: SystemTime) -> RoutingKey {
        let modifier = Self::date_modifier(when);
        let mut hasher = blake3::Hasher::new();
        hasher.update(key.as_bytes());
        hasher.update(modifier.as_bytes());
        RoutingKey::new(Identity::from_bytes(*hasher.finalize().as_bytes()))
    }

    fn time_until_rotation(&self) -> Duration {
        Self::until_midnight(SystemTime::now())
    }
}
