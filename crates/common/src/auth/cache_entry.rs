use std::time::{Duration, Instant};

use uuid::Uuid;

use super::Error;

/// A cached verdict for one `(identity, secret, scope)` triple. The cache
/// holds both outcomes deliberately: a cached negative is what keeps a
/// brute-force loop from re-hashing on every attempt.
#[derive(Clone)]
pub enum CacheEntry {
    Positive {
        user_id: Uuid,
        key_id: Uuid,
        at: Instant,
    },
    Negative {
        reason: Error,
        at: Instant,
    },
}

impl CacheEntry {
    pub fn positive(user_id: Uuid, key_id: Uuid) -> Self {
        CacheEntry::Positive {
            user_id,
            key_id,
            at: Instant::now(),
        }
    }

    pub fn negative(reason: Error) -> Self {
        CacheEntry::Negative {
            reason,
            at: Instant::now(),
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        let at = match self {
            CacheEntry::Positive { at, .. } => *at,
            CacheEntry::Negative { at, .. } => *at,
        };
        at.elapsed() > ttl
    }
}
