//! Identifier generation for messages and conversations

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new opaque identifier.
///
/// Uses the operating system's random source to build a v4 UUID. If that
/// source cannot be read, a time + counter + thread-local random composite is
/// returned instead, so this never fails.
pub fn new_id() -> String {
    let mut bytes = [0u8; 16];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string(),
        Err(e) => {
            tracing::debug!(error = %e, "OS random source unavailable, using fallback id");
            fallback_id()
        }
    }
}

fn fallback_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let count = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
    let noise: u64 = rand::thread_rng().gen();
    format!("{:x}-{:x}-{:016x}", millis, count, noise)
}
