//! Session and node identifiers.
//!
//! Session IDs are ULIDs: 26-character Crockford base32 strings encoding 48
//! bits of millisecond timestamp followed by 80 random bits. A generator never
//! hands out the same id twice and its ids sort in issue order, even within
//! one millisecond. Node IDs are random v4 UUIDs, generated once per process.

use std::fmt;

use parking_lot::Mutex;
use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const RANDOM_BITS: u32 = 80;
const RANDOM_MASK: u128 = (1 << RANDOM_BITS) - 1;

/// Source of globally unique session identifiers.
pub trait SessionIdGenerator: Send + Sync + 'static {
    fn generate(&self) -> String;
}

/// Default generator producing monotonic ULIDs.
#[derive(Debug, Default)]
pub struct UlidGenerator {
    /// Timestamp and random part of the last id issued.
    last: Mutex<(u64, u128)>,
}

impl UlidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_parts(&self, now_ms: u64) -> (u64, u128) {
        let mut last = self.last.lock();
        let (last_ms, last_rand) = *last;
        let next = if now_ms > last_ms {
            (now_ms, rand::thread_rng().r#gen::<u128>() & RANDOM_MASK)
        } else if last_rand < RANDOM_MASK {
            // Same millisecond (or the clock stepped back): keep ordering.
            (last_ms, last_rand + 1)
        } else {
            (last_ms + 1, 0)
        };
        *last = next;
        next
    }
}

impl SessionIdGenerator for UlidGenerator {
    fn generate(&self) -> String {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let (ms, random) = self.next_parts(now_ms);
        encode(ms, random)
    }
}

fn encode(ms: u64, random: u128) -> String {
    let value = (u128::from(ms & 0xFFFF_FFFF_FFFF) << RANDOM_BITS) | (random & RANDOM_MASK);
    (0..26)
        .map(|i| CROCKFORD[((value >> (125 - 5 * i)) & 0x1F) as usize] as char)
        .collect()
}

/// Creation time (Unix millis) carried in a ULID session id, if it is one.
pub fn ulid_timestamp_ms(id: &str) -> Option<u64> {
    if id.len() != 26 {
        return None;
    }
    let mut ms: u64 = 0;
    for &c in &id.as_bytes()[..10] {
        let digit = CROCKFORD.iter().position(|&d| d == c.to_ascii_uppercase())?;
        ms = (ms << 5) | digit as u64;
    }
    // The first character only carries 3 bits.
    (ms < 1 << 48).then_some(ms)
}

/// Identity of this process within the cluster.
///
/// Stamped on every outgoing change message and compared against incoming
/// ones to suppress echoes. Cheap to clone; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ids_within_one_millisecond_stay_ordered() {
        let ids = UlidGenerator::new();
        let a = encode(1_700_000_000_000, 5);
        *ids.last.lock() = (1_700_000_000_000, 5);
        let (ms, random) = ids.next_parts(1_700_000_000_000);
        let b = encode(ms, random);
        assert_eq!(random, 6);
        assert!(a < b);

        // A clock step back must not reorder ids either.
        let (ms, _) = ids.next_parts(1_600_000_000_000);
        assert_eq!(ms, 1_700_000_000_000);
    }

    #[test]
    fn random_part_overflow_carries_into_the_timestamp() {
        let ids = UlidGenerator::new();
        *ids.last.lock() = (42, RANDOM_MASK);
        assert_eq!(ids.next_parts(42), (43, 0));
    }

    #[test]
    fn a_burst_of_session_ids_is_unique_and_sorted() {
        let ids: Arc<dyn SessionIdGenerator> = Arc::new(UlidGenerator::new());
        let burst: Vec<String> = (0..1000).map(|_| ids.generate()).collect();
        for pair in burst.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        assert!(burst.iter().all(|id| id.len() == 26 && id.bytes().all(|b| CROCKFORD.contains(&b))));
    }

    #[test]
    fn timestamp_is_recoverable_from_the_id() {
        assert_eq!(ulid_timestamp_ms(&encode(1_700_000_123_456, 99)), Some(1_700_000_123_456));
        assert_eq!(ulid_timestamp_ms("not-a-session-id"), None);
        assert_eq!(ulid_timestamp_ms("ZZZZZZZZZZZZZZZZZZZZZZZZZZ"), None);
    }

    #[test]
    fn node_ids_differ_per_generation() {
        assert_ne!(NodeId::generate(), NodeId::generate());
        assert_eq!(NodeId::from("n1").as_str(), "n1");
    }
}
