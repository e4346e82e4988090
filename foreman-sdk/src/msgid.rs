//! Message ids: ULIDs, 26 Crockford base32 characters.
//!
//! 48 bits of milliseconds since the epoch followed by 80 random bits, so
//! ids created in different milliseconds sort by creation time.

use chrono::{DateTime, Utc};
use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const MAX_MILLIS: i64 = (1 << 48) - 1;
const ENTROPY_BITS: u32 = 80;

/// A fresh id stamped with the current time.
pub fn generate() -> String {
    generate_at(Utc::now())
}

/// A fresh id whose time prefix encodes `at`.
pub fn generate_at(at: DateTime<Utc>) -> String {
    let millis = at.timestamp_millis().clamp(0, MAX_MILLIS) as u128;
    let entropy = rand::thread_rng().r#gen::<u128>() & ((1u128 << ENTROPY_BITS) - 1);
    let mut value = (millis << ENTROPY_BITS) | entropy;

    let mut out = [0u8; 26];
    for slot in out.iter_mut().rev() {
        *slot = CROCKFORD[(value & 0x1F) as usize];
        value >>= 5;
    }
    out.iter().copied().map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_crockford_strings() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), 26);
        assert_ne!(a, b);
        assert!(a.bytes().all(|c| CROCKFORD.contains(&c)), "{a}");
    }

    #[test]
    fn time_prefix_sorts_by_creation() {
        let early = generate_at(DateTime::from_timestamp_millis(1_000).unwrap());
        let late = generate_at(DateTime::from_timestamp_millis(2_000).unwrap());
        assert!(early[..10] < late[..10], "{early} vs {late}");
        // Millisecond zero encodes as all zeros.
        let epoch = generate_at(DateTime::from_timestamp_millis(0).unwrap());
        assert_eq!(&epoch[..10], "0000000000");
    }
}
