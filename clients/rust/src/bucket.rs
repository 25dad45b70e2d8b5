//! Deterministic rollout bucketing.
//!
//! A bucket is a number in `[0, 100)` derived only from the user identifier
//! and the flag key, so a user's rollout membership never changes between
//! calls or process restarts.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Number of rollout buckets; percentages are compared against this range.
pub const BUCKET_COUNT: u8 = 100;

/// Hash used to place a `(user_id, flag_key)` pair into a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucketing {
    /// `hash * 31 + code_unit` over UTF-16 code units with 32-bit wraparound.
    /// Reproducible across implementations that share rollout state.
    #[default]
    Rolling,
    /// SHA-1 digest reduced modulo 100.
    Sha1,
}

impl Bucketing {
    /// Bucket for `user_id` concatenated with `flag_key`.
    pub fn bucket(self, user_id: &str, flag_key: &str) -> u8 {
        let input = format!("{user_id}{flag_key}");
        match self {
            Bucketing::Rolling => rolling_bucket(&input),
            Bucketing::Sha1 => sha1_bucket(&input),
        }
    }
}

/// Rolling 31-multiplier hash folded into `[0, 100)`.
pub fn rolling_bucket(input: &str) -> u8 {
    let hash = input
        .encode_utf16()
        .fold(0i32, |hash, unit| {
            hash.wrapping_mul(31).wrapping_add(i32::from(unit))
        });
    // remainder first so i32::MIN cannot overflow
    (hash % i32::from(BUCKET_COUNT)).unsigned_abs() as u8
}

/// SHA-1 of the input, reduced to `[0, 100)` one byte at a time.
pub fn sha1_bucket(input: &str) -> u8 {
    let digest = Sha1::digest(input.as_bytes());
    let modulus = u32::from(BUCKET_COUNT);
    let mut acc: u32 = 0;
    for byte in digest.iter() {
        acc = (acc * 256 + u32::from(*byte)) % modulus;
    }
    acc as u8
}
