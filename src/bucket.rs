//! Deterministic bucketing of users.
//!
//! Every hash-based decision in the engine goes through these two functions, so a given
//! `(scope_key, user_id)` pair lands in the same bucket on every host and every call.

use sha1::{Digest, Sha1};

const COARSE_BUCKETS: i64 = 100;
const FINE_BUCKETS: i64 = 10_000;

fn hash(scope_key: &str, user_id: &str) -> i64 {
    let mut hash = Sha1::new();
    hash.update(scope_key.as_bytes());
    hash.update(b":");
    hash.update(user_id.as_bytes());

    let digest = hash.finalize();
    let hexhash = base16ct::lower::encode_string(&digest);

    // 15 hex digits always fit in a non-negative i64
    let hexhash_15 = &hexhash[..15];
    i64::from_str_radix(hexhash_15, 16).unwrap_or_default()
}

/// Maps a user into one of 100 buckets, `0..=99`.
pub fn bucket(scope_key: &str, user_id: &str) -> u8 {
    (hash(scope_key, user_id) % COARSE_BUCKETS) as u8
}

/// Maps a user onto `[0.00, 99.99]` in steps of 0.01, for weighted selection.
pub fn fine_bucket(scope_key: &str, user_id: &str) -> f64 {
    (hash(scope_key, user_id) % FINE_BUCKETS) as f64 / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use spectral::prelude::*;

    #[test]
    fn bucket_is_deterministic() {
        let first = bucket("exp1", "u1");
        for _ in 0..10 {
            assert_eq!(bucket("exp1", "u1"), first);
        }
        assert_eq!(fine_bucket("exp1", "u1"), fine_bucket("exp1", "u1"));
    }

    #[test]
    fn scope_key_changes_the_bucket_distribution() {
        let moved = (0..1000)
            .map(|i| format!("user-{}", i))
            .filter(|user| fine_bucket("exp1", user) != fine_bucket("exp1_variant", user))
            .count();
        asserting!("independently salted buckets should disagree for almost every user")
            .that(&moved)
            .is_greater_than(950);
    }

    #[test]
    fn buckets_are_roughly_uniform() {
        let mut counts = [0_u32; 10];
        for i in 0..100_000 {
            let b = bucket("uniformity", &format!("user-{}", i));
            counts[(b / 10) as usize] += 1;
        }
        for count in counts {
            assert_that!(count).is_greater_than(9_500);
            assert_that!(count).is_less_than(10_500);
        }
    }

    proptest! {
        #[test]
        fn bucket_stays_in_range(scope in ".*", user in ".*") {
            let b = bucket(&scope, &user);
            prop_assert!(b < 100);
        }

        #[test]
        fn fine_bucket_stays_in_range(scope in ".*", user in ".*") {
            let b = fine_bucket(&scope, &user);
            prop_assert!((0.0..=99.99).contains(&b));
            // two decimal places at most
            prop_assert!(((b * 100.0).round() - b * 100.0).abs() < 1e-6);
        }
    }
}
