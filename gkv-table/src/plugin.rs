//! # Pluggable Table Behavior
//!
//! The three plug-in contracts a table is parameterized by, plus the
//! built-in implementations seeded into the registries.
//!
//! Contracts:
//! - `Sharder` must be pure and deterministic: every worker computes the
//!   same shard for the same key, or routing falls apart.
//! - `Accumulator` must be associative and commutative. The same trait
//!   serves as combiner (merging local writes to one key before shipping)
//!   and reducer (merging incoming writes on the owner).
//! - `Selector` is a read-side view of a stored value and never mutates
//!   the shard.

use std::hash::BuildHasher;
use std::sync::Arc;

use ahash::RandomState;
use gkv_common::{GkvError, GkvResult, ShardId};

/// Maps key bytes to a shard index in `[0, num_shards)`.
pub trait Sharder: Send + Sync {
    fn shard_for(&self, key: &[u8], num_shards: i32) -> ShardId;
}

/// Pure binary merge over value bytes.
pub trait Accumulator: Send + Sync {
    fn fold(&self, current: &[u8], update: &[u8]) -> GkvResult<Vec<u8>>;
}

/// Read-side transform applied to stored values before return.
pub trait Selector: Send + Sync {
    fn select(&self, value: &[u8]) -> Vec<u8>;
}

impl std::fmt::Debug for dyn Sharder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sharder").finish()
    }
}

impl std::fmt::Debug for dyn Accumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accumulator").finish()
    }
}

impl std::fmt::Debug for dyn Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector").finish()
    }
}

// Fixed seeds: shard routing must agree across every worker in the
// cluster, so the hasher cannot be randomly seeded per process.
const SHARD_SEEDS: (u64, u64, u64, u64) = (
    0x6772_6964_6b76_0001,
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
    0x1656_67b1_9e37_79f9,
);

/// Default sharder: fixed-seed hash of the key bytes.
pub struct HashSharder {
    state: RandomState,
}

impl Default for HashSharder {
    fn default() -> Self {
        let (a, b, c, d) = SHARD_SEEDS;
        HashSharder {
            state: RandomState::with_seeds(a, b, c, d),
        }
    }
}

impl Sharder for HashSharder {
    fn shard_for(&self, key: &[u8], num_shards: i32) -> ShardId {
        let hash = self.state.hash_one(key);
        (hash % num_shards.max(1) as u64) as ShardId
    }
}

/// Sharder for ascii-integer keys: `key mod num_shards`. Non-numeric keys
/// fall back to hashing so mixed key spaces still route deterministically.
pub struct ModSharder {
    fallback: HashSharder,
}

impl Default for ModSharder {
    fn default() -> Self {
        ModSharder {
            fallback: HashSharder::default(),
        }
    }
}

impl Sharder for ModSharder {
    fn shard_for(&self, key: &[u8], num_shards: i32) -> ShardId {
        match parse_i64(key) {
            Ok(value) => value.rem_euclid(num_shards.max(1) as i64) as ShardId,
            Err(_) => self.fallback.shard_for(key, num_shards),
        }
    }
}

/// Last-writer-wins merge; the default combiner and reducer.
pub struct ReplaceAccumulator;

impl Accumulator for ReplaceAccumulator {
    fn fold(&self, _current: &[u8], update: &[u8]) -> GkvResult<Vec<u8>> {
        Ok(update.to_vec())
    }
}

/// Adds ascii-decimal i64 values.
pub struct SumAccumulator;

impl Accumulator for SumAccumulator {
    fn fold(&self, current: &[u8], update: &[u8]) -> GkvResult<Vec<u8>> {
        let merged = parse_i64(current)?.wrapping_add(parse_i64(update)?);
        Ok(merged.to_string().into_bytes())
    }
}

/// Keeps the maximum of ascii-decimal i64 values.
pub struct MaxAccumulator;

impl Accumulator for MaxAccumulator {
    fn fold(&self, current: &[u8], update: &[u8]) -> GkvResult<Vec<u8>> {
        let merged = parse_i64(current)?.max(parse_i64(update)?);
        Ok(merged.to_string().into_bytes())
    }
}

/// Concatenates value bytes in merge order.
pub struct AppendAccumulator;

impl Accumulator for AppendAccumulator {
    fn fold(&self, current: &[u8], update: &[u8]) -> GkvResult<Vec<u8>> {
        let mut merged = Vec::with_capacity(current.len() + update.len());
        merged.extend_from_slice(current);
        merged.extend_from_slice(update);
        Ok(merged)
    }
}

/// Returns the stored value unchanged; the default selector.
pub struct IdentitySelector;

impl Selector for IdentitySelector {
    fn select(&self, value: &[u8]) -> Vec<u8> {
        value.to_vec()
    }
}

/// Returns the stored value's byte length as ascii decimal.
pub struct LengthSelector;

impl Selector for LengthSelector {
    fn select(&self, value: &[u8]) -> Vec<u8> {
        value.len().to_string().into_bytes()
    }
}

/// Shared arc-ed instances for the registry defaults.
pub(crate) fn identity_selector() -> Arc<dyn Selector> {
    Arc::new(IdentitySelector)
}

pub(crate) fn replace_accumulator() -> Arc<dyn Accumulator> {
    Arc::new(ReplaceAccumulator)
}

fn parse_i64(data: &[u8]) -> GkvResult<i64> {
    let text = std::str::from_utf8(data)
        .map_err(|_| GkvError::Value("value is not utf-8".to_string()))?;
    text.trim()
        .parse::<i64>()
        .map_err(|_| GkvError::Value(format!("not an integer: {text:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_sharder_is_deterministic_across_instances() {
        let a = HashSharder::default();
        let b = HashSharder::default();
        for key in [&b"alpha"[..], b"beta", b"", b"a longer key with spaces"] {
            assert_eq!(a.shard_for(key, 16), b.shard_for(key, 16));
            let shard = a.shard_for(key, 16);
            assert!((0..16).contains(&shard));
        }
    }

    #[test]
    fn mod_sharder_uses_numeric_keys_directly() {
        let sharder = ModSharder::default();
        assert_eq!(sharder.shard_for(b"10", 4), 2);
        assert_eq!(sharder.shard_for(b"-1", 4), 3);
        // Non-numeric keys still land somewhere stable.
        let shard = sharder.shard_for(b"word", 4);
        assert_eq!(shard, sharder.shard_for(b"word", 4));
    }

    #[test]
    fn sum_and_max_fold_ascii_integers() {
        assert_eq!(SumAccumulator.fold(b"1", b"2").unwrap(), b"3");
        assert_eq!(SumAccumulator.fold(b"-5", b"3").unwrap(), b"-2");
        assert_eq!(MaxAccumulator.fold(b"5", b"7").unwrap(), b"7");
        assert_eq!(MaxAccumulator.fold(b"7", b"5").unwrap(), b"7");
    }

    #[test]
    fn sum_rejects_non_numeric_values() {
        let err = SumAccumulator.fold(b"one", b"2").unwrap_err();
        assert!(matches!(err, GkvError::Value(_)));
    }

    #[test]
    fn replace_and_append_semantics() {
        assert_eq!(ReplaceAccumulator.fold(b"old", b"new").unwrap(), b"new");
        assert_eq!(AppendAccumulator.fold(b"ab", b"cd").unwrap(), b"abcd");
    }

    #[test]
    fn selectors_transform_reads_only() {
        assert_eq!(IdentitySelector.select(b"value"), b"value");
        assert_eq!(LengthSelector.select(b"value"), b"5");
    }
}
