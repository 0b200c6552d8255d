//! Hash partitioning from message key to target unit.
//!
//! The hash is a content hash of the key bytes (first eight bytes of the
//! SHA-256 digest), so the mapping is stable across processes and restarts,
//! a requirement for routing to stateful units, whose keyed state must always
//! land on the same instance. Pure and deterministic; the only failure mode
//! is an empty target set, which the caller must rule out.

use crate::message::UnitId;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Error type for partition operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartitionError {
    /// No targets to partition over.
    #[error("cannot partition over zero targets")]
    NoTargets,
}

/// Stable content hash of a key.
pub fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap_or([0; 8]))
}

/// Maps a key to a stateful unit index in `0..count`.
pub fn partition_stateful(key: &str, count: usize) -> Result<usize, PartitionError> {
    if count == 0 {
        return Err(PartitionError::NoTargets);
    }
    Ok((stable_hash(key) % count as u64) as usize)
}

/// Maps a key to one of the given target units.
pub fn partition_stateless<'a>(key: &str, targets: &'a [UnitId]) -> Result<&'a UnitId, PartitionError> {
    let index = partition_stateful(key, targets.len())?;
    Ok(&targets[index])
}
