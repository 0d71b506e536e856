//! # Shard Routing
//!
//! Maps a workflow to the history shard that owns it.
//!
//! The mapping must agree bit-for-bit with the workflow engine: a task routed
//! to the wrong shard lands on a partition whose consumer does not own the
//! workflow and is silently dropped. The engine fingerprints the workflow ID
//! with FarmHash `Fingerprint32` and reduces it modulo the shard count.
//!
//! The `farmhash` crate adds the bytes of inputs up to four bytes long as
//! unsigned values where the reference implementation sign-extends them, so
//! that length class is fingerprinted here.

use crate::AdminError;

#[cfg(test)]
#[path = "shard_tests.rs"]
mod tests;

/// Identifier of a history shard, in `[0, number_of_shards)`
pub type ShardId = i32;

/// Deterministic workflow to shard mapping for a fixed shard count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    number_of_shards: u32,
}

impl ShardRouter {
    /// Create a router for a cluster with `number_of_shards` shards.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::InvalidConfiguration`] when the count is not positive.
    pub fn new(number_of_shards: i32) -> Result<Self, AdminError> {
        if number_of_shards <= 0 {
            return Err(AdminError::invalid_configuration(format!(
                "number of shards must be positive, got {}",
                number_of_shards
            )));
        }

        Ok(Self {
            number_of_shards: number_of_shards as u32,
        })
    }

    pub fn number_of_shards(&self) -> i32 {
        self.number_of_shards as i32
    }

    /// Shard owning `workflow_id`
    pub fn shard_for(&self, workflow_id: &str) -> ShardId {
        let fingerprint = fingerprint32(workflow_id.as_bytes());
        (fingerprint % self.number_of_shards) as ShardId
    }
}

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// FarmHash `Fingerprint32` as computed by the workflow engine
pub fn fingerprint32(bytes: &[u8]) -> u32 {
    if bytes.len() > 4 {
        return farmhash::fingerprint32(bytes);
    }

    let mut b: u32 = 0;
    let mut c: u32 = 9;
    for &byte in bytes {
        b = b.wrapping_mul(C1).wrapping_add(byte as i8 as u32);
        c ^= b;
    }
    fmix(mur(b, mur(bytes.len() as u32, c)))
}

fn mur(a: u32, h: u32) -> u32 {
    let a = a.wrapping_mul(C1).rotate_right(17).wrapping_mul(C2);
    (h ^ a).rotate_right(19).wrapping_mul(5).wrapping_add(0xe654_6b64)
}

fn fmix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^ (h >> 16)
}

/// One-shot form of [`ShardRouter::shard_for`]
pub fn shard_for(workflow_id: &str, number_of_shards: i32) -> Result<ShardId, AdminError> {
    Ok(ShardRouter::new(number_of_shards)?.shard_for(workflow_id))
}
