//! Core type definitions for syncio
//!
//! This module defines the fundamental identifiers and value types used
//! by the durable intent log and the target proxy.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Sequential identifier of an object inside one target's id space.
///
/// Unlike a content-addressed or random id, object ids on a storage
/// target are allocated as a contiguous, monotonically increasing
/// sequence; the proxy pre-creates a window of them so that object
/// creation never waits on a network round trip.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct ObjectId(u64);

impl ObjectId {
    /// Create an object id from its raw sequence number
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw sequence number
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The id immediately following this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

/// Object group (id-space qualifier) carried by every mutation.
///
/// A target may host several independent id sequences; the group
/// selects which one a mutation addresses.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into, Default,
)]
#[display("{_0}")]
pub struct ObjectGroup(u64);

impl ObjectGroup {
    /// Create a group from its raw value
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw group value
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ObjectGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectGroup({})", self.0)
    }
}

/// Ownership attributes shipped by a setattr mutation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttrs {
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
}

impl ObjectAttrs {
    /// Create attributes from owner/group ids
    #[must_use]
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// Process-incarnation marker value.
///
/// A fresh `Generation` is drawn once per proxy start and written to
/// the durable log as a sentinel record. During replay it bounds
/// "records from previous incarnations" (replayed) against "records
/// appended by this incarnation" (already tracked in memory).
///
/// The scheme assumes a single writer per log, which `IntentLog`
/// enforces by serializing appends; it would need revisiting if a log
/// ever gained concurrent writers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct Generation(Uuid);

impl Generation {
    /// Draw a new, unique generation value
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Reconstruct a generation from its raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Generation({})", self.0)
    }
}

/// Cached view of a target's free space and object capacity.
///
/// Refreshed periodically by the capacity monitor; readers always get
/// the last good snapshot, never a blocking query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    /// Total bytes on the target
    pub total_bytes: u64,
    /// Free bytes on the target
    pub free_bytes: u64,
    /// Total object slots on the target
    pub total_objects: u64,
    /// Free object slots on the target
    pub free_objects: u64,
}

impl CapacitySnapshot {
    /// Fraction of bytes still free (0.0 to 1.0)
    #[must_use]
    pub fn free_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.free_bytes as f64 / self.total_bytes as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_ordering() {
        let a = ObjectId::new(5);
        let b = a.next();
        assert!(a < b);
        assert_eq!(b.raw(), 6);
    }

    #[test]
    fn test_generation_unique() {
        assert_ne!(Generation::new(), Generation::new());
    }

    #[test]
    fn test_generation_roundtrip() {
        let generation = Generation::new();
        let bytes = *generation.as_bytes();
        assert_eq!(Generation::from_bytes(bytes), generation);
    }

    #[test]
    fn test_free_ratio() {
        let snap = CapacitySnapshot {
            total_bytes: 100,
            free_bytes: 25,
            total_objects: 10,
            free_objects: 10,
        };
        assert!((snap.free_ratio() - 0.25).abs() < f64::EPSILON);

        let empty = CapacitySnapshot {
            total_bytes: 0,
            free_bytes: 0,
            total_objects: 0,
            free_objects: 0,
        };
        assert!(empty.free_ratio().abs() < f64::EPSILON);
    }
}
