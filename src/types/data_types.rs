/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" types that are sent around and inspected, but have no active behavior.
//!
//! These types follow the newtype pattern and the API for using them is defined in this module.

use std::fmt::{self, Debug, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

/// Index of a process (a "committee member") in `0..nproc`. Doubles as the creator of a unit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct ProcessID(u16);

impl ProcessID {
    pub const fn new(int: u16) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u16 {
        self.0
    }

    /// Position of this process in per-process arrays such as crowns and candidate lists.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for ProcessID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for ProcessID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Number of an epoch. Every epoch runs its own, independent DAG.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct EpochID(u32);

impl EpochID {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for EpochID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for EpochID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// SHA256 digest of a unit, or the combination of the digests of a unit's parents.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The hash that stands in for a parent that does not exist.
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Bytes of an Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Compact identifier of a unit position: `(height, creator, epoch)` packed into a single `u64`.
///
/// # Layout
///
/// | bits     | field     |
/// |----------|-----------|
/// | `0..16`  | `height`  |
/// | `16..32` | `creator` |
/// | `32..64` | `epoch`   |
///
/// Two distinct units share a `UnitID` only if their creator forked.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct UnitID(u64);

impl UnitID {
    /// Largest height representable in a `UnitID`.
    pub const MAX_HEIGHT: u32 = u16::MAX as u32;

    pub fn new(height: u32, creator: ProcessID, epoch: EpochID) -> Self {
        debug_assert!(height <= Self::MAX_HEIGHT);
        Self((height as u64 & 0xFFFF) | ((creator.int() as u64) << 16) | ((epoch.int() as u64) << 32))
    }

    pub const fn from_int(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub const fn height(&self) -> u32 {
        (self.0 & 0xFFFF) as u32
    }

    pub const fn creator(&self) -> ProcessID {
        ProcessID::new(((self.0 >> 16) & 0xFFFF) as u16)
    }

    pub const fn epoch(&self) -> EpochID {
        EpochID::new((self.0 >> 32) as u32)
    }

    /// Split this id back into `(height, creator, epoch)`.
    pub const fn decode(&self) -> (u32, ProcessID, EpochID) {
        (self.height(), self.creator(), self.epoch())
    }
}

impl Debug for UnitID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.height(), self.creator(), self.epoch())
    }
}

/// Smallest number of processes whose agreement is needed for safety, `nproc - nproc/3`.
pub const fn minimal_quorum(nproc: usize) -> usize {
    nproc - nproc / 3
}

/// Smallest number of processes guaranteed to contain an honest one, `(nproc-1)/3 + 1`.
pub const fn minimal_trusted(nproc: usize) -> usize {
    (nproc - 1) / 3 + 1
}

#[test]
fn unit_id_round_trips_through_its_fields() {
    for (height, creator, epoch) in [(0, 0, 0), (7, 3, 1), (65535, 65535, u32::MAX), (12, 0, 9)] {
        let id = UnitID::new(height, ProcessID::new(creator), EpochID::new(epoch));
        assert_eq!(
            id.decode(),
            (height, ProcessID::new(creator), EpochID::new(epoch))
        );
        assert_eq!(UnitID::from_int(id.int()), id);
    }
}

#[test]
fn quorum_thresholds_tolerate_a_third_faulty() {
    assert_eq!(minimal_quorum(4), 3);
    assert_eq!(minimal_trusted(4), 1);
    assert_eq!(minimal_quorum(10), 7);
    assert_eq!(minimal_trusted(10), 3);
    assert_eq!(minimal_quorum(1), 1);
    assert_eq!(minimal_trusted(1), 1);
    assert_eq!(minimal_quorum(7), 5);
    assert_eq!(minimal_trusted(7), 3);
}
