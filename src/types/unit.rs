/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [`Preunit`] and [`Unit`] types and their associated methods.
//!
//! A `Preunit` is what travels over the network: a signed claim by a creator that it produced a unit
//! at some height of some epoch, referencing its parents only by their heights (the [`Crown`]). A
//! `Unit` is a `Preunit` whose parents have been resolved against a DAG, and which therefore also
//! knows its level.

use std::{
    collections::HashSet,
    fmt::{self, Debug, Formatter},
    io::{self, Read, Write},
    sync::Arc,
};

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::{combine_hashes, is_correctly_signed, CryptoHasher, Digest, Keypair, VerifyingKey},
    data_types::{minimal_quorum, CryptoHash, EpochID, ProcessID, SignatureBytes, UnitID},
};

/// Height value written on the wire for "this creator is not a parent".
pub const NO_PARENT: u32 = u32::MAX;

/// Maximum size of the application data carried by a single unit.
pub const MAX_DATA_LEN: u32 = 2_000_000;

/// Maximum size of the random source data carried by a single unit.
pub const MAX_RANDOM_SOURCE_DATA_LEN: u32 = 1_000_000;

/// The heights of a unit's parents, one slot per process, plus the combined hash of those parents.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Crown {
    heights: Vec<Option<u32>>,
    control_hash: CryptoHash,
}

impl Crown {
    pub fn new(heights: Vec<Option<u32>>, control_hash: CryptoHash) -> Crown {
        Crown {
            heights,
            control_hash,
        }
    }

    /// Crown of a unit with the given (resolved) `parents`.
    pub fn from_parents(parents: &[Option<Arc<Unit>>]) -> Crown {
        let heights = parents
            .iter()
            .map(|parent| parent.as_ref().map(|parent| parent.height()))
            .collect();
        let control_hash = combine_hashes(
            parents
                .iter()
                .map(|parent| parent.as_ref().map(|parent| parent.hash_ref())),
        );
        Crown::new(heights, control_hash)
    }

    pub fn heights(&self) -> &[Option<u32>] {
        &self.heights
    }

    pub fn control_hash(&self) -> &CryptoHash {
        &self.control_hash
    }

    pub fn nproc(&self) -> usize {
        self.heights.len()
    }

    /// Wire encoding: `u16 nproc`, `nproc × u32 height` (with [`NO_PARENT`]), 32 byte control hash.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + 4 * self.heights.len() + 32);
        bytes.extend_from_slice(&(self.heights.len() as u16).to_le_bytes());
        for height in &self.heights {
            bytes.extend_from_slice(&height.unwrap_or(NO_PARENT).to_le_bytes());
        }
        bytes.extend_from_slice(&self.control_hash.bytes());
        bytes
    }
}

impl BorshSerialize for Crown {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }
}

impl BorshDeserialize for Crown {
    fn deserialize_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let nproc = u16::deserialize_reader(reader)?;
        let mut heights = Vec::with_capacity(nproc as usize);
        for _ in 0..nproc {
            let height = u32::deserialize_reader(reader)?;
            heights.push(if height == NO_PARENT { None } else { Some(height) });
        }
        let control_hash = CryptoHash::deserialize_reader(reader)?;
        Ok(Crown::new(heights, control_hash))
    }
}

/// A signed unit as received from the network, before its parents are known.
#[derive(Clone, PartialEq, Eq)]
pub struct Preunit {
    id: UnitID,
    signature: SignatureBytes,
    crown: Crown,
    data: Vec<u8>,
    random_source_data: Vec<u8>,
    hash: CryptoHash,
}

impl Preunit {
    /// Assemble a preunit from its wire fields. The signature is not checked here.
    pub fn new(
        id: UnitID,
        crown: Crown,
        data: Vec<u8>,
        random_source_data: Vec<u8>,
        signature: SignatureBytes,
    ) -> Preunit {
        let hash = Preunit::compute_hash(id, &crown, &data, &random_source_data);
        Preunit {
            id,
            signature,
            crown,
            data,
            random_source_data,
            hash,
        }
    }

    /// Create a preunit and sign its hash with `keypair`.
    pub fn signed(
        id: UnitID,
        crown: Crown,
        data: Vec<u8>,
        random_source_data: Vec<u8>,
        keypair: &Keypair,
    ) -> Preunit {
        let hash = Preunit::compute_hash(id, &crown, &data, &random_source_data);
        let signature = keypair.sign(&hash.bytes());
        Preunit {
            id,
            signature,
            crown,
            data,
            random_source_data,
            hash,
        }
    }

    fn compute_hash(
        id: UnitID,
        crown: &Crown,
        data: &[u8],
        random_source_data: &[u8],
    ) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(id.int().to_le_bytes());
        hasher.update(crown.to_bytes());
        hasher.update((data.len() as u32).to_le_bytes());
        hasher.update(data);
        hasher.update((random_source_data.len() as u32).to_le_bytes());
        hasher.update(random_source_data);
        CryptoHash::new(hasher.finalize().into())
    }

    pub fn hash(&self) -> CryptoHash {
        self.hash
    }

    pub fn id(&self) -> UnitID {
        self.id
    }

    pub fn creator(&self) -> ProcessID {
        self.id.creator()
    }

    pub fn height(&self) -> u32 {
        self.id.height()
    }

    pub fn epoch(&self) -> EpochID {
        self.id.epoch()
    }

    pub fn crown(&self) -> &Crown {
        &self.crown
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn random_source_data(&self) -> &[u8] {
        &self.random_source_data
    }

    pub fn signature(&self) -> &SignatureBytes {
        &self.signature
    }

    /// A dealing unit is the first unit of its creator in an epoch.
    pub fn is_dealing(&self) -> bool {
        self.height() == 0
    }

    /// Check the signature against the public key of the claimed creator.
    pub fn verify(&self, verifying_key: &VerifyingKey) -> bool {
        is_correctly_signed(verifying_key, &self.hash.bytes(), &self.signature)
    }
}

impl Debug for Preunit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preunit")
            .field("id", &self.id)
            .field("hash", &self.hash)
            .finish()
    }
}

impl BorshSerialize for Preunit {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.id.serialize(writer)?;
        self.signature.serialize(writer)?;
        self.crown.serialize(writer)?;
        self.data.serialize(writer)?;
        self.random_source_data.serialize(writer)
    }
}

impl BorshDeserialize for Preunit {
    fn deserialize_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let id = UnitID::deserialize_reader(reader)?;
        let signature = SignatureBytes::deserialize_reader(reader)?;
        let crown = Crown::deserialize_reader(reader)?;
        let data = read_capped_bytes(reader, MAX_DATA_LEN)?;
        let random_source_data = read_capped_bytes(reader, MAX_RANDOM_SOURCE_DATA_LEN)?;
        Ok(Preunit::new(id, crown, data, random_source_data, signature))
    }
}

/// Read a `u32` length prefix followed by that many bytes, refusing lengths above `cap` before
/// allocating.
fn read_capped_bytes<R: Read>(reader: &mut R, cap: u32) -> io::Result<Vec<u8>> {
    let len = u32::deserialize_reader(reader)?;
    if len > cap {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("field of {} bytes exceeds the limit of {} bytes", len, cap),
        ));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// A unit whose parents have been resolved. Units are shared as `Arc<Unit>` and never mutated once
/// built; parent links only point to strictly older units so they can never form a cycle.
pub struct Unit {
    preunit: Preunit,
    parents: Vec<Option<Arc<Unit>>>,
    level: u32,
}

impl Unit {
    /// Create and sign a new unit on top of `parents`. Used by the local creator.
    pub fn new(
        creator: ProcessID,
        epoch: EpochID,
        parents: Vec<Option<Arc<Unit>>>,
        level: u32,
        data: Vec<u8>,
        random_source_data: Vec<u8>,
        keypair: &Keypair,
    ) -> Unit {
        let height = match &parents[creator.index()] {
            Some(predecessor) => predecessor.height() + 1,
            None => 0,
        };
        let crown = Crown::from_parents(&parents);
        let preunit = Preunit::signed(
            UnitID::new(height, creator, epoch),
            crown,
            data,
            random_source_data,
            keypair,
        );
        Unit {
            preunit,
            parents,
            level,
        }
    }

    /// Attach resolved `parents` to a received `preunit`, computing its level. Performs no validation.
    pub(crate) fn from_preunit(preunit: Preunit, parents: Vec<Option<Arc<Unit>>>) -> Unit {
        let level = level_from_parents(&parents);
        Unit {
            preunit,
            parents,
            level,
        }
    }

    pub fn preunit(&self) -> &Preunit {
        &self.preunit
    }

    pub fn hash(&self) -> CryptoHash {
        self.preunit.hash
    }

    pub(crate) fn hash_ref(&self) -> &CryptoHash {
        &self.preunit.hash
    }

    pub fn id(&self) -> UnitID {
        self.preunit.id
    }

    pub fn creator(&self) -> ProcessID {
        self.preunit.creator()
    }

    pub fn height(&self) -> u32 {
        self.preunit.height()
    }

    pub fn epoch(&self) -> EpochID {
        self.preunit.epoch()
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn data(&self) -> &[u8] {
        self.preunit.data()
    }

    pub fn random_source_data(&self) -> &[u8] {
        self.preunit.random_source_data()
    }

    pub fn crown(&self) -> &Crown {
        self.preunit.crown()
    }

    pub fn is_dealing(&self) -> bool {
        self.preunit.is_dealing()
    }

    pub fn parents(&self) -> &[Option<Arc<Unit>>] {
        &self.parents
    }

    pub fn parent(&self, process: ProcessID) -> Option<&Arc<Unit>> {
        self.parents.get(process.index()).and_then(Option::as_ref)
    }

    /// The previous unit of the same creator.
    pub fn predecessor(&self) -> Option<&Arc<Unit>> {
        self.parent(self.creator())
    }

    /// Whether `other` is reachable from this unit by following parent links (every unit is above
    /// itself).
    pub fn above(&self, other: &Unit) -> bool {
        if self.hash() == other.hash() {
            return true;
        }
        if self.level < other.level {
            return false;
        }
        let mut visited = HashSet::new();
        let mut stack: Vec<&Unit> = vec![self];
        while let Some(unit) = stack.pop() {
            for parent in unit.parents.iter().flatten() {
                if parent.hash() == other.hash() {
                    return true;
                }
                if parent.level < other.level {
                    continue;
                }
                if visited.insert(parent.hash()) {
                    stack.push(parent.as_ref());
                }
            }
        }
        false
    }
}

impl Debug for Unit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id())
            .field("level", &self.level)
            .field("hash", &self.hash())
            .finish()
    }
}

/// Level of a unit built on `parents`: `0` without parents; otherwise the maximal parent level `m`,
/// plus one if a quorum of the parents sit on level `m`.
pub fn level_from_parents(parents: &[Option<Arc<Unit>>]) -> u32 {
    let quorum = minimal_quorum(parents.len());
    let max_level = match parents.iter().flatten().map(|parent| parent.level()).max() {
        Some(max_level) => max_level,
        None => return 0,
    };
    let on_max_level = parents
        .iter()
        .flatten()
        .filter(|parent| parent.level() == max_level)
        .count();
    if on_max_level >= quorum {
        max_level + 1
    } else {
        max_level
    }
}
