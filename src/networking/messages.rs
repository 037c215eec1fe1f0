/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Wire formats for batches of units and the sync summary exchanged during gossip.
//!
//! A chunk is a `u32` count followed by that many borsh-encoded [`Preunit`]s. Units in a chunk are
//! sorted by ascending epoch and topologically within an epoch, so that a receiver can admit them in
//! order without parking any of them in the buffer zone.

use std::{
    collections::HashSet,
    io,
    sync::Arc,
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    data_types::{CryptoHash, EpochID},
    unit::{Preunit, Unit},
};

/// Smallest possible encoding of a preunit: id, signature, an empty crown, and two empty fields.
const MIN_PREUNIT_LEN: usize = 8 + 64 + 2 + 32 + 4 + 4;

/// Summary of a DAG: the maximal height of every creator in one epoch.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct DagInfo {
    pub epoch: EpochID,
    pub heights: Vec<Option<u32>>,
}

#[derive(Debug)]
pub enum DecodeError {
    /// The byte stream is truncated or contains a field violating a size cap.
    Malformed(io::Error),

    /// The stream contains bytes after the last preunit.
    TrailingBytes(usize),
}

impl From<io::Error> for DecodeError {
    fn from(value: io::Error) -> Self {
        DecodeError::Malformed(value)
    }
}

/// Encode `units` as a chunk, sorting them by epoch and then parents before children.
pub fn encode_chunk(units: &[Arc<Unit>]) -> io::Result<Vec<u8>> {
    let sorted = sort_for_transmission(units);
    let mut bytes = Vec::new();
    (sorted.len() as u32).serialize(&mut bytes)?;
    for unit in sorted {
        unit.preunit().serialize(&mut bytes)?;
    }
    Ok(bytes)
}

pub fn decode_chunk(bytes: &[u8]) -> Result<Vec<Preunit>, DecodeError> {
    let mut reader = bytes;
    let count = u32::deserialize_reader(&mut reader)? as usize;
    let mut preunits = Vec::with_capacity(count.min(bytes.len() / MIN_PREUNIT_LEN));
    for _ in 0..count {
        preunits.push(Preunit::deserialize_reader(&mut reader)?);
    }
    if !reader.is_empty() {
        return Err(DecodeError::TrailingBytes(reader.len()));
    }
    Ok(preunits)
}

/// Stable order by epoch, then a depth-first post-order over the parents present in `units`.
fn sort_for_transmission(units: &[Arc<Unit>]) -> Vec<Arc<Unit>> {
    let mut by_epoch: Vec<&Arc<Unit>> = units.iter().collect();
    by_epoch.sort_by_key(|unit| (unit.epoch(), unit.height()));

    let present: HashSet<CryptoHash> = units.iter().map(|unit| unit.hash()).collect();
    let mut emitted = HashSet::new();
    let mut sorted = Vec::with_capacity(units.len());

    for root in by_epoch {
        let mut stack: Vec<(&Arc<Unit>, bool)> = vec![(root, false)];
        while let Some((unit, expanded)) = stack.pop() {
            if emitted.contains(&unit.hash()) {
                continue;
            }
            if expanded {
                emitted.insert(unit.hash());
                sorted.push(unit.clone());
                continue;
            }
            stack.push((unit, true));
            for parent in unit.parents().iter().flatten() {
                if present.contains(&parent.hash()) && !emitted.contains(&parent.hash()) {
                    stack.push((parent, false));
                }
            }
        }
    }
    sorted
}
