/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable source of shared randomness.
//!
//! A random source supplies two things: the random-source data a process attaches to each of its
//! units, and, once enough such data is present in the DAG, the random bytes that the
//! [`Extender`](crate::ordering::Extender) uses to pick timing units. A fresh random source is made
//! for every epoch by a [`RandomSourceFactory`].

use std::sync::Arc;

use crate::{
    dag::Dag,
    types::{
        data_types::{EpochID, ProcessID},
        unit::Unit,
    },
};

#[derive(Debug)]
pub enum RandomSourceError {
    /// The data for a unit on `level` cannot be produced yet, e.g. because the shares it depends on
    /// are not in the DAG.
    NotReady { level: u32 },

    /// The random source failed for another reason.
    Failed(String),
}

pub trait RandomSource: Send + Sync {
    /// Random bytes for `process` on `level`, or `None` if the DAG does not hold enough data yet.
    fn random_bytes(&self, process: ProcessID, level: u32) -> Option<Vec<u8>>;

    /// The random-source data to put into a new unit with `parents` on `level`.
    fn data_to_include(
        &self,
        parents: &[Option<Arc<Unit>>],
        level: u32,
    ) -> Result<Vec<u8>, RandomSourceError>;
}

pub trait RandomSourceFactory: Send + Sync {
    /// Create the random source of the epoch owning `dag`.
    fn new_random_source(&self, dag: &Arc<Dag>) -> Arc<dyn RandomSource>;

    /// The random-source data to put into this process's dealing unit of `epoch`.
    fn dealing_data(&self, epoch: EpochID) -> Result<Vec<u8>, RandomSourceError>;
}
