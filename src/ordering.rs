/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable linear ordering of the DAG.
//!
//! The [`Extender`] is fed every unit inserted into an epoch's DAG, in insertion order. Whenever it
//! can decide on the next timing unit, it returns a [`TimingRound`]: the timing unit together with
//! all units below it that were not ordered in an earlier round.

use std::sync::Arc;

use crate::{dag::Dag, random_source::RandomSource, types::unit::Unit};

/// A batch of units in their final order. The last unit is the timing unit of the round.
#[derive(Clone, Debug)]
pub struct TimingRound {
    units: Vec<Arc<Unit>>,
}

impl TimingRound {
    /// Wrap an ordered batch ending with its timing unit. Returns `None` for an empty batch.
    pub fn new(units: Vec<Arc<Unit>>) -> Option<TimingRound> {
        if units.is_empty() {
            None
        } else {
            Some(TimingRound { units })
        }
    }

    pub fn timing_unit(&self) -> &Arc<Unit> {
        // Never empty, see `new`.
        &self.units[self.units.len() - 1]
    }

    pub fn units(&self) -> &[Arc<Unit>] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

pub trait Extender: Send {
    /// Notify the extender of a newly inserted `unit`. Returns the rounds that became decided.
    fn add_unit(&mut self, unit: &Arc<Unit>) -> Vec<TimingRound>;
}

pub trait ExtenderFactory: Send + Sync {
    fn new_extender(&self, dag: &Arc<Dag>, random_source: &Arc<dyn RandomSource>) -> Box<dyn Extender>;
}
