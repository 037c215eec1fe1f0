/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-epoch, append-only DAG of units.
//!
//! A [`Dag`] indexes its units three ways:
//! 1. By hash, for global lookup.
//! 2. By height and by level, in [fiber maps](fiber_map) holding one slot per creator.
//! 3. By creator, keeping the currently maximal units of every creator (more than one only under
//!    forks).
//!
//! ## Inserting a unit
//!
//! Inserting a received preunit takes four steps, which the [`Adder`](crate::adder::Adder) drives:
//! 1. [`decode_parents`](Dag::decode_parents): resolve the crown's heights into concrete units.
//! 2. [`build_unit`](Dag::build_unit): attach the parents and compute the level.
//! 3. [`check`](Dag::check): run the configured [`UnitChecker`]s.
//! 4. [`insert`](Dag::insert): update the indices and run the insertion hooks.
//!
//! Units already stored are never mutated. Insertion hooks run synchronously inside `insert`; the
//! epoch uses them to feed the extender and the creator's unit belt.

pub mod checks;

pub mod fiber_map;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::types::{
    data_types::{minimal_quorum, CryptoHash, EpochID, ProcessID, UnitID},
    unit::{Preunit, Unit},
};

use self::{
    checks::{CheckError, UnitChecker},
    fiber_map::{FiberMap, SlottedUnits},
};

/// Callback invoked with every unit inserted into a [`Dag`].
pub type InsertHook = Box<dyn Fn(&Arc<Unit>) + Send + Sync>;

/// Number of height and level fibers allocated up front.
const INITIAL_FIBERS: usize = 10;

pub struct Dag {
    nproc: usize,
    epoch: EpochID,
    units: RwLock<HashMap<CryptoHash, Arc<Unit>>>,
    height_units: FiberMap,
    level_units: FiberMap,
    max_units: SlottedUnits,
    checks: RwLock<Vec<Box<dyn UnitChecker>>>,
    pre_insert: RwLock<Vec<InsertHook>>,
    post_insert: RwLock<Vec<InsertHook>>,
}

/// The ways resolving a preunit's parents can fail.
#[derive(Debug)]
pub enum DecodeParentsError {
    /// The preunit is already in the DAG.
    DuplicateUnit(Arc<Unit>),

    /// This many parent slots referenced by the crown are empty.
    UnknownParents(usize),

    /// At least one parent slot holds several units (a fork). Contains the candidates of every slot,
    /// indexed by creator, so that the caller can disambiguate.
    AmbiguousParents(Vec<Vec<Arc<Unit>>>),

    /// The crown does not have one slot per process.
    InvalidCrown { expected: usize, got: usize },
}

impl Dag {
    /// Create an empty DAG for `nproc` processes and `epoch`, without any checks or hooks.
    pub fn new(nproc: usize, epoch: EpochID) -> Dag {
        Dag {
            nproc,
            epoch,
            units: RwLock::new(HashMap::new()),
            height_units: FiberMap::new(nproc, INITIAL_FIBERS),
            level_units: FiberMap::new(nproc, INITIAL_FIBERS),
            max_units: SlottedUnits::new(nproc),
            checks: RwLock::new(Vec::new()),
            pre_insert: RwLock::new(Vec::new()),
            post_insert: RwLock::new(Vec::new()),
        }
    }

    pub fn nproc(&self) -> usize {
        self.nproc
    }

    pub fn epoch(&self) -> EpochID {
        self.epoch
    }

    pub fn is_quorum(&self, count: usize) -> bool {
        count >= minimal_quorum(self.nproc)
    }

    /// Append a check to the ones run by [`check`](Self::check).
    pub fn add_check(&self, checker: Box<dyn UnitChecker>) {
        self.checks.write().unwrap().push(checker);
    }

    /// Register a hook run before a unit is added to the indices.
    pub fn before_insert(&self, hook: InsertHook) {
        self.pre_insert.write().unwrap().push(hook);
    }

    /// Register a hook run after a unit was added to the indices.
    pub fn after_insert(&self, hook: InsertHook) {
        self.post_insert.write().unwrap().push(hook);
    }

    /// Drop every registered hook. Hooks may hold references back to the epoch that owns this DAG.
    pub(crate) fn clear_hooks(&self) {
        self.pre_insert.write().unwrap().clear();
        self.post_insert.write().unwrap().clear();
    }

    /// Resolve the heights in `preunit`'s crown into parent units.
    pub fn decode_parents(
        &self,
        preunit: &Preunit,
    ) -> Result<Vec<Option<Arc<Unit>>>, DecodeParentsError> {
        if let Some(unit) = self.get_unit(&preunit.hash()) {
            return Err(DecodeParentsError::DuplicateUnit(unit));
        }
        let heights = preunit.crown().heights();
        if heights.len() != self.nproc {
            return Err(DecodeParentsError::InvalidCrown {
                expected: self.nproc,
                got: heights.len(),
            });
        }
        let (candidates, unknown) = self.height_units.get(heights);
        if unknown > 0 {
            return Err(DecodeParentsError::UnknownParents(unknown));
        }
        if candidates.iter().any(|slot| slot.len() > 1) {
            return Err(DecodeParentsError::AmbiguousParents(candidates));
        }
        Ok(candidates
            .into_iter()
            .map(|mut slot| slot.pop())
            .collect())
    }

    /// Attach `parents` to `preunit`. Performs no validation.
    pub fn build_unit(&self, preunit: Preunit, parents: Vec<Option<Arc<Unit>>>) -> Unit {
        Unit::from_preunit(preunit, parents)
    }

    /// Run every configured check on `unit`, returning the first failure.
    pub fn check(&self, unit: &Unit) -> Result<(), CheckError> {
        for checker in self.checks.read().unwrap().iter() {
            checker.check(unit, self)?;
        }
        Ok(())
    }

    /// Add `unit` to the DAG. Must only be called on units that passed [`check`](Self::check), and
    /// never concurrently for two units of the same creator.
    pub fn insert(&self, unit: Unit) -> Arc<Unit> {
        let unit = Arc::new(unit);
        for hook in self.pre_insert.read().unwrap().iter() {
            hook(&unit);
        }

        self.height_units
            .add(unit.height() as usize, unit.creator(), unit.clone());
        self.level_units
            .add(unit.level() as usize, unit.creator(), unit.clone());
        self.units.write().unwrap().insert(unit.hash(), unit.clone());
        self.update_maximal(&unit);

        for hook in self.post_insert.read().unwrap().iter() {
            hook(&unit);
        }
        unit
    }

    fn update_maximal(&self, unit: &Arc<Unit>) {
        let creator = unit.creator();
        let mut maximal: Vec<Arc<Unit>> = self
            .max_units
            .get(creator)
            .into_iter()
            .filter(|other| !unit.above(other))
            .collect();
        maximal.push(unit.clone());
        self.max_units.set(creator, maximal);
    }

    pub fn get_unit(&self, hash: &CryptoHash) -> Option<Arc<Unit>> {
        self.units.read().unwrap().get(hash).cloned()
    }

    pub fn get_units(&self, hashes: &[CryptoHash]) -> Vec<Option<Arc<Unit>>> {
        let units = self.units.read().unwrap();
        hashes.iter().map(|hash| units.get(hash).cloned()).collect()
    }

    /// Every unit occupying the position `id`. More than one means the creator forked.
    pub fn get_by_id(&self, id: UnitID) -> Vec<Arc<Unit>> {
        let (height, creator, epoch) = id.decode();
        if epoch != self.epoch || creator.index() >= self.nproc {
            return Vec::new();
        }
        match self.height_units.fiber(height as usize) {
            Some(fiber) => fiber.get(creator),
            None => Vec::new(),
        }
    }

    /// The units on `level`, indexed by creator.
    pub fn units_on_level(&self, level: u32) -> Vec<Vec<Arc<Unit>>> {
        match self.level_units.fiber(level as usize) {
            Some(fiber) => fiber.snapshot(),
            None => vec![Vec::new(); self.nproc],
        }
    }

    /// Units strictly above `heights` (per creator). `None` returns every unit of the epoch.
    pub fn units_above(&self, heights: Option<&[Option<u32>]>) -> Vec<Arc<Unit>> {
        self.height_units.above(heights)
    }

    /// The currently maximal units of every creator, indexed by creator.
    pub fn maximal_units(&self) -> Vec<Vec<Arc<Unit>>> {
        self.max_units.snapshot()
    }

    /// The greatest height present for every creator.
    pub fn max_view(&self) -> Vec<Option<u32>> {
        self.max_units
            .snapshot()
            .iter()
            .map(|units| units.iter().map(|unit| unit.height()).max())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.units.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
