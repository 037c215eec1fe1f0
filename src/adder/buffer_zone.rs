/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The staging area of preunits whose parents are not all in the DAG yet.
//!
//! Every staged preunit (a [`WaitingPreunit`]) counts two kinds of unresolved parents:
//! - *Missing* parents: positions that no staged preunit and no unit in the DAG occupies. Each such
//!   position has a [`MissingPreunit`] record listing the preunits that need it, and is fetched from
//!   the network at most once per fetch interval.
//! - *Waiting* parents: positions occupied by another staged preunit. The parent lists the preunit
//!   among its children.
//!
//! A preunit becomes ready, and is handed to its creator's worker, exactly once: when both counts
//! drop to zero. When a worker fails to insert a preunit, the preunit is dropped along with every
//! staged descendant that has no other variant of the failed position left to build on. A child
//! of a forked position waits on every staged variant, and may still be inserted on top of the one
//! that succeeds.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    alerter::Alerter,
    dag::Dag,
    networking::syncer::Syncer,
    types::{
        data_types::{CryptoHash, ProcessID, UnitID},
        unit::Preunit,
    },
};

use super::AddPreunitError;

/// A preunit whose parents are all in the DAG, queued for its creator's worker.
pub(crate) struct ReadyPreunit {
    pub(crate) hash: CryptoHash,
    pub(crate) preunit: Arc<Preunit>,
    pub(crate) source: ProcessID,
}

struct WaitingPreunit {
    preunit: Arc<Preunit>,
    source: ProcessID,
    missing_parents: usize,
    waiting_parents: usize,
    children: Vec<CryptoHash>,
    /// Positions with a [`MissingPreunit`] record listing this preunit.
    missing_ids: Vec<UnitID>,
    /// Positions where a staged parent was inserted.
    inserted_parents: Vec<UnitID>,
}

impl WaitingPreunit {
    fn is_ready(&self) -> bool {
        self.missing_parents == 0 && self.waiting_parents == 0
    }

    fn to_ready(&self) -> ReadyPreunit {
        ReadyPreunit {
            hash: self.preunit.hash(),
            preunit: self.preunit.clone(),
            source: self.source,
        }
    }
}

struct MissingPreunit {
    needed_by: Vec<CryptoHash>,
    requested: Option<Instant>,
}

impl MissingPreunit {
    fn new() -> MissingPreunit {
        MissingPreunit {
            needed_by: Vec::new(),
            requested: None,
        }
    }
}

pub(crate) struct BufferZone {
    fetch_interval: Duration,
    waiting: HashMap<CryptoHash, WaitingPreunit>,
    waiting_by_id: HashMap<UnitID, Vec<CryptoHash>>,
    missing: HashMap<UnitID, MissingPreunit>,
}

impl BufferZone {
    pub(crate) fn new(fetch_interval: Duration) -> BufferZone {
        BufferZone {
            fetch_interval,
            waiting: HashMap::new(),
            waiting_by_id: HashMap::new(),
            missing: HashMap::new(),
        }
    }

    /// Stage `preunit`, received from `source`.
    ///
    /// Returns the preunit as ready if all its parents are already in `dag`. Returns
    /// [`AddPreunitError::UnknownParents`] if some parent positions are not occupied by anything yet;
    /// in that case the preunit stays staged, and the missing parents are requested from `source`.
    pub(crate) fn add_to_waiting(
        &mut self,
        preunit: Preunit,
        source: ProcessID,
        dag: &Dag,
        alerter: &dyn Alerter,
        syncer: &dyn Syncer,
        now: Instant,
    ) -> Result<Option<ReadyPreunit>, AddPreunitError> {
        let hash = preunit.hash();
        if self.waiting.contains_key(&hash) {
            return Err(AddPreunitError::DuplicatePreunit(hash));
        }
        if dag.get_unit(&hash).is_some() {
            return Err(AddPreunitError::DuplicateUnit(hash));
        }
        self.report_forks(&preunit, dag, alerter);

        let id = preunit.id();
        let mut waiting = WaitingPreunit {
            preunit: Arc::new(preunit),
            source,
            missing_parents: 0,
            waiting_parents: 0,
            children: Vec::new(),
            missing_ids: Vec::new(),
            inserted_parents: Vec::new(),
        };
        let missing_ids = self.check_parents(&mut waiting, hash, dag);
        self.check_if_missing(&mut waiting, id);

        let ready = waiting.is_ready().then(|| waiting.to_ready());
        self.waiting.insert(hash, waiting);
        self.waiting_by_id.entry(id).or_default().push(hash);

        if !missing_ids.is_empty() {
            let unknown = missing_ids.len();
            self.fetch_missing(source, missing_ids, syncer, now);
            return Err(AddPreunitError::UnknownParents(unknown));
        }
        Ok(ready)
    }

    /// Signal every unit, staged or inserted, that occupies the position of `preunit`.
    fn report_forks(&self, preunit: &Preunit, dag: &Dag, alerter: &dyn Alerter) {
        if let Some(hashes) = self.waiting_by_id.get(&preunit.id()) {
            for conflicting in hashes.iter().filter_map(|hash| self.waiting.get(hash)) {
                alerter.new_fork(preunit, &conflicting.preunit);
            }
        }
        for conflicting in dag.get_by_id(preunit.id()) {
            alerter.new_fork(preunit, conflicting.preunit());
        }
    }

    /// Count the parents of `waiting` that are not in `dag`, registering it as a child of staged
    /// parents and as needing the missing ones. Returns the missing ids.
    fn check_parents(&mut self, waiting: &mut WaitingPreunit, hash: CryptoHash, dag: &Dag) -> Vec<UnitID> {
        let epoch = waiting.preunit.epoch();
        let mut missing_ids = Vec::new();
        for (creator, height) in waiting.preunit.crown().heights().iter().enumerate() {
            let height = match height {
                Some(height) => *height,
                None => continue,
            };
            let id = UnitID::new(height, ProcessID::new(creator as u16), epoch);
            if !dag.get_by_id(id).is_empty() {
                continue;
            }
            match self.waiting_by_id.get(&id) {
                Some(parents) => {
                    for parent in parents {
                        if let Some(parent) = self.waiting.get_mut(parent) {
                            parent.children.push(hash);
                            waiting.waiting_parents += 1;
                        }
                    }
                }
                None => {
                    self.missing
                        .entry(id)
                        .or_insert_with(MissingPreunit::new)
                        .needed_by
                        .push(hash);
                    missing_ids.push(id);
                }
            }
        }
        waiting.missing_parents = missing_ids.len();
        waiting.missing_ids = missing_ids.clone();
        missing_ids
    }

    /// If staged preunits were missing the position of `waiting`, they now wait for it instead.
    fn check_if_missing(&mut self, waiting: &mut WaitingPreunit, id: UnitID) {
        let record = match self.missing.remove(&id) {
            Some(record) => record,
            None => return,
        };
        for child_hash in record.needed_by {
            if let Some(child) = self.waiting.get_mut(&child_hash) {
                child.missing_parents = child.missing_parents.saturating_sub(1);
                child.missing_ids.retain(|missing| *missing != id);
                child.waiting_parents += 1;
                waiting.children.push(child_hash);
            }
        }
    }

    /// Request `ids` from `source`, skipping those already requested less than a fetch interval ago.
    fn fetch_missing(&mut self, source: ProcessID, ids: Vec<UnitID>, syncer: &dyn Syncer, now: Instant) {
        let mut to_request = Vec::with_capacity(ids.len());
        for id in ids {
            let record = self.missing.entry(id).or_insert_with(MissingPreunit::new);
            let due = record
                .requested
                .map_or(true, |requested| now.duration_since(requested) >= self.fetch_interval);
            if due {
                record.requested = Some(now);
                to_request.push(id);
            }
        }
        if !to_request.is_empty() {
            syncer.request_fetch(source, to_request);
        }
    }

    /// A unit occupying `id` reached the DAG without passing through the buffer zone. Returns the
    /// preunits that became ready.
    pub(crate) fn resolve_missing(&mut self, id: UnitID) -> Vec<ReadyPreunit> {
        let record = match self.missing.remove(&id) {
            Some(record) => record,
            None => return Vec::new(),
        };
        let mut ready = Vec::new();
        for child_hash in record.needed_by {
            if let Some(child) = self.waiting.get_mut(&child_hash) {
                child.missing_parents = child.missing_parents.saturating_sub(1);
                child.missing_ids.retain(|missing| *missing != id);
                if child.is_ready() {
                    ready.push(child.to_ready());
                }
            }
        }
        ready
    }

    /// Unstage the preunit with `hash` after its worker is done with it. Returns the children that
    /// became ready. On failure, drops every staged descendant that cannot be built on another
    /// variant of a failed position.
    pub(crate) fn remove(&mut self, hash: CryptoHash, failed: bool) -> Vec<ReadyPreunit> {
        if failed {
            return self.remove_failed(hash);
        }

        let waiting = match self.unstage(&hash) {
            Some(waiting) => waiting,
            None => return Vec::new(),
        };
        let id = waiting.preunit.id();
        let mut ready = Vec::new();
        for child_hash in waiting.children {
            if let Some(child) = self.waiting.get_mut(&child_hash) {
                child.waiting_parents = child.waiting_parents.saturating_sub(1);
                child.inserted_parents.push(id);
                if child.is_ready() {
                    ready.push(child.to_ready());
                }
            }
        }
        ready
    }

    fn remove_failed(&mut self, hash: CryptoHash) -> Vec<ReadyPreunit> {
        let mut ready = Vec::new();
        let mut dropped = 0;
        let mut stack = vec![hash];
        while let Some(hash) = stack.pop() {
            let waiting = match self.unstage(&hash) {
                Some(waiting) => waiting,
                None => continue,
            };
            dropped += 1;
            let id = waiting.preunit.id();
            for child_hash in waiting.children {
                if !self.has_other_variant(id, &child_hash) {
                    stack.push(child_hash);
                    continue;
                }
                if let Some(child) = self.waiting.get_mut(&child_hash) {
                    child.waiting_parents = child.waiting_parents.saturating_sub(1);
                    if child.is_ready() {
                        ready.push(child.to_ready());
                    }
                }
            }
        }
        if dropped > 1 {
            log::info!("dropped {} staged descendants of a failed preunit", dropped - 1);
        }
        ready
    }

    /// Whether the staged preunit `child` may still get its parent at `id` from another variant:
    /// one that was inserted, or one still staged that lists it as a child.
    fn has_other_variant(&self, id: UnitID, child: &CryptoHash) -> bool {
        let inserted = self
            .waiting
            .get(child)
            .map_or(false, |waiting| waiting.inserted_parents.contains(&id));
        let staged = self.waiting_by_id.get(&id).map_or(false, |variants| {
            variants
                .iter()
                .filter_map(|variant| self.waiting.get(variant))
                .any(|variant| variant.children.contains(child))
        });
        inserted || staged
    }

    /// Take the preunit with `hash` out of the zone, along with its entries in the missing records.
    fn unstage(&mut self, hash: &CryptoHash) -> Option<WaitingPreunit> {
        let waiting = self.waiting.remove(hash)?;
        let id = waiting.preunit.id();
        if let Some(hashes) = self.waiting_by_id.get_mut(&id) {
            hashes.retain(|other| other != hash);
            if hashes.is_empty() {
                self.waiting_by_id.remove(&id);
            }
        }
        for missing_id in &waiting.missing_ids {
            if let Some(record) = self.missing.get_mut(missing_id) {
                record.needed_by.retain(|needer| needer != hash);
                if record.needed_by.is_empty() {
                    self.missing.remove(missing_id);
                }
            }
        }
        Some(waiting)
    }

    /// Missing positions whose last request is older than a fetch interval, grouped by the process to
    /// ask: the source of a preunit that needs the position, or else the position's creator.
    pub(crate) fn stale_missing(&mut self, now: Instant) -> Vec<(ProcessID, Vec<UnitID>)> {
        let mut requests: BTreeMap<ProcessID, Vec<UnitID>> = BTreeMap::new();
        for (id, record) in self.missing.iter_mut() {
            let stale = record
                .requested
                .map_or(true, |requested| now.duration_since(requested) >= self.fetch_interval);
            if !stale {
                continue;
            }
            let target = record
                .needed_by
                .iter()
                .find_map(|hash| self.waiting.get(hash))
                .map_or(id.creator(), |waiting| waiting.source);
            record.requested = Some(now);
            requests.entry(target).or_default().push(*id);
        }
        requests.into_iter().collect()
    }

    pub(crate) fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    #[cfg(test)]
    pub(crate) fn missing_len(&self) -> usize {
        self.missing.len()
    }

    /// The number of preunits that need position `id`.
    #[cfg(test)]
    pub(crate) fn needed_by(&self, id: UnitID) -> usize {
        self.missing.get(&id).map_or(0, |record| record.needed_by.len())
    }
}
