/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable fork handling.
//!
//! Forks (two distinct units of one creator at one height) are never rejected outright by the
//! [`Adder`](crate::adder::Adder). Instead, the adder reports them to an [`Alerter`], which decides
//! which of the conflicting units, if any, may be built upon. The alerter also provides the
//! per-creator locks that serialize the insertion of units of the same creator into an epoch's DAG.
//!
//! Library users with an alert protocol (e.g., reliable broadcast of fork proofs and commitments)
//! plug it in through this trait. [`LocalAlerter`] is a self-contained implementation for deployments
//! without one.

use std::{
    collections::HashSet,
    sync::{Arc, Condvar, Mutex},
};

use crate::{
    dag::checks::CheckError,
    types::{data_types::ProcessID, unit::{Preunit, Unit}},
};

/// Callback notified with both conflicting preunits when a new forker is detected.
pub type ForkObserver = Arc<dyn Fn(&Preunit, &Preunit) + Send + Sync>;

/// Handle returned by [`Alerter::add_fork_observer`], used to remove the observer again.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObserverID(u64);

pub trait Alerter: Send + Sync {
    /// Advisory notification: `preunit` and `conflicting` occupy the same position.
    fn new_fork(&self, preunit: &Preunit, conflicting: &Preunit);

    /// Pick which of several `candidates` for one parent slot `preunit` is built on.
    fn disambiguate(&self, candidates: &[Arc<Unit>], preunit: &Preunit) -> Result<Arc<Unit>, CheckError>;

    /// Given the outcome of checking `preunit` (received from `source`), possibly override a failure
    /// caused by a missing commitment to a forked parent.
    fn resolve_missing_commitment(
        &self,
        result: Result<(), CheckError>,
        preunit: &Preunit,
        source: ProcessID,
    ) -> Result<(), CheckError>;

    /// Block until the insertion lock of `creator` is free, then take it.
    fn lock(&self, creator: ProcessID);

    fn unlock(&self, creator: ProcessID);

    fn add_fork_observer(&self, observer: ForkObserver) -> ObserverID;

    fn remove_fork_observer(&self, id: ObserverID);
}

/// Holds the insertion lock of a creator until dropped.
pub(crate) struct CreatorLock<'a> {
    alerter: &'a dyn Alerter,
    creator: ProcessID,
}

impl<'a> CreatorLock<'a> {
    pub(crate) fn acquire(alerter: &'a dyn Alerter, creator: ProcessID) -> CreatorLock<'a> {
        alerter.lock(creator);
        CreatorLock { alerter, creator }
    }
}

impl Drop for CreatorLock<'_> {
    fn drop(&mut self) {
        self.alerter.unlock(self.creator);
    }
}

/// An [`Alerter`] that keeps all fork knowledge local to the process.
///
/// It never vouches for a forked unit: [`disambiguate`](Alerter::disambiguate) always fails with
/// [`CheckError::UnresolvedFork`], and check results pass through unchanged.
pub struct LocalAlerter {
    locked: Mutex<Vec<bool>>,
    unlocked: Condvar,
    forkers: Mutex<HashSet<ProcessID>>,
    observers: Mutex<(u64, Vec<(ObserverID, ForkObserver)>)>,
}

impl LocalAlerter {
    pub fn new(nproc: usize) -> LocalAlerter {
        LocalAlerter {
            locked: Mutex::new(vec![false; nproc]),
            unlocked: Condvar::new(),
            forkers: Mutex::new(HashSet::new()),
            observers: Mutex::new((0, Vec::new())),
        }
    }

    /// Whether `process` was caught forking.
    pub fn is_forker(&self, process: ProcessID) -> bool {
        self.forkers.lock().unwrap().contains(&process)
    }
}

impl Alerter for LocalAlerter {
    fn new_fork(&self, preunit: &Preunit, conflicting: &Preunit) {
        let newly_detected = self.forkers.lock().unwrap().insert(preunit.creator());
        if !newly_detected {
            return;
        }
        log::warn!(
            "process {} forked at height {} of epoch {}",
            preunit.creator(),
            preunit.height(),
            preunit.epoch()
        );

        // Observers may call back into the alerter.
        let observers: Vec<ForkObserver> = self
            .observers
            .lock()
            .unwrap()
            .1
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer(preunit, conflicting)
        }
    }

    fn disambiguate(&self, candidates: &[Arc<Unit>], preunit: &Preunit) -> Result<Arc<Unit>, CheckError> {
        let (creator, height) = match candidates.first() {
            Some(candidate) => (candidate.creator(), candidate.height()),
            None => (preunit.creator(), preunit.height()),
        };
        Err(CheckError::UnresolvedFork { creator, height })
    }

    fn resolve_missing_commitment(
        &self,
        result: Result<(), CheckError>,
        _: &Preunit,
        _: ProcessID,
    ) -> Result<(), CheckError> {
        result
    }

    fn lock(&self, creator: ProcessID) {
        let mut locked = self.locked.lock().unwrap();
        while locked[creator.index()] {
            locked = self.unlocked.wait(locked).unwrap();
        }
        locked[creator.index()] = true;
    }

    fn unlock(&self, creator: ProcessID) {
        self.locked.lock().unwrap()[creator.index()] = false;
        self.unlocked.notify_all();
    }

    fn add_fork_observer(&self, observer: ForkObserver) -> ObserverID {
        let mut observers = self.observers.lock().unwrap();
        let id = ObserverID(observers.0);
        observers.0 += 1;
        observers.1.push((id, observer));
        id
    }

    fn remove_fork_observer(&self, id: ObserverID) {
        self.observers
            .lock()
            .unwrap()
            .1
            .retain(|(observer_id, _)| *observer_id != id);
    }
}
