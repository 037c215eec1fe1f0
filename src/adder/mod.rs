/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The admission pipeline of an epoch's DAG.
//!
//! The [`Adder`] takes preunits received from the network, rejects the malformed and the duplicate,
//! and stages the rest in the [buffer zone](buffer_zone) until all their parents are in the DAG.
//! Ready preunits are then inserted by one worker thread per creator, which runs the four DAG steps
//! (decode parents, build, check, insert) on each of them in turn.
//!
//! ## Errors
//!
//! [`add_preunits`](Adder::add_preunits) returns one result per input preunit. Only
//! [`AddPreunitError::Data`] signals a bad input. The duplicate variants are benign, and
//! [`AddPreunitError::UnknownParents`] is informational: the preunit stays staged and its missing
//! parents are fetched.
//!
//! Failures after staging (ambiguous parents that cannot be resolved, a wrong control hash, a failed
//! check) are handled inside the worker: the preunit and all its staged descendants are dropped and
//! the failure is logged.

pub(crate) mod buffer_zone;

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    alerter::{Alerter, CreatorLock},
    dag::{checks::CheckError, Dag, DecodeParentsError},
    networking::syncer::Syncer,
    types::{
        crypto_primitives::{combine_hashes, VerifyingKey},
        data_types::{CryptoHash, EpochID, ProcessID, UnitID},
        unit::{Preunit, Unit, MAX_DATA_LEN, MAX_RANDOM_SOURCE_DATA_LEN},
    },
};

use self::buffer_zone::{BufferZone, ReadyPreunit};

/// Why a preunit was not staged, or was staged without being ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddPreunitError {
    /// The preunit is malformed or not authentic.
    Data(DataError),

    /// A unit with this hash is already in the DAG.
    DuplicateUnit(CryptoHash),

    /// A preunit with this hash is already staged.
    DuplicatePreunit(CryptoHash),

    /// The preunit was staged, but this many of its parent positions are not known yet.
    UnknownParents(usize),

    /// The preunit belongs to an epoch that is neither live nor provably next.
    UnknownEpoch(EpochID),

    /// The preunit belongs to a future epoch, but no valid proof of the end of the current epoch
    /// accompanied it.
    InvalidEpochProof(EpochID),
}

/// Ways in which a preunit can be malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    InvalidCreator(ProcessID),
    WrongEpoch { expected: EpochID, got: EpochID },
    WrongCrownSize { expected: usize, got: usize },

    /// The crown references heights that cannot be parents of the preunit.
    InvalidCrown,
    OversizedData,
    InvalidSignature,

    /// The preunit claims to be created by this process, but is not in the DAG.
    OwnUnit,
}

impl From<DataError> for AddPreunitError {
    fn from(value: DataError) -> Self {
        AddPreunitError::Data(value)
    }
}

/// Failure to insert a ready preunit.
#[derive(Debug)]
enum InsertionError {
    Decode(DecodeParentsError),
    Check(CheckError),
}

impl From<DecodeParentsError> for InsertionError {
    fn from(value: DecodeParentsError) -> Self {
        InsertionError::Decode(value)
    }
}

impl From<CheckError> for InsertionError {
    fn from(value: CheckError) -> Self {
        InsertionError::Check(value)
    }
}

/// The parameters an [`Adder`] is started with.
#[derive(Clone)]
pub struct AdderConfiguration {
    pub me: ProcessID,
    pub public_keys: Vec<VerifyingKey>,
    pub fetch_interval: Duration,
    pub poll_interval: Duration,
}

struct Worker {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Adder {
    shared: Arc<AdderShared>,
    workers: Mutex<Vec<Worker>>,
}

struct AdderShared {
    config: AdderConfiguration,
    dag: Arc<Dag>,
    alerter: Arc<dyn Alerter>,
    syncer: Arc<dyn Syncer>,
    zone: Mutex<BufferZone>,
    queues: Vec<Option<Sender<ReadyPreunit>>>,
}

impl Adder {
    /// Create the adder of `dag`, starting a worker thread for every creator except this process.
    pub fn new(
        config: AdderConfiguration,
        dag: Arc<Dag>,
        alerter: Arc<dyn Alerter>,
        syncer: Arc<dyn Syncer>,
    ) -> Adder {
        let nproc = dag.nproc();
        let mut queues = Vec::with_capacity(nproc);
        let mut receivers = Vec::with_capacity(nproc);
        for pid in 0..nproc {
            if pid == config.me.index() {
                queues.push(None);
                continue;
            }
            let (sender, receiver) = mpsc::channel();
            queues.push(Some(sender));
            receivers.push(receiver);
        }

        let shared = Arc::new(AdderShared {
            zone: Mutex::new(BufferZone::new(config.fetch_interval)),
            config,
            dag,
            alerter,
            syncer,
            queues,
        });

        let workers = receivers
            .into_iter()
            .map(|ready| {
                let (shutdown, shutdown_receiver) = mpsc::channel();
                let handle = start_worker(shared.clone(), ready, shutdown_receiver);
                Worker { shutdown, handle }
            })
            .collect();

        Adder {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Check and stage `preunits`, all received from `source`. Returns one result per preunit.
    pub fn add_preunits(
        &self,
        source: ProcessID,
        preunits: Vec<Preunit>,
    ) -> Vec<Result<(), AddPreunitError>> {
        let hashes: Vec<CryptoHash> = preunits.iter().map(Preunit::hash).collect();
        let known = self.shared.dag.get_units(&hashes);

        let mut results = Vec::with_capacity(preunits.len());
        for (preunit, known) in preunits.into_iter().zip(known) {
            let result = match known {
                Some(unit) => {
                    self.shared.resolve_missing(&unit);
                    Err(AddPreunitError::DuplicateUnit(unit.hash()))
                }
                None => self
                    .shared
                    .check_correctness(&preunit)
                    .map_err(AddPreunitError::from)
                    .and_then(|()| self.shared.add_to_waiting(preunit, source)),
            };
            match &result {
                Err(AddPreunitError::DuplicateUnit(_)) | Err(AddPreunitError::DuplicatePreunit(_)) => {
                    log::info!("duplicate preunit from process {}", source)
                }
                Err(AddPreunitError::UnknownParents(count)) => {
                    log::debug!("staged a preunit from process {} with {} unknown parents", source, count)
                }
                Err(error) => log::debug!("rejected a preunit from process {}: {:?}", source, error),
                Ok(()) => (),
            }
            results.push(result);
        }
        results
    }

    /// Release the staged preunits waiting for `unit`, which reached the DAG without passing through
    /// this adder.
    pub fn resolve_missing(&self, unit: &Unit) {
        self.shared.resolve_missing(unit);
    }

    /// Request again every missing parent that was last requested more than a fetch interval ago.
    pub fn refetch_missing(&self) {
        let requests = self.shared.zone.lock().unwrap().stale_missing(Instant::now());
        for (process, ids) in requests {
            self.shared.syncer.request_fetch(process, ids);
        }
    }

    /// Number of staged preunits.
    pub fn waiting_len(&self) -> usize {
        self.shared.zone.lock().unwrap().waiting_len()
    }

    /// Stop the workers. Insertions in progress complete first; staged preunits are dropped.
    pub fn close(&self) {
        let workers: Vec<Worker> = self.workers.lock().unwrap().drain(..).collect();
        for worker in &workers {
            let _ = worker.shutdown.send(());
        }
        for worker in workers {
            if worker.handle.join().is_err() {
                log::warn!("an adder worker of epoch {} panicked", self.shared.dag.epoch());
            }
        }
    }
}

impl Drop for Adder {
    fn drop(&mut self) {
        self.close()
    }
}

impl AdderShared {
    fn check_correctness(&self, preunit: &Preunit) -> Result<(), DataError> {
        let nproc = self.dag.nproc();
        let creator = preunit.creator();
        if creator.index() >= nproc {
            return Err(DataError::InvalidCreator(creator));
        }
        if preunit.epoch() != self.dag.epoch() {
            return Err(DataError::WrongEpoch {
                expected: self.dag.epoch(),
                got: preunit.epoch(),
            });
        }
        let heights = preunit.crown().heights();
        if heights.len() != nproc {
            return Err(DataError::WrongCrownSize {
                expected: nproc,
                got: heights.len(),
            });
        }
        let predecessor_height = heights[creator.index()];
        let valid_predecessor = match preunit.height() {
            0 => predecessor_height.is_none(),
            height => predecessor_height == Some(height - 1),
        };
        if !valid_predecessor || heights.iter().flatten().any(|height| *height > UnitID::MAX_HEIGHT) {
            return Err(DataError::InvalidCrown);
        }
        if preunit.data().len() > MAX_DATA_LEN as usize
            || preunit.random_source_data().len() > MAX_RANDOM_SOURCE_DATA_LEN as usize
        {
            return Err(DataError::OversizedData);
        }
        if creator == self.config.me {
            return Err(DataError::OwnUnit);
        }
        match self.config.public_keys.get(creator.index()) {
            Some(public_key) if preunit.verify(public_key) => Ok(()),
            _ => Err(DataError::InvalidSignature),
        }
    }

    fn add_to_waiting(&self, preunit: Preunit, source: ProcessID) -> Result<(), AddPreunitError> {
        let mut zone = self.zone.lock().unwrap();
        let ready = zone.add_to_waiting(
            preunit,
            source,
            &self.dag,
            self.alerter.as_ref(),
            self.syncer.as_ref(),
            Instant::now(),
        )?;
        if let Some(ready) = ready {
            self.enqueue(ready);
        }
        Ok(())
    }

    fn resolve_missing(&self, unit: &Unit) {
        let mut zone = self.zone.lock().unwrap();
        for ready in zone.resolve_missing(unit.id()) {
            self.enqueue(ready);
        }
    }

    fn remove(&self, hash: CryptoHash, failed: bool) {
        let mut zone = self.zone.lock().unwrap();
        for ready in zone.remove(hash, failed) {
            self.enqueue(ready);
        }
    }

    /// Hand `ready` to the worker of its creator. Callers hold the buffer zone lock.
    fn enqueue(&self, ready: ReadyPreunit) {
        match self.queues.get(ready.preunit.creator().index()) {
            Some(Some(queue)) => {
                // The worker only disconnects during shutdown.
                let _ = queue.send(ready);
            }
            _ => log::warn!("no worker for preunit {:?}", ready.preunit.id()),
        }
    }

    /// Decode, build, check and insert a ready preunit.
    fn handle_ready(&self, ready: &ReadyPreunit) -> Result<Arc<Unit>, InsertionError> {
        let preunit = ready.preunit.as_ref();
        let parents = match self.dag.decode_parents(preunit) {
            Ok(parents) => parents,
            Err(DecodeParentsError::DuplicateUnit(unit)) => return Ok(unit),
            Err(DecodeParentsError::AmbiguousParents(candidates)) => {
                self.disambiguate(candidates, preunit, ready.source)?
            }
            Err(error) => return Err(error.into()),
        };

        let control_hash = combine_hashes(
            parents
                .iter()
                .map(|parent| parent.as_ref().map(|parent| parent.hash_ref())),
        );
        if control_hash != *preunit.crown().control_hash() {
            self.handle_invalid_control_hash(preunit, ready.source);
            return Err(CheckError::InvalidControlHash.into());
        }

        let unit = self.dag.build_unit(preunit.clone(), parents);
        let _lock = CreatorLock::acquire(self.alerter.as_ref(), unit.creator());
        let checked = self.dag.check(&unit);
        self.alerter
            .resolve_missing_commitment(checked, preunit, ready.source)?;
        Ok(self.dag.insert(unit))
    }

    /// Resolve every slot with several candidates through the alerter.
    fn disambiguate(
        &self,
        candidates: Vec<Vec<Arc<Unit>>>,
        preunit: &Preunit,
        source: ProcessID,
    ) -> Result<Vec<Option<Arc<Unit>>>, InsertionError> {
        let mut parents = Vec::with_capacity(candidates.len());
        for mut slot in candidates {
            let parent = match slot.len() {
                0 => None,
                1 => slot.pop(),
                _ => match self.alerter.disambiguate(&slot, preunit) {
                    Ok(parent) => Some(parent),
                    Err(error) => {
                        // A commitment obtained by the alerter may settle the fork.
                        self.alerter
                            .resolve_missing_commitment(Err(error), preunit, source)?;
                        Some(self.alerter.disambiguate(&slot, preunit)?)
                    }
                },
            };
            parents.push(parent);
        }
        Ok(parents)
    }

    /// A wrong control hash may mean that `source` knows a fork of some parent: fetch every parent
    /// position again.
    fn handle_invalid_control_hash(&self, preunit: &Preunit, source: ProcessID) {
        let epoch = preunit.epoch();
        let ids: Vec<UnitID> = preunit
            .crown()
            .heights()
            .iter()
            .enumerate()
            .filter_map(|(creator, height)| {
                height.map(|height| UnitID::new(height, ProcessID::new(creator as u16), epoch))
            })
            .collect();
        log::warn!(
            "preunit {:?} from process {} has an invalid control hash",
            preunit.id(),
            source
        );
        if !ids.is_empty() {
            self.syncer.request_fetch(source, ids);
        }
    }
}

fn start_worker(
    shared: Arc<AdderShared>,
    ready: Receiver<ReadyPreunit>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => return,
        }

        let item = match ready.recv_timeout(shared.config.poll_interval) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let failed = match panic::catch_unwind(AssertUnwindSafe(|| shared.handle_ready(&item))) {
            Ok(Ok(_)) => false,
            Ok(Err(error)) => {
                log::info!(
                    "failed to insert preunit {:?} from process {}: {:?}",
                    item.preunit.id(),
                    item.source,
                    error
                );
                true
            }
            Err(_) => {
                log::warn!("panicked while inserting preunit {:?}", item.preunit.id());
                true
            }
        };
        shared.remove(item.hash, failed);
    })
}
