/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The creator produces this process's units.
//!
//! It consumes the *unit belt*: every unit inserted into the live epoch's DAG by some other process,
//! in insertion order. From the belt it keeps one *candidate* parent per creator (the highest-level
//! unit seen) and derives the level a new unit would reach. Whenever that level exceeds the level of
//! its own last unit, the creator is *ready* and produces a new unit on top of its candidates.
//!
//! ## Epochs
//!
//! The creator starts every epoch with a dealing unit. Once the timing unit of an epoch reaches
//! `last_level`, the creator stops producing regular units for that epoch and instead puts its share
//! of the epoch proof into its next unit. When the creator sees a quorum of shares (or a dealing unit
//! of the next epoch carrying a valid proof), it moves on to the next epoch, until `number_of_epochs`
//! epochs have finished.

pub mod parents;

use std::{
    collections::HashSet,
    sync::{
        mpsc::{Receiver, RecvTimeoutError, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    app::DataSource,
    epoch_proof::EpochProofBuilder,
    random_source::RandomSourceError,
    types::{
        crypto_primitives::Keypair,
        data_types::{minimal_quorum, EpochID, ProcessID},
        unit::{level_from_parents, Unit},
    },
};

use self::parents::{make_consistent, parents_below_level};

/// Messages on the unit belt.
pub enum CreatorInput {
    /// A unit inserted into the DAG of some epoch.
    Unit(Arc<Unit>),

    /// Stop growing the parent slot of a process caught forking.
    FreezeParent(ProcessID),
}

/// Inserts a unit created by this process into its epoch and multicasts it. Returns the inserted
/// unit, or `None` if the unit's epoch is no longer live.
pub trait UnitSender: Send {
    fn send(&mut self, unit: Unit) -> Option<Arc<Unit>>;
}

/// Supplies the random-source data of new units.
pub trait RandomSourceDataProvider: Send {
    /// Data for a unit of `epoch` on `level` with `parents`. Dealing units have no parents.
    fn random_source_data(
        &self,
        epoch: EpochID,
        parents: &[Option<Arc<Unit>>],
        level: u32,
    ) -> Result<Vec<u8>, RandomSourceError>;
}

#[derive(Clone)]
pub struct CreatorConfiguration {
    pub me: ProcessID,
    pub keypair: Keypair,
    pub nproc: usize,
    pub can_skip_level: bool,
    pub last_level: u32,
    pub number_of_epochs: u32,
}

pub struct Creator {
    config: CreatorConfiguration,
    data_source: Box<dyn DataSource>,
    sender: Box<dyn UnitSender>,
    random_source_data: Box<dyn RandomSourceDataProvider>,
    epoch_proof: Arc<dyn EpochProofBuilder>,
    last_timing: Receiver<Arc<Unit>>,
    quorum: usize,
    epoch: EpochID,
    started: bool,
    epoch_done: bool,
    finished: bool,
    candidates: Vec<Option<Arc<Unit>>>,
    max_level: Option<u32>,
    on_max_level: usize,
    level: u32,
    frozen: HashSet<ProcessID>,
    pending_dealing: Option<Vec<u8>>,
}

impl Creator {
    pub fn new(
        config: CreatorConfiguration,
        data_source: Box<dyn DataSource>,
        sender: Box<dyn UnitSender>,
        random_source_data: Box<dyn RandomSourceDataProvider>,
        epoch_proof: Arc<dyn EpochProofBuilder>,
        last_timing: Receiver<Arc<Unit>>,
    ) -> Creator {
        let nproc = config.nproc;
        Creator {
            config,
            data_source,
            sender,
            random_source_data,
            epoch_proof,
            last_timing,
            quorum: minimal_quorum(nproc),
            epoch: EpochID::new(0),
            started: false,
            epoch_done: false,
            finished: false,
            candidates: vec![None; nproc],
            max_level: None,
            on_max_level: 0,
            level: 0,
            frozen: HashSet::new(),
            pending_dealing: None,
        }
    }

    /// Start the first epoch, producing its dealing unit.
    pub fn start_first_epoch(&mut self) {
        self.new_epoch(EpochID::new(0), Vec::new());
        self.create_units();
    }

    /// Start a thread that feeds the creator from `belt` until a shutdown signal arrives.
    pub fn start(
        mut self,
        belt: Receiver<CreatorInput>,
        shutdown_signal: Receiver<()>,
        poll_interval: Duration,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            self.start_first_epoch();
            loop {
                match shutdown_signal.try_recv() {
                    Ok(()) => return,
                    Err(TryRecvError::Empty) => (),
                    Err(TryRecvError::Disconnected) => {
                        panic!("creator thread disconnected from main thread")
                    }
                }

                match belt.recv_timeout(poll_interval) {
                    Ok(input) => self.handle(input),
                    Err(RecvTimeoutError::Timeout) => self.create_units(),
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })
    }

    /// Process one belt message, then produce every unit the creator became ready for.
    pub fn handle(&mut self, input: CreatorInput) {
        match input {
            CreatorInput::Unit(unit) => self.update(&unit),
            CreatorInput::FreezeParent(process) => self.freeze_parent(process),
        }
        self.create_units();
    }

    pub fn epoch(&self) -> EpochID {
        self.epoch
    }

    /// The level the next unit would have.
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn candidates(&self) -> &[Option<Arc<Unit>>] {
        &self.candidates
    }

    /// Account for a unit inserted into some epoch's DAG.
    pub fn update(&mut self, unit: &Arc<Unit>) {
        if !self.started || self.frozen.contains(&unit.creator()) || unit.epoch() < self.epoch {
            return;
        }
        if unit.epoch() > self.epoch {
            if !self.epoch_proof.verify(unit.preunit()) {
                log::warn!(
                    "dropped unit {:?} from epoch {} without a valid proof of the end of epoch {}",
                    unit.id(),
                    unit.epoch(),
                    self.epoch
                );
                return;
            }
            self.new_epoch(unit.epoch(), unit.data().to_vec());
            self.update_candidates(unit);
            return;
        }
        if let Some(proof) = self.epoch_proof.try_building(unit) {
            self.new_epoch(self.epoch.next(), proof);
            return;
        }
        self.update_candidates(unit);
    }

    fn update_candidates(&mut self, unit: &Arc<Unit>) {
        let slot = unit.creator().index();
        if let Some(candidate) = &self.candidates[slot] {
            if unit.level() <= candidate.level() {
                return;
            }
        }
        self.candidates[slot] = Some(unit.clone());

        match self.max_level {
            Some(max_level) if unit.level() < max_level => (),
            Some(max_level) if unit.level() == max_level => self.on_max_level += 1,
            _ => {
                self.max_level = Some(unit.level());
                self.on_max_level = 1;
            }
        }
        self.update_level();
    }

    fn update_level(&mut self) {
        self.level = match self.max_level {
            Some(max_level) if self.on_max_level >= self.quorum => max_level + 1,
            Some(max_level) => max_level,
            None => 0,
        };
    }

    /// Recount the maximal level and its occupancy from scratch, after a candidate was lowered.
    fn recount(&mut self) {
        self.max_level = self.candidates.iter().flatten().map(|unit| unit.level()).max();
        self.on_max_level = match self.max_level {
            Some(max_level) => self
                .candidates
                .iter()
                .flatten()
                .filter(|unit| unit.level() == max_level)
                .count(),
            None => 0,
        };
        self.update_level();
    }

    fn new_epoch(&mut self, epoch: EpochID, data: Vec<u8>) {
        self.started = true;
        self.epoch = epoch;
        self.epoch_done = false;
        self.candidates = vec![None; self.config.nproc];
        self.max_level = None;
        self.on_max_level = 0;
        self.level = 0;
        self.frozen.clear();
        self.pending_dealing = None;

        if epoch.int() >= self.config.number_of_epochs {
            log::info!("process {} finished its last epoch", self.config.me);
            self.finished = true;
            return;
        }
        log::debug!("process {} starts epoch {}", self.config.me, epoch);
        self.pending_dealing = Some(data);
        self.try_dealing();
    }

    /// Create the dealing unit of the current epoch, if it is still owed.
    fn try_dealing(&mut self) {
        let data = match self.pending_dealing.take() {
            Some(data) => data,
            None => return,
        };
        let parents = vec![None; self.config.nproc];
        match self.random_source_data.random_source_data(self.epoch, &parents, 0) {
            Ok(random_source_data) => {
                if !self.create_unit(parents, 0, data.clone(), random_source_data) {
                    self.pending_dealing = Some(data);
                }
            }
            Err(error) => {
                log::warn!("could not create the dealing unit of epoch {}: {:?}", self.epoch, error);
                self.pending_dealing = Some(data);
            }
        }
    }

    /// Whether the candidates allow a unit above this process's last one.
    pub fn ready(&self) -> bool {
        if self.finished || self.epoch_done || self.pending_dealing.is_some() || !self.started {
            return false;
        }
        match &self.candidates[self.config.me.index()] {
            Some(own) => self.level > own.level(),
            None => true,
        }
    }

    fn create_units(&mut self) {
        self.try_dealing();
        while self.ready() {
            if !self.create_regular_unit() {
                return;
            }
        }
    }

    /// Returns whether a unit was created.
    fn create_regular_unit(&mut self) -> bool {
        let (parents, level) = match self.build_parents() {
            Some(parents) => parents,
            None => return false,
        };
        let data = self.get_data(level);
        let random_source_data = match self.random_source_data.random_source_data(self.epoch, &parents, level) {
            Ok(random_source_data) => random_source_data,
            Err(error) => {
                log::debug!("no random source data for level {} yet: {:?}", level, error);
                return false;
            }
        };
        let own_before = self.candidates[self.config.me.index()].as_ref().map(|own| own.hash());
        self.create_unit(parents, level, data, random_source_data);
        let own_after = self.candidates[self.config.me.index()].as_ref().map(|own| own.hash());
        own_before != own_after
    }

    /// The parents of the next unit and its level, or `None` if they would not lift the unit above
    /// this process's last one.
    fn build_parents(&self) -> Option<(Vec<Option<Arc<Unit>>>, u32)> {
        let own_level = self.candidates[self.config.me.index()]
            .as_ref()
            .map(|own| own.level());
        let mut parents = if self.config.can_skip_level {
            self.candidates.clone()
        } else {
            let target = own_level.map_or(0, |level| level + 1);
            parents_below_level(&self.candidates, target)
        };
        make_consistent(&mut parents);

        let level = level_from_parents(&parents);
        match own_level {
            Some(own_level) if level <= own_level => None,
            _ => Some((parents, level)),
        }
    }

    /// Application data below the last level; on and above it, the epoch proof share once the last
    /// timing unit of the epoch is known.
    fn get_data(&mut self, level: u32) -> Vec<u8> {
        if level < self.config.last_level {
            return self.data_source.get();
        }
        loop {
            match self.last_timing.try_recv() {
                Ok(timing_unit) if timing_unit.epoch() == self.epoch => {
                    self.epoch_done = true;
                    if self.epoch.int() + 1 >= self.config.number_of_epochs {
                        return Vec::new();
                    }
                    return self.epoch_proof.build_share(&timing_unit);
                }
                Ok(_) => continue,
                Err(_) => return Vec::new(),
            }
        }
    }

    /// Returns whether the unit was inserted.
    fn create_unit(
        &mut self,
        parents: Vec<Option<Arc<Unit>>>,
        level: u32,
        data: Vec<u8>,
        random_source_data: Vec<u8>,
    ) -> bool {
        let unit = Unit::new(
            self.config.me,
            self.epoch,
            parents,
            level,
            data,
            random_source_data,
            &self.config.keypair,
        );
        match self.sender.send(unit) {
            Some(unit) => {
                self.update(&unit);
                true
            }
            None => {
                log::warn!("epoch {} closed before its unit could be inserted", self.epoch);
                false
            }
        }
    }

    /// Pin the parent slot of `process` to the unit this process's last unit used.
    pub fn freeze_parent(&mut self, process: ProcessID) {
        if process == self.config.me || !self.frozen.insert(process) {
            return;
        }
        let pinned = self.candidates[self.config.me.index()]
            .as_ref()
            .and_then(|own| own.parent(process).cloned());
        self.candidates[process.index()] = pinned;
        self.recount();
        log::info!("process {} froze the parent slot of process {}", self.config.me, process);
    }
}
