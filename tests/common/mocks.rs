use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use aleph_rs::{
    app::{DataSource, Preblock, PreblockSink},
    dag::Dag,
    networking::syncer::Syncer,
    ordering::{Extender, ExtenderFactory, TimingRound},
    random_source::{RandomSource, RandomSourceError, RandomSourceFactory},
    types::{
        data_types::{minimal_quorum, CryptoHash, EpochID, ProcessID, UnitID},
        unit::Unit,
    },
};

/// Produces `[pid, counter (4 bytes, little endian)]`, counting up from 0.
pub(crate) struct NumberSource {
    me: ProcessID,
    counter: u32,
}

impl NumberSource {
    pub(crate) fn new(me: ProcessID) -> NumberSource {
        NumberSource { me, counter: 0 }
    }
}

impl DataSource for NumberSource {
    fn get(&mut self) -> Vec<u8> {
        let mut data = vec![self.me.int() as u8];
        data.extend_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        data
    }
}

/// Stores every delivered preblock.
#[derive(Clone, Default)]
pub(crate) struct SharedSink(pub(crate) Arc<Mutex<Vec<Preblock>>>);

impl SharedSink {
    pub(crate) fn preblocks(&self) -> Vec<Preblock> {
        self.0.lock().unwrap().clone()
    }
}

impl PreblockSink for SharedSink {
    fn deliver(&mut self, preblock: Preblock) {
        self.0.lock().unwrap().push(preblock)
    }
}

/// A deterministic stand-in for a real random source: the random bytes and the random-source data
/// of a level are the level itself.
pub(crate) struct LevelRandomSource;

impl RandomSource for LevelRandomSource {
    fn random_bytes(&self, _: ProcessID, level: u32) -> Option<Vec<u8>> {
        Some(level.to_le_bytes().to_vec())
    }

    fn data_to_include(&self, _: &[Option<Arc<Unit>>], level: u32) -> Result<Vec<u8>, RandomSourceError> {
        Ok(level.to_le_bytes().to_vec())
    }
}

pub(crate) struct LevelRandomSourceFactory;

impl RandomSourceFactory for LevelRandomSourceFactory {
    fn new_random_source(&self, _: &Arc<Dag>) -> Arc<dyn RandomSource> {
        Arc::new(LevelRandomSource)
    }

    fn dealing_data(&self, epoch: EpochID) -> Result<Vec<u8>, RandomSourceError> {
        Ok(epoch.int().to_le_bytes().to_vec())
    }
}

/// Decides level `L` once a quorum of creators reached level `L + 1`. The timing unit of level `L`
/// is the unit of process `L mod nproc` on that level; its round is everything below it that no
/// earlier round contained.
///
/// Only sound when every process climbs one level at a time and nobody forks, which is all the
/// tests need.
pub(crate) struct RoundRobinExtender {
    dag: Arc<Dag>,
    next_level: u32,
    ordered: HashSet<CryptoHash>,
}

impl RoundRobinExtender {
    fn decide_next(&mut self) -> Option<TimingRound> {
        let nproc = self.dag.nproc();
        let level = self.next_level;
        let above = self
            .dag
            .units_on_level(level + 1)
            .iter()
            .filter(|units| !units.is_empty())
            .count();
        if above < minimal_quorum(nproc) {
            return None;
        }
        let timing_unit = self
            .dag
            .units_on_level(level)
            .get(level as usize % nproc)?
            .first()?
            .clone();

        let mut round = Vec::new();
        let mut stack = vec![timing_unit.clone()];
        while let Some(unit) = stack.pop() {
            if !self.ordered.insert(unit.hash()) {
                continue;
            }
            stack.extend(unit.parents().iter().flatten().cloned());
            if unit.hash() != timing_unit.hash() {
                round.push(unit);
            }
        }
        round.sort_by_key(|unit| (unit.level(), unit.creator(), unit.hash().bytes()));
        round.push(timing_unit);

        self.next_level += 1;
        TimingRound::new(round)
    }
}

impl Extender for RoundRobinExtender {
    fn add_unit(&mut self, _: &Arc<Unit>) -> Vec<TimingRound> {
        let mut rounds = Vec::new();
        while let Some(round) = self.decide_next() {
            rounds.push(round);
        }
        rounds
    }
}

pub(crate) struct RoundRobinExtenderFactory;

impl ExtenderFactory for RoundRobinExtenderFactory {
    fn new_extender(&self, dag: &Arc<Dag>, _: &Arc<dyn RandomSource>) -> Box<dyn Extender> {
        Box::new(RoundRobinExtender {
            dag: dag.clone(),
            next_level: 0,
            ordered: HashSet::new(),
        })
    }
}

/// A syncer that only writes down what it was asked to do.
#[derive(Default)]
pub(crate) struct RecordingSyncer {
    pub(crate) fetches: Mutex<Vec<(ProcessID, Vec<UnitID>)>>,
    pub(crate) gossips: Mutex<Vec<ProcessID>>,
    pub(crate) multicasts: Mutex<Vec<Arc<Unit>>>,
}

impl RecordingSyncer {
    /// Every unit id requested so far, from any process.
    pub(crate) fn fetched_ids(&self) -> Vec<UnitID> {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }
}

impl Syncer for RecordingSyncer {
    fn request_fetch(&self, process: ProcessID, ids: Vec<UnitID>) {
        self.fetches.lock().unwrap().push((process, ids))
    }

    fn request_gossip(&self, process: ProcessID) {
        self.gossips.lock().unwrap().push(process)
    }

    fn multicast(&self, unit: &Arc<Unit>) {
        self.multicasts.lock().unwrap().push(unit.clone())
    }
}
