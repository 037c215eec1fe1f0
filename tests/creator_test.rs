//! Four creators driven by hand, exchanging every unit they produce.

use std::sync::{
    mpsc::{self, Sender},
    Arc, Mutex,
};

use aleph_rs::{
    creator::{Creator, CreatorConfiguration, CreatorInput, RandomSourceDataProvider, UnitSender},
    dag::{checks::standard_checks, Dag},
    epoch_proof::{EpochProofBuilder, MultisigEpochProof},
    random_source::RandomSourceError,
    types::{
        crypto_primitives::{combine_hashes, Keypair, SigningKey},
        data_types::{CryptoHash, EpochID, ProcessID},
        unit::Unit,
    },
};
use log::LevelFilter;

mod common;

use crate::common::{
    logging::setup_logger,
    mocks::NumberSource,
    units::{public_keys, signing_keys},
};

const NPROC: usize = 4;
const LAST_LEVEL: u32 = 1;

/// Collects the units of one creator in creation order.
#[derive(Clone, Default)]
struct Outbox(Arc<Mutex<Vec<Arc<Unit>>>>);

impl Outbox {
    fn units(&self) -> Vec<Arc<Unit>> {
        self.0.lock().unwrap().clone()
    }

    fn last(&self) -> Arc<Unit> {
        self.0.lock().unwrap().last().cloned().unwrap()
    }
}

impl UnitSender for Outbox {
    fn send(&mut self, unit: Unit) -> Option<Arc<Unit>> {
        let unit = Arc::new(unit);
        self.0.lock().unwrap().push(unit.clone());
        Some(unit)
    }
}

struct NoRandomSourceData;

impl RandomSourceDataProvider for NoRandomSourceData {
    fn random_source_data(&self, _: EpochID, _: &[Option<Arc<Unit>>], _: u32) -> Result<Vec<u8>, RandomSourceError> {
        Ok(Vec::new())
    }
}

struct Committee {
    keys: Vec<SigningKey>,
    creators: Vec<Creator>,
    outboxes: Vec<Outbox>,
    last_timing: Vec<Sender<Arc<Unit>>>,
}

impl Committee {
    fn new() -> Committee {
        setup_logger(LevelFilter::Info);
        let keys = signing_keys(NPROC);
        let mut creators = Vec::new();
        let mut outboxes = Vec::new();
        let mut last_timing = Vec::new();
        for (pid, key) in keys.iter().enumerate() {
            let me = ProcessID::new(pid as u16);
            let outbox = Outbox::default();
            let (sender, receiver) = mpsc::channel();
            let epoch_proof = MultisigEpochProof::new(
                me,
                Keypair::new(key.clone()),
                public_keys(&keys),
                LAST_LEVEL,
            );
            let creator = Creator::new(
                CreatorConfiguration {
                    me,
                    keypair: Keypair::new(key.clone()),
                    nproc: NPROC,
                    can_skip_level: false,
                    last_level: LAST_LEVEL,
                    number_of_epochs: 2,
                },
                Box::new(NumberSource::new(me)),
                Box::new(outbox.clone()),
                Box::new(NoRandomSourceData),
                Arc::new(epoch_proof),
                receiver,
            );
            creators.push(creator);
            outboxes.push(outbox);
            last_timing.push(sender);
        }
        Committee {
            keys,
            creators,
            outboxes,
            last_timing,
        }
    }

    /// Show every creator the given units of all other creators. Only the last one lets the creator
    /// produce new units.
    fn exchange(&mut self, units: &[Arc<Unit>]) {
        for (pid, creator) in self.creators.iter_mut().enumerate() {
            let mut others = units.iter().filter(|unit| unit.creator().index() != pid).peekable();
            while let Some(unit) = others.next() {
                if others.peek().is_some() {
                    creator.update(unit);
                } else {
                    creator.handle(CreatorInput::Unit(unit.clone()));
                }
            }
        }
    }

    fn nth_units(&self, n: usize) -> Vec<Arc<Unit>> {
        self.outboxes.iter().map(|outbox| outbox.units()[n].clone()).collect()
    }
}

#[test]
fn units_build_on_every_dealing_and_pass_the_dag_checks() {
    let mut committee = Committee::new();
    for creator in &mut committee.creators {
        creator.start_first_epoch();
    }
    let dealings = committee.nth_units(0);
    assert!(dealings.iter().all(|dealing| dealing.is_dealing() && dealing.level() == 0));

    committee.exchange(&dealings);
    let hashes: Vec<CryptoHash> = dealings.iter().map(|dealing| dealing.hash()).collect();
    let expected = combine_hashes(hashes.iter().map(Some));
    for outbox in &committee.outboxes {
        let units = outbox.units();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].level(), 1);
        assert_eq!(units[1].crown().heights(), &[Some(0); NPROC]);
        assert_eq!(*units[1].crown().control_hash(), expected);
    }

    // A peer's DAG accepts them.
    let dag = Dag::new(NPROC, EpochID::new(0));
    for check in standard_checks(false) {
        dag.add_check(check);
    }
    for dealing in &dealings {
        let parents = dag.decode_parents(dealing.preunit()).unwrap();
        dag.insert(dag.build_unit(dealing.preunit().clone(), parents));
    }
    for unit in committee.nth_units(1) {
        let parents = dag.decode_parents(unit.preunit()).unwrap();
        let unit = dag.build_unit(unit.preunit().clone(), parents);
        assert!(dag.check(&unit).is_ok());
        dag.insert(unit);
    }
    assert_eq!(dag.len(), 2 * NPROC);
    assert!(dag.units_on_level(1).iter().all(|slot| slot.len() == 1));
}

#[test]
fn shares_of_the_last_timing_unit_start_the_next_epoch() {
    let mut committee = Committee::new();
    for creator in &mut committee.creators {
        creator.start_first_epoch();
    }
    committee.exchange(&committee.nth_units(0));
    let level_one = committee.nth_units(1);

    // Level 1 is the last level: its timing unit ends epoch 0.
    let timing_unit = level_one[1].clone();
    for sender in &committee.last_timing {
        sender.send(timing_unit.clone()).unwrap();
    }
    committee.exchange(&level_one);
    let shares = committee.nth_units(2);
    assert!(shares.iter().all(|share| share.level() == 2 && !share.data().is_empty()));
    assert!(committee.creators.iter().all(|creator| !creator.ready()));

    committee.exchange(&shares);
    let verifier = MultisigEpochProof::new(
        ProcessID::new(0),
        Keypair::new(committee.keys[0].clone()),
        public_keys(&committee.keys),
        LAST_LEVEL,
    );
    for (creator, outbox) in committee.creators.iter().zip(&committee.outboxes) {
        assert_eq!(creator.epoch(), EpochID::new(1));
        let dealing = outbox.last();
        assert_eq!(dealing.epoch(), EpochID::new(1));
        assert!(dealing.is_dealing());
        assert!(verifier.verify(dealing.preunit()));
    }
}

#[test]
fn the_last_epoch_ends_without_a_next_dealing() {
    let mut committee = Committee::new();
    for creator in &mut committee.creators {
        creator.start_first_epoch();
    }
    committee.exchange(&committee.nth_units(0));
    let level_one = committee.nth_units(1);

    // Finish epoch 0 as above, then run epoch 1, the last one, to its end.
    let timing_unit = level_one[0].clone();
    for sender in &committee.last_timing {
        sender.send(timing_unit.clone()).unwrap();
    }
    committee.exchange(&level_one);
    committee.exchange(&committee.nth_units(2));
    let dealings: Vec<Arc<Unit>> = committee.outboxes.iter().map(Outbox::last).collect();
    committee.exchange(&dealings);
    let level_one = committee.nth_units(4);
    assert!(level_one.iter().all(|unit| unit.epoch() == EpochID::new(1) && unit.level() == 1));

    let timing_unit = level_one[2].clone();
    for sender in &committee.last_timing {
        sender.send(timing_unit.clone()).unwrap();
    }
    committee.exchange(&level_one);
    for outbox in &committee.outboxes {
        let last = outbox.last();
        assert_eq!((last.epoch(), last.level()), (EpochID::new(1), 2));
        assert!(last.data().is_empty());
    }
    assert!(committee.creators.iter().all(|creator| !creator.ready()));
}
