//! The orderer of a single process, with the network and the creator replaced by channels.

use std::{
    collections::HashSet,
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    time::Duration,
};

use aleph_rs::{
    adder::AddPreunitError,
    alerter::LocalAlerter,
    creator::CreatorInput,
    epoch_proof::{EpochProofBuilder, MultisigEpochProof},
    events::Event,
    networking::messages::DagInfo,
    orderer::{Orderer, OrdererConfiguration, OrdererServices, TimingRoundHandler},
    ordering::TimingRound,
    random_source::RandomSourceError,
    types::{
        crypto_primitives::{Keypair, SigningKey},
        data_types::{CryptoHash, EpochID, ProcessID, UnitID},
        unit::{level_from_parents, Preunit, Unit},
    },
};
use log::LevelFilter;

mod common;

use crate::common::{
    logging::setup_logger,
    mocks::{LevelRandomSourceFactory, RecordingSyncer, RoundRobinExtenderFactory, SharedSink},
    units::{dealings, make_unit, public_keys, signing_keys, wait_until},
};

const NPROC: usize = 4;
const LAST_LEVEL: u32 = 2;
const TIMEOUT: Duration = Duration::from_secs(5);

/// The orderer of process 0, and the ends of every channel it writes to.
struct Harness {
    keys: Vec<SigningKey>,
    orderer: Arc<Orderer>,
    syncer: Arc<RecordingSyncer>,
    belt: Receiver<CreatorInput>,
    rounds: Receiver<TimingRound>,
    events: Receiver<Event>,
}

impl Harness {
    fn new(number_of_epochs: u32) -> Harness {
        setup_logger(LevelFilter::Info);
        let keys = signing_keys(NPROC);
        let syncer = Arc::new(RecordingSyncer::default());
        let (belt, belt_receiver) = mpsc::channel();
        let (rounds, rounds_receiver) = mpsc::channel();
        let (events, events_receiver) = mpsc::channel();
        let orderer = Orderer::new(
            OrdererConfiguration {
                me: ProcessID::new(0),
                public_keys: public_keys(&keys),
                can_skip_level: false,
                last_level: LAST_LEVEL,
                number_of_epochs,
                fetch_interval: Duration::from_secs(60),
                poll_interval: Duration::from_millis(10),
            },
            OrdererServices {
                alerter: Arc::new(LocalAlerter::new(NPROC)),
                syncer: syncer.clone(),
                random_source_factory: Arc::new(LevelRandomSourceFactory),
                extender_factory: Arc::new(RoundRobinExtenderFactory),
                epoch_proof: Arc::new(MultisigEpochProof::new(
                    ProcessID::new(0),
                    Keypair::new(keys[0].clone()),
                    public_keys(&keys),
                    LAST_LEVEL,
                )),
            },
            belt,
            rounds,
            Some(events),
        );
        Harness {
            keys,
            orderer: Arc::new(orderer),
            syncer,
            belt: belt_receiver,
            rounds: rounds_receiver,
            events: events_receiver,
        }
    }

    /// A dealing unit of this process, not yet inserted. Equal to `dealings(keys, epoch)[0]`.
    fn own_dealing(&self, epoch: u32) -> Unit {
        let parents = vec![None; NPROC];
        let level = level_from_parents(&parents);
        Unit::new(
            ProcessID::new(0),
            EpochID::new(epoch),
            parents,
            level,
            vec![0],
            Vec::new(),
            &Keypair::new(self.keys[0].clone()),
        )
    }

    fn add(&self, from: u16, units: &[&Arc<Unit>]) -> Vec<Result<(), AddPreunitError>> {
        let preunits = units.iter().map(|unit| unit.preunit().clone()).collect();
        self.orderer.add_preunits(ProcessID::new(from), preunits)
    }

    fn epoch_len(&self, epoch: u32) -> usize {
        match self.orderer.get_epoch(EpochID::new(epoch)) {
            (Some(epoch), _) => epoch.dag().len(),
            (None, _) => 0,
        }
    }

    /// A dealing of `pid` in `epoch + 1`, carrying a proof that `timing_unit` ended `epoch`.
    fn next_epoch_dealing(&self, pid: usize, timing_unit: &Unit) -> Preunit {
        let epoch = timing_unit.epoch().int();
        let collector = MultisigEpochProof::new(
            ProcessID::new(pid as u16),
            Keypair::new(self.keys[pid].clone()),
            public_keys(&self.keys),
            0,
        );
        let mut proof = None;
        for signer in 1..NPROC {
            let builder = MultisigEpochProof::new(
                ProcessID::new(signer as u16),
                Keypair::new(self.keys[signer].clone()),
                public_keys(&self.keys),
                0,
            );
            let share = builder.build_share(timing_unit);
            let carrier = make_unit(&self.keys, signer, epoch, vec![None; NPROC], share);
            proof = proof.or(collector.try_building(&carrier));
        }
        make_unit(&self.keys, pid, epoch + 1, vec![None; NPROC], proof.unwrap())
            .preunit()
            .clone()
    }
}

fn all_of(units: &[Arc<Unit>]) -> Vec<Option<Arc<Unit>>> {
    units.iter().cloned().map(Some).collect()
}

#[test]
fn inserted_units_feed_the_belt_and_the_extender() {
    let harness = Harness::new(1);
    let dealings = dealings(&harness.keys, 0);

    let own = harness.orderer.insert_own_unit(harness.own_dealing(0)).unwrap();
    assert_eq!(own.hash(), dealings[0].hash());
    assert_eq!(harness.syncer.multicasts.lock().unwrap().len(), 1);

    let results = harness.add(1, &[&dealings[1], &dealings[2], &dealings[3]]);
    assert_eq!(results, vec![Ok(()), Ok(()), Ok(())]);
    assert!(wait_until(TIMEOUT, || harness.epoch_len(0) == 4));
    assert!(harness.rounds.try_recv().is_err());

    let level_one: Vec<Arc<Unit>> = (1..NPROC)
        .map(|pid| make_unit(&harness.keys, pid, 0, all_of(&dealings), Vec::new()))
        .collect();
    harness.add(2, &[&level_one[0], &level_one[1], &level_one[2]]);

    // A quorum on level 1 decides level 0, whose timing unit is process 0's dealing.
    let round = harness.rounds.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(round.timing_unit().hash(), dealings[0].hash());
    assert_eq!(round.len(), 1);

    // Everything but the own dealing goes on the belt.
    let on_belt: Vec<ProcessID> = (0..6)
        .map(|_| match harness.belt.recv_timeout(TIMEOUT).unwrap() {
            CreatorInput::Unit(unit) => unit.creator(),
            CreatorInput::FreezeParent(process) => panic!("unexpected freeze of {}", process),
        })
        .collect();
    assert!(on_belt.iter().all(|creator| *creator != ProcessID::new(0)));
    assert!(harness.belt.try_recv().is_err());
}

#[test]
fn future_epochs_are_only_started_with_a_valid_proof() {
    let harness = Harness::new(3);
    let dealings = dealings(&harness.keys, 0);

    let unproven = make_unit(&harness.keys, 1, 1, vec![None; NPROC], Vec::new());
    assert_eq!(
        harness.add(1, &[&unproven]),
        vec![Err(AddPreunitError::InvalidEpochProof(EpochID::new(1)))]
    );
    assert_eq!(*harness.syncer.gossips.lock().unwrap(), vec![ProcessID::new(1)]);
    assert!(harness.orderer.get_epoch(EpochID::new(1)).0.is_none());

    let beyond = make_unit(&harness.keys, 1, 3, vec![None; NPROC], Vec::new());
    assert_eq!(
        harness.add(1, &[&beyond]),
        vec![Err(AddPreunitError::UnknownEpoch(EpochID::new(3)))]
    );

    let proven = harness.next_epoch_dealing(2, &dealings[3]);
    let results = harness.orderer.add_preunits(ProcessID::new(2), vec![proven.clone()]);
    assert_eq!(results, vec![Ok(())]);
    assert_eq!(harness.orderer.current_epoch().unwrap().id(), EpochID::new(1));
    assert!(wait_until(TIMEOUT, || harness.epoch_len(1) == 1));

    // Epoch 0 stays live as the previous epoch.
    assert_eq!(harness.add(1, &[&dealings[1]]), vec![Ok(())]);
    assert!(wait_until(TIMEOUT, || harness.epoch_len(0) == 1));
}

#[test]
fn new_epochs_are_idempotent_and_retire_the_oldest() {
    let harness = Harness::new(3);
    let first = harness.orderer.current_epoch().unwrap();
    assert_eq!(first.id(), EpochID::new(0));

    let second = harness.orderer.new_epoch(EpochID::new(1)).unwrap();
    assert!(Arc::ptr_eq(&second, &harness.orderer.new_epoch(EpochID::new(1)).unwrap()));
    assert!(Arc::ptr_eq(&first, &harness.orderer.new_epoch(EpochID::new(0)).unwrap()));

    harness.orderer.new_epoch(EpochID::new(2)).unwrap();
    assert_eq!(harness.orderer.get_epoch(EpochID::new(0)).0.map(|epoch| epoch.id()), None);
    assert!(!harness.orderer.get_epoch(EpochID::new(0)).1);
    assert!(harness.orderer.get_epoch(EpochID::new(1)).0.is_some());
    assert!(harness.orderer.new_epoch(EpochID::new(0)).is_none());
    assert!(harness.orderer.new_epoch(EpochID::new(3)).is_none());

    let old = make_unit(&harness.keys, 1, 0, vec![None; NPROC], Vec::new());
    assert_eq!(
        harness.add(1, &[&old]),
        vec![Err(AddPreunitError::UnknownEpoch(EpochID::new(0)))]
    );
    assert!(harness.orderer.insert_own_unit(harness.own_dealing(0)).is_none());

    let started: Vec<EpochID> = harness
        .events
        .try_iter()
        .filter_map(|event| match event {
            Event::NewEpoch(new_epoch) => Some(new_epoch.epoch),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![EpochID::new(0), EpochID::new(1), EpochID::new(2)]);
}

#[test]
fn own_units_may_start_the_next_epoch() {
    let harness = Harness::new(2);
    let unit = harness.orderer.insert_own_unit(harness.own_dealing(1)).unwrap();
    assert_eq!(unit.epoch(), EpochID::new(1));
    assert_eq!(harness.orderer.current_epoch().unwrap().id(), EpochID::new(1));
    assert_eq!(harness.epoch_len(1), 1);
}

#[test]
fn preunits_are_handled_in_runs_of_one_epoch() {
    let harness = Harness::new(2);
    let first = make_unit(&harness.keys, 1, 0, vec![None; NPROC], Vec::new());
    let future = make_unit(&harness.keys, 2, 1, vec![None; NPROC], Vec::new());
    let last = make_unit(&harness.keys, 3, 0, vec![None; NPROC], Vec::new());

    let results = harness.add(1, &[&first, &future, &last]);
    assert_eq!(
        results,
        vec![
            Ok(()),
            Err(AddPreunitError::InvalidEpochProof(EpochID::new(1))),
            Ok(())
        ]
    );

    let received: Vec<(usize, usize)> = harness
        .events
        .try_iter()
        .filter_map(|event| match event {
            Event::ReceivePreunits(receive) => Some((receive.count, receive.accepted)),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![(3, 2)]);
}

#[test]
fn peers_are_answered_from_the_live_epochs() {
    let harness = Harness::new(1);
    let dealings = dealings(&harness.keys, 0);
    harness.orderer.insert_own_unit(harness.own_dealing(0));
    harness.add(1, &[&dealings[1], &dealings[2], &dealings[3]]);
    assert!(wait_until(TIMEOUT, || harness.epoch_len(0) == 4));

    let info = harness.orderer.get_info();
    assert_eq!(info[0], None);
    assert_eq!(
        info[1],
        Some(DagInfo {
            epoch: EpochID::new(0),
            heights: vec![Some(0); NPROC]
        })
    );

    let peer = DagInfo {
        epoch: EpochID::new(0),
        heights: vec![Some(0), None, None, None],
    };
    let delta: HashSet<CryptoHash> = harness
        .orderer
        .delta(&[None, Some(peer)])
        .iter()
        .map(|unit| unit.hash())
        .collect();
    let expected: HashSet<CryptoHash> = dealings[1..].iter().map(|unit| unit.hash()).collect();
    assert_eq!(delta, expected);
    assert!(harness.orderer.delta(&[None, None]).is_empty());

    let id = UnitID::new(0, ProcessID::new(2), EpochID::new(0));
    assert_eq!(harness.orderer.units_by_id(&[id])[0].hash(), dealings[2].hash());
    let by_hash = harness.orderer.units_by_hash(&[dealings[3].hash(), CryptoHash::zero()]);
    assert!(by_hash[0].is_some() && by_hash[1].is_none());
    let maximal = harness.orderer.max_units(EpochID::new(0)).unwrap();
    assert!(maximal.iter().all(|units| units.len() == 1));
    assert!(harness.orderer.max_units(EpochID::new(1)).is_none());
}

#[test]
fn peers_behind_the_current_epoch_get_all_of_it() {
    let harness = Harness::new(2);
    let own = harness.orderer.insert_own_unit(harness.own_dealing(1)).unwrap();
    assert_eq!(harness.orderer.current_epoch().unwrap().id(), EpochID::new(1));

    let behind = DagInfo {
        epoch: EpochID::new(0),
        heights: vec![None; NPROC],
    };
    let delta = harness.orderer.delta(&[None, Some(behind.clone())]);
    assert_eq!(delta.len(), 1);
    assert_eq!(delta[0].hash(), own.hash());

    let caught_up = DagInfo {
        epoch: EpochID::new(1),
        heights: vec![Some(0), None, None, None],
    };
    assert!(harness.orderer.delta(&[Some(behind), Some(caught_up)]).is_empty());
    assert!(harness.orderer.delta(&[None, None]).is_empty());
}

#[test]
fn stopped_orderers_start_no_epochs() {
    let harness = Harness::new(3);
    let dealings = dealings(&harness.keys, 0);
    harness.orderer.stop();
    assert!(harness.orderer.current_epoch().is_none());

    assert!(harness.orderer.insert_own_unit(harness.own_dealing(0)).is_none());
    assert!(harness.orderer.insert_own_unit(harness.own_dealing(1)).is_none());
    assert!(harness.orderer.new_epoch(EpochID::new(1)).is_none());

    let proven = harness.next_epoch_dealing(2, &dealings[3]);
    assert_eq!(
        harness.orderer.add_preunits(ProcessID::new(2), vec![proven]),
        vec![Err(AddPreunitError::UnknownEpoch(EpochID::new(1)))]
    );
    assert_eq!(
        harness.add(1, &[&dealings[1]]),
        vec![Err(AddPreunitError::UnknownEpoch(EpochID::new(0)))]
    );
    assert!(harness.orderer.current_epoch().is_none());
    assert!(harness.syncer.multicasts.lock().unwrap().is_empty());
    assert!(harness.syncer.gossips.lock().unwrap().is_empty());

    let started = harness
        .events
        .try_iter()
        .filter(|event| matches!(event, Event::NewEpoch(_)))
        .count();
    assert_eq!(started, 1);
}

#[test]
fn random_source_data_comes_from_the_factory_or_the_epoch() {
    let harness = Harness::new(3);
    let dealing_data = harness
        .orderer
        .random_source_data(EpochID::new(2), &[None, None, None, None], 0)
        .unwrap();
    assert_eq!(dealing_data, 2u32.to_le_bytes().to_vec());

    let dealings = dealings(&harness.keys, 0);
    let level_one = harness
        .orderer
        .random_source_data(EpochID::new(0), &all_of(&dealings), 1)
        .unwrap();
    assert_eq!(level_one, 1u32.to_le_bytes().to_vec());

    let not_live = harness.orderer.random_source_data(EpochID::new(1), &all_of(&dealings), 1);
    assert!(matches!(not_live, Err(RandomSourceError::Failed(_))));
}

#[test]
fn gossip_asks_some_other_process() {
    let harness = Harness::new(1);
    for _ in 0..20 {
        harness.orderer.gossip();
    }
    let gossips = harness.syncer.gossips.lock().unwrap();
    assert_eq!(gossips.len(), 20);
    assert!(gossips
        .iter()
        .all(|peer| *peer != ProcessID::new(0) && peer.index() < NPROC));
}

#[test]
fn timing_rounds_become_preblocks_in_epoch_order() {
    let harness = Harness::new(2);
    let (last_timing, last_timing_receiver) = mpsc::channel();
    let sink = SharedSink::default();
    let mut handler = TimingRoundHandler::new(harness.orderer.clone(), last_timing, Box::new(sink.clone()));

    let old_dealings = dealings(&harness.keys, 0);
    let new_dealings = dealings(&harness.keys, 1);
    let level_one: Vec<Arc<Unit>> = (0..NPROC)
        .map(|pid| make_unit(&harness.keys, pid, 1, all_of(&new_dealings), vec![pid as u8]))
        .collect();
    let level_two = make_unit(&harness.keys, 0, 1, all_of(&level_one), vec![9]);
    harness.orderer.new_epoch(EpochID::new(1));

    let round = |units: Vec<Arc<Unit>>| TimingRound::new(units).unwrap();
    handler.handle(round(vec![old_dealings[0].clone()]));
    handler.handle(round(vec![new_dealings[1].clone()]));
    handler.handle(round(vec![old_dealings[2].clone()]));
    handler.handle(round(vec![level_one[1].clone(), level_one[2].clone(), level_two.clone()]));

    let preblocks = sink.preblocks();
    let epochs: Vec<EpochID> = preblocks.iter().map(|preblock| preblock.epoch).collect();
    assert_eq!(epochs, vec![EpochID::new(0), EpochID::new(1), EpochID::new(1)]);
    assert!(preblocks[0].data.is_empty());
    assert_eq!(preblocks[2].data, vec![vec![1], vec![2], vec![9]]);
    assert_eq!(preblocks[2].random_bytes, level_two.random_source_data().to_vec());

    assert_eq!(last_timing_receiver.try_recv().unwrap().hash(), level_two.hash());
    assert!(harness.orderer.get_epoch(EpochID::new(1)).0.unwrap().is_finished());
}
