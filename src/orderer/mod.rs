/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The orderer runs the epochs of a process.
//!
//! At any time at most two [epochs](Epoch) are live: the *current* one, which the creator builds
//! on, and the *previous* one, kept so that units of slower processes can still be received and
//! served. Starting a new epoch closes and discards the previous one and demotes the current one.
//!
//! ## Epoch transitions
//!
//! A process moves to epoch `e + 1` in one of two ways:
//! 1. Its creator collects a quorum of epoch proof shares in epoch `e` and inserts the dealing unit of
//!    `e + 1` carrying the combined proof.
//! 2. It receives a dealing unit of `e + 1` whose proof passes [`EpochProofBuilder::verify`]. Units of
//!    future epochs without such a proof are dropped, and a gossip with their sender is requested.
//!
//! ## Threads
//!
//! Besides the adder workers of each epoch, the orderer is driven by two threads started with
//! [`start_ordering`] and [`start_gossip`]. The first turns the timing rounds decided by the
//! extenders into [preblocks](crate::app::Preblock), and signals the creator when an epoch's last
//! timing unit is decided. The second periodically asks a random peer for a gossip exchange, and
//! requests again the parents that are still missing.

pub mod epoch;

use std::{
    iter,
    sync::{
        mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, RwLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, SystemTime},
};

use rand::Rng;

use crate::{
    adder::AddPreunitError,
    alerter::{Alerter, CreatorLock},
    app::{Preblock, PreblockSink},
    creator::{CreatorInput, RandomSourceDataProvider, UnitSender},
    epoch_proof::EpochProofBuilder,
    events::*,
    networking::{messages::DagInfo, syncer::Syncer},
    ordering::{ExtenderFactory, TimingRound},
    random_source::{RandomSourceError, RandomSourceFactory},
    types::{
        crypto_primitives::VerifyingKey,
        data_types::{CryptoHash, EpochID, ProcessID, UnitID},
        unit::{Preunit, Unit},
    },
};

pub use self::epoch::Epoch;

#[derive(Clone)]
pub struct OrdererConfiguration {
    pub me: ProcessID,
    pub public_keys: Vec<VerifyingKey>,
    pub can_skip_level: bool,
    pub last_level: u32,
    pub number_of_epochs: u32,
    pub fetch_interval: Duration,
    pub poll_interval: Duration,
}

/// The pluggable parts an orderer delegates to.
#[derive(Clone)]
pub struct OrdererServices {
    pub alerter: Arc<dyn Alerter>,
    pub syncer: Arc<dyn Syncer>,
    pub random_source_factory: Arc<dyn RandomSourceFactory>,
    pub extender_factory: Arc<dyn ExtenderFactory>,
    pub epoch_proof: Arc<dyn EpochProofBuilder>,
}

#[derive(Default)]
struct Epochs {
    current: Option<Arc<Epoch>>,
    previous: Option<Arc<Epoch>>,
    stopped: bool,
}

impl Epochs {
    fn get(&self, id: EpochID) -> Option<&Arc<Epoch>> {
        [&self.current, &self.previous]
            .into_iter()
            .flatten()
            .find(|epoch| epoch.id() == id)
    }

    fn live(&self) -> impl Iterator<Item = &Arc<Epoch>> {
        [&self.previous, &self.current].into_iter().flatten()
    }
}

pub struct Orderer {
    config: OrdererConfiguration,
    epochs: RwLock<Epochs>,
    alerter: Arc<dyn Alerter>,
    syncer: Arc<dyn Syncer>,
    random_source_factory: Arc<dyn RandomSourceFactory>,
    extender_factory: Arc<dyn ExtenderFactory>,
    epoch_proof: Arc<dyn EpochProofBuilder>,
    belt: Sender<CreatorInput>,
    timing_rounds: Sender<TimingRound>,
    event_publisher: Option<Sender<Event>>,
}

impl Orderer {
    /// Create an orderer with epoch 0 live.
    ///
    /// Units of other processes inserted into any epoch are put on `belt`; the timing rounds decided
    /// in any epoch are sent to `timing_rounds`.
    pub fn new(
        config: OrdererConfiguration,
        services: OrdererServices,
        belt: Sender<CreatorInput>,
        timing_rounds: Sender<TimingRound>,
        event_publisher: Option<Sender<Event>>,
    ) -> Orderer {
        let orderer = Orderer {
            config,
            epochs: RwLock::new(Epochs::default()),
            alerter: services.alerter,
            syncer: services.syncer,
            random_source_factory: services.random_source_factory,
            extender_factory: services.extender_factory,
            epoch_proof: services.epoch_proof,
            belt,
            timing_rounds,
            event_publisher,
        };
        orderer.new_epoch(EpochID::new(0));
        orderer
    }

    pub fn config(&self) -> &OrdererConfiguration {
        &self.config
    }

    /// The live epoch `id`, and whether `id` lies beyond the current epoch.
    pub fn get_epoch(&self, id: EpochID) -> (Option<Arc<Epoch>>, bool) {
        let epochs = self.epochs.read().unwrap();
        let from_future = match &epochs.current {
            _ if epochs.stopped => false,
            Some(current) => id > current.id(),
            None => true,
        };
        (epochs.get(id).cloned(), from_future)
    }

    /// The epoch the creator currently builds on.
    pub fn current_epoch(&self) -> Option<Arc<Epoch>> {
        self.epochs.read().unwrap().current.clone()
    }

    /// Start epoch `id` if it lies beyond the current one. Returns the live epoch `id`, or `None` if
    /// it is neither live nor can be started.
    pub fn new_epoch(&self, id: EpochID) -> Option<Arc<Epoch>> {
        if id.int() >= self.config.number_of_epochs {
            log::debug!("epoch {} is beyond the last epoch", id);
            return None;
        }

        let (epoch, retired) = {
            let mut epochs = self.epochs.write().unwrap();
            if epochs.stopped {
                return None;
            }
            if let Some(epoch) = epochs.get(id) {
                return Some(epoch.clone());
            }
            if matches!(&epochs.current, Some(current) if current.id() > id) {
                return None;
            }
            let epoch = Arc::new(Epoch::new(id, self));
            let retired = epochs.previous.take();
            epochs.previous = epochs.current.replace(epoch.clone());
            (epoch, retired)
        };

        // Closing joins the retired epoch's workers, which never wait on the epochs lock.
        if let Some(retired) = retired {
            retired.close();
        }
        log::info!("process {} started epoch {}", self.config.me, id);
        Event::publish(
            &self.event_publisher,
            Event::NewEpoch(NewEpochEvent {
                timestamp: SystemTime::now(),
                epoch: id,
            }),
        );
        Some(epoch)
    }

    /// Mark `last_timing_unit` as the last timing unit of its epoch.
    pub fn finish_epoch(&self, last_timing_unit: &Unit) {
        let epoch = last_timing_unit.epoch();
        if let (Some(live), _) = self.get_epoch(epoch) {
            live.finish();
        }
        log::info!("process {} finished ordering epoch {}", self.config.me, epoch);
        Event::publish(
            &self.event_publisher,
            Event::FinishEpoch(FinishEpochEvent {
                timestamp: SystemTime::now(),
                epoch,
                last_timing_unit: last_timing_unit.hash(),
            }),
        );
    }

    /// Add `preunits` received from `source` to their epochs. Returns one result per preunit.
    ///
    /// Preunits are handled in runs of consecutive preunits of the same epoch.
    pub fn add_preunits(&self, source: ProcessID, preunits: Vec<Preunit>) -> Vec<Result<(), AddPreunitError>> {
        let count = preunits.len();
        let mut results = Vec::with_capacity(count);
        let mut preunits = preunits.into_iter().peekable();
        while let Some(first) = preunits.next() {
            let id = first.epoch();
            let mut run = vec![first];
            while let Some(next) = preunits.next_if(|preunit| preunit.epoch() == id) {
                run.push(next);
            }
            match self.retrieve_epoch(&run, source) {
                Ok(epoch) => results.extend(epoch.adder().add_preunits(source, run)),
                Err(error) => results.extend(iter::repeat(Err(error)).take(run.len())),
            }
        }

        Event::publish(
            &self.event_publisher,
            Event::ReceivePreunits(ReceivePreunitsEvent {
                timestamp: SystemTime::now(),
                origin: source,
                count,
                accepted: results.iter().filter(|result| result.is_ok()).count(),
            }),
        );
        results
    }

    /// The live epoch a run of preunits of one epoch belongs to, starting it if one of the preunits
    /// proves that the current epoch has finished.
    fn retrieve_epoch(&self, run: &[Preunit], source: ProcessID) -> Result<Arc<Epoch>, AddPreunitError> {
        let id = run[0].epoch();
        match self.get_epoch(id) {
            (Some(epoch), _) => Ok(epoch),
            (None, false) => Err(AddPreunitError::UnknownEpoch(id)),
            (None, true) if id.int() >= self.config.number_of_epochs => Err(AddPreunitError::UnknownEpoch(id)),
            (None, true) => {
                if run.iter().any(|preunit| self.epoch_proof.verify(preunit)) {
                    self.new_epoch(id).ok_or(AddPreunitError::UnknownEpoch(id))
                } else {
                    log::info!(
                        "no valid proof for epoch {} from process {}, requesting a gossip",
                        id,
                        source
                    );
                    self.syncer.request_gossip(source);
                    Err(AddPreunitError::InvalidEpochProof(id))
                }
            }
        }
    }

    /// Insert a unit created by this process, then multicast it. Returns `None` if the unit's epoch
    /// is no longer live.
    pub fn insert_own_unit(&self, unit: Unit) -> Option<Arc<Unit>> {
        let epoch = match self.get_epoch(unit.epoch()) {
            (Some(epoch), _) => epoch,
            (None, true) => self.new_epoch(unit.epoch())?,
            (None, false) => {
                log::warn!(
                    "dropped own unit {:?}: epoch {} is no longer live",
                    unit.id(),
                    unit.epoch()
                );
                return None;
            }
        };

        let unit = {
            let _lock = CreatorLock::acquire(self.alerter.as_ref(), unit.creator());
            match epoch.dag().get_unit(&unit.hash()) {
                Some(known) => known,
                None => epoch.dag().insert(unit),
            }
        };
        epoch.adder().resolve_missing(&unit);
        self.syncer.multicast(&unit);
        Event::publish(
            &self.event_publisher,
            Event::CreateUnit(CreateUnitEvent {
                timestamp: SystemTime::now(),
                unit: unit.id(),
                hash: unit.hash(),
                level: unit.level(),
            }),
        );
        Some(unit)
    }

    /// The random-source data of a new unit of `epoch`. Dealing units get theirs from the factory,
    /// since their epoch may not be live yet.
    pub fn random_source_data(
        &self,
        epoch: EpochID,
        parents: &[Option<Arc<Unit>>],
        level: u32,
    ) -> Result<Vec<u8>, RandomSourceError> {
        if level == 0 && parents.iter().all(Option::is_none) {
            return self.random_source_factory.dealing_data(epoch);
        }
        match self.get_epoch(epoch) {
            (Some(live), _) => live.random_source().data_to_include(parents, level),
            (None, _) => Err(RandomSourceError::Failed(format!("epoch {} is not live", epoch))),
        }
    }

    /// What this process has, per live epoch, as `[previous, current]`.
    pub fn get_info(&self) -> [Option<DagInfo>; 2] {
        let epochs = self.epochs.read().unwrap();
        let info = |epoch: &Option<Arc<Epoch>>| {
            epoch.as_ref().map(|epoch| DagInfo {
                epoch: epoch.id(),
                heights: epoch.dag().max_view(),
            })
        };
        [info(&epochs.previous), info(&epochs.current)]
    }

    /// The units a peer that reported `info` is missing: everything above its heights in the epochs
    /// both sides know, and the whole current epoch if the peer reported only older epochs. A peer
    /// reporting nothing gets nothing.
    pub fn delta(&self, info: &[Option<DagInfo>; 2]) -> Vec<Arc<Unit>> {
        let epochs = self.epochs.read().unwrap();
        let reported: Vec<&DagInfo> = info.iter().flatten().collect();

        let mut result = Vec::new();
        for epoch in epochs.live() {
            for info in reported.iter().filter(|info| info.epoch == epoch.id()) {
                if info.heights.len() == epoch.dag().nproc() {
                    result.extend(epoch.dag().units_above(Some(info.heights.as_slice())));
                }
            }
        }
        if let Some(current) = &epochs.current {
            if !reported.is_empty() && reported.iter().all(|info| info.epoch < current.id()) {
                result.extend(current.dag().units_above(None));
            }
        }
        result
    }

    /// Units with the given ids, from any live epoch. Forks yield more than one unit per id.
    pub fn units_by_id(&self, ids: &[UnitID]) -> Vec<Arc<Unit>> {
        let epochs = self.epochs.read().unwrap();
        ids.iter()
            .filter_map(|id| epochs.get(id.epoch()).map(|epoch| epoch.dag().get_by_id(*id)))
            .flatten()
            .collect()
    }

    /// The units with the given hashes, looked up in the current epoch first.
    pub fn units_by_hash(&self, hashes: &[CryptoHash]) -> Vec<Option<Arc<Unit>>> {
        let epochs = self.epochs.read().unwrap();
        hashes
            .iter()
            .map(|hash| {
                [&epochs.current, &epochs.previous]
                    .into_iter()
                    .flatten()
                    .find_map(|epoch| epoch.dag().get_unit(hash))
            })
            .collect()
    }

    /// The maximal units of every creator in epoch `id`, if it is live.
    pub fn max_units(&self, id: EpochID) -> Option<Vec<Vec<Arc<Unit>>>> {
        let epochs = self.epochs.read().unwrap();
        epochs.get(id).map(|epoch| epoch.dag().maximal_units())
    }

    /// Ask a random other process for a gossip exchange, and request again the missing parents of
    /// the current epoch.
    pub fn gossip(&self) {
        let nproc = self.config.public_keys.len();
        if nproc > 1 {
            let mut peer = rand::thread_rng().gen_range(0, nproc - 1);
            if peer >= self.config.me.index() {
                peer += 1;
            }
            self.syncer.request_gossip(ProcessID::new(peer as u16));
        }
        if let Some(current) = self.current_epoch() {
            current.adder().refetch_missing();
        }
    }

    /// Close every live epoch. Units inserted afterwards are dropped and no epoch is started again.
    pub fn stop(&self) {
        let retired: Vec<Arc<Epoch>> = {
            let mut epochs = self.epochs.write().unwrap();
            epochs.stopped = true;
            [epochs.previous.take(), epochs.current.take()].into_iter().flatten().collect()
        };
        for epoch in retired {
            epoch.close();
        }
    }
}

impl UnitSender for Arc<Orderer> {
    fn send(&mut self, unit: Unit) -> Option<Arc<Unit>> {
        self.insert_own_unit(unit)
    }
}

impl RandomSourceDataProvider for Arc<Orderer> {
    fn random_source_data(
        &self,
        epoch: EpochID,
        parents: &[Option<Arc<Unit>>],
        level: u32,
    ) -> Result<Vec<u8>, RandomSourceError> {
        Orderer::random_source_data(self, epoch, parents, level)
    }
}

/// Turns timing rounds into preblocks.
pub struct TimingRoundHandler {
    orderer: Arc<Orderer>,
    last_timing: Sender<Arc<Unit>>,
    preblock_sink: Box<dyn PreblockSink>,
    latest: EpochID,
}

impl TimingRoundHandler {
    /// `last_timing` receives the last timing unit of every epoch, for the creator.
    pub fn new(
        orderer: Arc<Orderer>,
        last_timing: Sender<Arc<Unit>>,
        preblock_sink: Box<dyn PreblockSink>,
    ) -> TimingRoundHandler {
        TimingRoundHandler {
            orderer,
            last_timing,
            preblock_sink,
            latest: EpochID::new(0),
        }
    }

    /// Deliver the preblock of `round`, unless a round of a later epoch was already delivered.
    pub fn handle(&mut self, round: TimingRound) {
        let timing_unit = round.timing_unit().clone();
        let epoch = timing_unit.epoch();
        let event_publisher = &self.orderer.event_publisher;
        Event::publish(
            event_publisher,
            Event::OrderRound(OrderRoundEvent {
                timestamp: SystemTime::now(),
                epoch,
                timing_unit: timing_unit.hash(),
                level: timing_unit.level(),
                units: round.len(),
            }),
        );

        if timing_unit.level() >= self.orderer.config.last_level {
            // The creator only disconnects on shutdown.
            let _ = self.last_timing.send(timing_unit.clone());
            self.orderer.finish_epoch(&timing_unit);
        }

        if epoch < self.latest {
            log::debug!("skipped a timing round of epoch {} after epoch {}", epoch, self.latest);
            return;
        }
        self.latest = epoch;
        let preblock = Preblock::from_round(&round);
        let data_items = preblock.data.len();
        self.preblock_sink.deliver(preblock);
        Event::publish(
            event_publisher,
            Event::DeliverPreblock(DeliverPreblockEvent {
                timestamp: SystemTime::now(),
                epoch,
                data_items,
            }),
        );
    }
}

/// Start the thread that feeds the timing rounds of every epoch to `handler`.
pub(crate) fn start_ordering(
    mut handler: TimingRoundHandler,
    timing_rounds: Receiver<TimingRound>,
    shutdown_signal: Receiver<()>,
    poll_interval: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Ordering thread disconnected from main thread")
            }
        }

        match timing_rounds.recv_timeout(poll_interval) {
            Ok(round) => handler.handle(round),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

/// Start the thread that calls [`Orderer::gossip`] every `gossip_interval`.
pub(crate) fn start_gossip(
    orderer: Arc<Orderer>,
    shutdown_signal: Receiver<()>,
    gossip_interval: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.recv_timeout(gossip_interval) {
            Ok(()) => return,
            Err(RecvTimeoutError::Timeout) => orderer.gossip(),
            Err(RecvTimeoutError::Disconnected) => {
                panic!("Gossip thread disconnected from main thread")
            }
        }
    })
}
