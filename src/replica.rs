/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a replica.
//!
//! aleph-rs orders the data of a fixed committee of processes. In our terminology, these processes are
//! called 'replicas'. Each replica is identified by its index in the committee, its
//! [`ProcessID`], and signs its units with an [Ed25519 key](ed25519_dalek::SigningKey).
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the replica](ReplicaSpec) with:
//!   1. `ReplicaSpec::builder` to construct a `ReplicaSpecBuilder`,
//!   2. The setters of the `ReplicaSpecBuilder`, and
//!   3. The `ReplicaSpecBuilder::build` method to construct a [ReplicaSpec],
//! - The function to [start](ReplicaSpec::start) a [Replica] given its specification,
//! - [The type](Replica) which keeps the replica alive.
//!
//! ## Networking
//!
//! Replicas do not own a network. Outgoing traffic goes through the library user's
//! [`Syncer`], and incoming units are handed to the replica's [orderer](Replica::orderer):
//! - Chunks of preunits (see [`decode_chunk`](crate::networking::messages::decode_chunk)) go to
//!   [`Orderer::add_preunits`].
//! - Fetch requests are answered with [`Orderer::units_by_id`].
//! - Gossip requests are answered with [`Orderer::delta`] of the peer's [`Orderer::get_info`].
//!
//! ## Starting a replica
//!
//! ```ignore
//! let replica =
//!     ReplicaSpec::builder()
//!     .configuration(configuration)
//!     .data_source(data_source)
//!     .preblock_sink(preblock_sink)
//!     .syncer(syncer)
//!     .random_source_factory(random_source_factory)
//!     .extender_factory(extender_factory)
//!     .on_deliver_preblock(deliver_handler)
//!     .build()
//!     .start()
//! ```
//!
//! ### Required setters
//!
//! - `.configuration(...)`
//! - `.data_source(...)`
//! - `.preblock_sink(...)`
//! - `.syncer(...)`
//! - `.random_source_factory(...)`
//! - `.extender_factory(...)`
//!
//! ### Optional setters
//!
//! - `.alerter(...)`, defaulting to a [`LocalAlerter`].
//! - `.epoch_proof(...)`, defaulting to a [`MultisigEpochProof`] over the committee's keys.
//! - The handlers of the events in [crate::events]: `.on_insert_unit(...)`, `.on_create_unit(...)`,
//!   `.on_receive_preunits(...)`, `.on_new_epoch(...)`, `.on_finish_epoch(...)`,
//!   `.on_order_round(...)` and `.on_deliver_preblock(...)`.
//!
//! The replica's [configuration](Configuration) can also be defined using the builder pattern, for example:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(keypair)
//!     .pid(ProcessID::new(0))
//!     .public_keys(public_keys)
//!     .can_skip_level(true)
//!     .last_level(20)
//!     .number_of_epochs(3)
//!     .fetch_interval(Duration::from_millis(500))
//!     .poll_interval(Duration::from_millis(10))
//!     .gossip_interval(Duration::from_secs(1))
//!     .log_events(true)
//!     .build()
//! ```

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::alerter::{Alerter, LocalAlerter, ObserverID};
use crate::app::{DataSource, PreblockSink};
use crate::creator::{Creator, CreatorConfiguration, CreatorInput};
use crate::epoch_proof::{EpochProofBuilder, MultisigEpochProof};
use crate::event_bus::*;
use crate::events::*;
use crate::networking::syncer::Syncer;
use crate::orderer::{
    start_gossip, start_ordering, Orderer, OrdererConfiguration, OrdererServices, TimingRoundHandler,
};
use crate::ordering::ExtenderFactory;
use crate::random_source::RandomSourceFactory;
use crate::types::crypto_primitives::{Keypair, VerifyingKey};
use crate::types::data_types::ProcessID;
use crate::types::unit::Preunit;

/// Stores the user-defined parameters required to start the replica, that is:
/// 1. The replica's [keypair](ed25519_dalek::SigningKey).
/// 2. The replica's index in the committee.
/// 3. The public keys of the whole committee, in index order.
/// 4. Whether units may skip levels. Setup runs disallow it.
/// 5. The level at which the timing unit of an epoch ends the epoch.
/// 6. The number of epochs to run.
/// 7. How long to wait before requesting a missing parent again.
/// 8. How long worker threads block on an empty queue before checking for a shutdown signal.
/// 9. How often to gossip with a random peer.
/// 10. The "Log Events" flag, if set to "true" then logs should be printed.
///
/// ## Log Events
///
/// aleph-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.pid(...)`
    - `.public_keys(...)`
    - `.can_skip_level(...)`
    - `.last_level(...)`
    - `.number_of_epochs(...)`
    - `.fetch_interval(...)`
    - `.poll_interval(...)`
    - `.gossip_interval(...)`
    - `.log_events(...)`
"
))]
pub struct Configuration {
    #[builder(setter(doc = "Set the replica's keypair, used to sign units. Required."))]
    pub me: SigningKey,
    #[builder(setter(doc = "Set the replica's index in the committee. Required."))]
    pub pid: ProcessID,
    #[builder(setter(doc = "Set the public keys of the committee, indexed by process. Required."))]
    pub public_keys: Vec<VerifyingKey>,
    #[builder(setter(doc = "Allow units to climb more than one level above their predecessor? Required."))]
    pub can_skip_level: bool,
    #[builder(setter(doc = "Set the level at which the timing unit of an epoch ends the epoch. Required."))]
    pub last_level: u32,
    #[builder(setter(doc = "Set the number of epochs to run. Required."))]
    pub number_of_epochs: u32,
    #[builder(setter(doc = "Set the time after which a missing parent is requested again. Required."))]
    pub fetch_interval: Duration,
    #[builder(setter(doc = "Set how long worker threads wait on an empty queue. Required."))]
    pub poll_interval: Duration,
    #[builder(setter(doc = "Set the time between two gossip requests. Required."))]
    pub gossip_interval: Duration,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

impl Into<(CreatorConfiguration, OrdererConfiguration)> for Configuration {
    fn into(self) -> (CreatorConfiguration, OrdererConfiguration) {
        let creator_config = CreatorConfiguration {
            me: self.pid,
            keypair: Keypair::new(self.me),
            nproc: self.public_keys.len(),
            can_skip_level: self.can_skip_level,
            last_level: self.last_level,
            number_of_epochs: self.number_of_epochs,
        };
        let orderer_config = OrdererConfiguration {
            me: self.pid,
            public_keys: self.public_keys,
            can_skip_level: self.can_skip_level,
            last_level: self.last_level,
            number_of_epochs: self.number_of_epochs,
            fetch_interval: self.fetch_interval,
            poll_interval: self.poll_interval,
        };
        (creator_config, orderer_config)
    }
}

/// Stores all necessary parameters and trait implementations required to run the [Replica].
#[derive(TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [ReplicaSpec]. On the builder call the following methods to construct a valid [ReplicaSpec].

    Required:
    - `.configuration(...)`
    - `.data_source(...)`
    - `.preblock_sink(...)`
    - `.syncer(...)`
    - `.random_source_factory(...)`
    - `.extender_factory(...)`

    Optional:
    - `.alerter(...)`
    - `.epoch_proof(...)`
    - `.on_insert_unit(...)`
    - `.on_create_unit(...)`
    - `.on_receive_preunits(...)`
    - `.on_new_epoch(...)`
    - `.on_finish_epoch(...)`
    - `.on_order_round(...)`
    - `.on_deliver_preblock(...)`
"
))]
pub struct ReplicaSpec<D: DataSource + 'static, P: PreblockSink + 'static> {
    // Required parameters
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a replica. Required."))]
    configuration: Configuration,
    #[builder(setter(doc = "Set the source of the application data put into units. Required."))]
    data_source: D,
    #[builder(setter(doc = "Set the receiver of the ordered preblocks. Required."))]
    preblock_sink: P,
    #[builder(setter(doc = "Set the implementation of the outgoing network requests. Required."))]
    syncer: Arc<dyn Syncer>,
    #[builder(setter(doc = "Set the factory of the per-epoch random sources. Required."))]
    random_source_factory: Arc<dyn RandomSourceFactory>,
    #[builder(setter(doc = "Set the factory of the per-epoch extenders, which order the DAG. Required."))]
    extender_factory: Arc<dyn ExtenderFactory>,
    // Optional parameters
    #[builder(default, setter(strip_option, doc = "Set the fork handling. Defaults to a [LocalAlerter]. Optional."))]
    alerter: Option<Arc<dyn Alerter>>,
    #[builder(default, setter(strip_option, doc = "Set the builder of epoch proofs. Defaults to a [MultisigEpochProof]. Optional."))]
    epoch_proof: Option<Arc<dyn EpochProofBuilder>>,
    #[builder(default, setter(transform = |handler: impl Fn(&InsertUnitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<InsertUnitEvent>),
    doc = "Register a handler closure to be invoked after a unit is inserted into the DAG of its epoch. Optional."))]
    on_insert_unit: Option<HandlerPtr<InsertUnitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CreateUnitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CreateUnitEvent>),
    doc = "Register a handler closure to be invoked after the replica creates and multicasts a unit. Optional."))]
    on_create_unit: Option<HandlerPtr<CreateUnitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceivePreunitsEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceivePreunitsEvent>),
    doc = "Register a handler closure to be invoked after the replica handles preunits received from a peer. Optional."))]
    on_receive_preunits: Option<HandlerPtr<ReceivePreunitsEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewEpochEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewEpochEvent>),
    doc = "Register a handler closure to be invoked after the replica starts an epoch. Optional."))]
    on_new_epoch: Option<HandlerPtr<NewEpochEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FinishEpochEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FinishEpochEvent>),
    doc = "Register a handler closure to be invoked after the last timing unit of an epoch is decided. Optional."))]
    on_finish_epoch: Option<HandlerPtr<FinishEpochEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&OrderRoundEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<OrderRoundEvent>),
    doc = "Register a handler closure to be invoked after a timing round is decided. Optional."))]
    on_order_round: Option<HandlerPtr<OrderRoundEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DeliverPreblockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DeliverPreblockEvent>),
    doc = "Register a handler closure to be invoked after a preblock is delivered to the preblock sink. Optional."))]
    on_deliver_preblock: Option<HandlerPtr<DeliverPreblockEvent>>,
}

impl<D: DataSource + 'static, P: PreblockSink + 'static> ReplicaSpec<D, P> {
    /// Starts all threads and channels associated with running a replica, and returns the handles to them in a [Replica] struct.
    pub fn start(self) -> Replica {
        let log_events = self.configuration.log_events;
        let poll_interval = self.configuration.poll_interval;
        let gossip_interval = self.configuration.gossip_interval;
        let (creator_config, orderer_config): (CreatorConfiguration, OrdererConfiguration) =
            self.configuration.into();

        let event_handlers = EventHandlers::new(
            log_events,
            self.on_insert_unit,
            self.on_create_unit,
            self.on_receive_preunits,
            self.on_new_epoch,
            self.on_finish_epoch,
            self.on_order_round,
            self.on_deliver_preblock,
        );

        let (event_publisher, event_subscriber) =
            if !event_handlers.is_empty() {
                Some(mpsc::channel()).unzip()
            } else { (None, None) };

        let (event_bus_shutdown, event_bus) = match event_subscriber {
            Some(event_subscriber) => {
                let (shutdown, shutdown_receiver) = mpsc::channel();
                let event_bus = start_event_bus(event_handlers, event_subscriber, shutdown_receiver);
                (Some(shutdown), Some(event_bus))
            }
            None => (None, None),
        };

        let alerter = self
            .alerter
            .unwrap_or_else(|| Arc::new(LocalAlerter::new(creator_config.nproc)));
        let epoch_proof = self.epoch_proof.unwrap_or_else(|| {
            Arc::new(MultisigEpochProof::new(
                creator_config.me,
                creator_config.keypair.clone(),
                orderer_config.public_keys.clone(),
                creator_config.last_level,
            ))
        });

        let (belt, belt_receiver) = mpsc::channel();
        let (timing_rounds, timing_rounds_receiver) = mpsc::channel();
        let (last_timing, last_timing_receiver) = mpsc::channel();

        let fork_observer = {
            let belt = belt.clone();
            alerter.add_fork_observer(Arc::new(move |preunit: &Preunit, _: &Preunit| {
                // The creator only disconnects on shutdown.
                let _ = belt.send(CreatorInput::FreezeParent(preunit.creator()));
            }))
        };

        let orderer = Arc::new(Orderer::new(
            orderer_config,
            OrdererServices {
                alerter: alerter.clone(),
                syncer: self.syncer,
                random_source_factory: self.random_source_factory,
                extender_factory: self.extender_factory,
                epoch_proof: epoch_proof.clone(),
            },
            belt,
            timing_rounds,
            event_publisher,
        ));

        let (ordering_shutdown, ordering_shutdown_receiver) = mpsc::channel();
        let ordering = start_ordering(
            TimingRoundHandler::new(orderer.clone(), last_timing, Box::new(self.preblock_sink)),
            timing_rounds_receiver,
            ordering_shutdown_receiver,
            poll_interval,
        );

        let (creator_shutdown, creator_shutdown_receiver) = mpsc::channel();
        let creator = Creator::new(
            creator_config,
            Box::new(self.data_source),
            Box::new(orderer.clone()),
            Box::new(orderer.clone()),
            epoch_proof,
            last_timing_receiver,
        );
        let creator = creator.start(belt_receiver, creator_shutdown_receiver, poll_interval);

        let (gossip_shutdown, gossip_shutdown_receiver) = mpsc::channel();
        let gossip = start_gossip(orderer.clone(), gossip_shutdown_receiver, gossip_interval);

        Replica {
            orderer,
            alerter,
            fork_observer,
            creator: Some(creator),
            creator_shutdown,
            gossip: Some(gossip),
            gossip_shutdown,
            ordering: Some(ordering),
            ordering_shutdown,
            event_bus,
            event_bus_shutdown,
        }
    }
}

/// A handle to the background threads of an aleph-rs replica. When this value is dropped, all background threads are
/// gracefully shut down.
pub struct Replica {
    orderer: Arc<Orderer>,
    alerter: Arc<dyn Alerter>,
    fork_observer: ObserverID,
    creator: Option<JoinHandle<()>>,
    creator_shutdown: Sender<()>,
    gossip: Option<JoinHandle<()>>,
    gossip_shutdown: Sender<()>,
    ordering: Option<JoinHandle<()>>,
    ordering_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Replica {
    /// Returns the [Orderer], through which the replica receives units and answers its peers' requests.
    pub fn orderer(&self) -> &Arc<Orderer> {
        &self.orderer
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        // The order matters: the creator inserts into the orderer's epochs, and the epochs feed the
        // ordering thread and the event bus.
        self.alerter.remove_fork_observer(self.fork_observer);

        let _ = self.creator_shutdown.send(());
        if let Some(creator) = self.creator.take() {
            let _ = creator.join();
        }

        let _ = self.gossip_shutdown.send(());
        if let Some(gossip) = self.gossip.take() {
            let _ = gossip.join();
        }

        self.orderer.stop();

        let _ = self.ordering_shutdown.send(());
        if let Some(ordering) = self.ordering.take() {
            let _ = ordering.join();
        }

        self.event_bus_shutdown.iter().for_each(|shutdown| { let _ = shutdown.send(()); });
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }
    }
}
