/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! One epoch: a DAG, the adder feeding it, and the extender ordering it.

use std::{
    sync::{mpsc::Sender, Arc, Mutex},
    time::SystemTime,
};

use crate::{
    adder::{Adder, AdderConfiguration},
    creator::CreatorInput,
    dag::{checks::standard_checks, Dag, InsertHook},
    events::{Event, InsertUnitEvent},
    ordering::{Extender, TimingRound},
    random_source::RandomSource,
    types::{data_types::EpochID, unit::Unit},
};

use super::Orderer;

/// The extender of an epoch, and whether the epoch's last timing round was already handed out.
struct ExtenderState {
    extender: Box<dyn Extender>,
    finished: bool,
}

pub struct Epoch {
    id: EpochID,
    dag: Arc<Dag>,
    adder: Adder,
    random_source: Arc<dyn RandomSource>,
    extender: Arc<Mutex<ExtenderState>>,
}

impl Epoch {
    /// Set up epoch `id` with the services of `orderer`.
    ///
    /// Every unit inserted into the new DAG is, in this order, fed to the extender, put on the unit
    /// belt (unless this process created it), and published as an [`InsertUnitEvent`].
    pub(super) fn new(id: EpochID, orderer: &Orderer) -> Epoch {
        let config = &orderer.config;
        let dag = Arc::new(Dag::new(config.public_keys.len(), id));
        for check in standard_checks(config.can_skip_level) {
            dag.add_check(check);
        }

        let random_source = orderer.random_source_factory.new_random_source(&dag);
        let extender = Arc::new(Mutex::new(ExtenderState {
            extender: orderer.extender_factory.new_extender(&dag, &random_source),
            finished: false,
        }));

        dag.after_insert(extender_hook(
            extender.clone(),
            orderer.timing_rounds.clone(),
            config.last_level,
        ));
        let me = config.me;
        let belt = orderer.belt.clone();
        dag.after_insert(Box::new(move |unit: &Arc<Unit>| {
            if unit.creator() != me {
                // The creator only disconnects on shutdown.
                let _ = belt.send(CreatorInput::Unit(unit.clone()));
            }
        }));
        if orderer.event_publisher.is_some() {
            let event_publisher = orderer.event_publisher.clone();
            dag.after_insert(Box::new(move |unit: &Arc<Unit>| {
                Event::publish(
                    &event_publisher,
                    Event::InsertUnit(InsertUnitEvent {
                        timestamp: SystemTime::now(),
                        unit: unit.id(),
                        hash: unit.hash(),
                        level: unit.level(),
                    }),
                )
            }));
        }

        let adder = Adder::new(
            AdderConfiguration {
                me,
                public_keys: config.public_keys.clone(),
                fetch_interval: config.fetch_interval,
                poll_interval: config.poll_interval,
            },
            dag.clone(),
            orderer.alerter.clone(),
            orderer.syncer.clone(),
        );

        Epoch {
            id,
            dag,
            adder,
            random_source,
            extender,
        }
    }

    pub fn id(&self) -> EpochID {
        self.id
    }

    pub fn dag(&self) -> &Arc<Dag> {
        &self.dag
    }

    pub fn adder(&self) -> &Adder {
        &self.adder
    }

    pub fn random_source(&self) -> &Arc<dyn RandomSource> {
        &self.random_source
    }

    /// Stop handing out timing rounds of this epoch.
    pub fn finish(&self) {
        self.extender.lock().unwrap().finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.extender.lock().unwrap().finished
    }

    /// Stop the adder and detach every hook from the DAG. The DAG stays readable.
    pub fn close(&self) {
        self.adder.close();
        self.dag.clear_hooks();
    }
}

impl Drop for Epoch {
    fn drop(&mut self) {
        // The hooks hold the extender, which may hold the DAG.
        self.close()
    }
}

/// Feed every inserted unit to the extender and pass the decided rounds on, up to and including the
/// first round whose timing unit reaches `last_level`.
fn extender_hook(
    extender: Arc<Mutex<ExtenderState>>,
    timing_rounds: Sender<TimingRound>,
    last_level: u32,
) -> InsertHook {
    Box::new(move |unit: &Arc<Unit>| {
        let mut state = extender.lock().unwrap();
        if state.finished {
            return;
        }
        for round in state.extender.add_unit(unit) {
            let last = round.timing_unit().level() >= last_level;
            // The ordering thread only disconnects on shutdown.
            let _ = timing_rounds.send(round);
            if last {
                state.finished = true;
                return;
            }
        }
    })
}
