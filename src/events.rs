/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of aleph-rs events for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::data_types::{CryptoHash, EpochID, ProcessID, UnitID};

pub enum Event {
    // Events that change the DAG.
    InsertUnit(InsertUnitEvent),
    CreateUnit(CreateUnitEvent),
    // Events that involve receiving units from the network.
    ReceivePreunits(ReceivePreunitsEvent),
    // Epoch events.
    NewEpoch(NewEpochEvent),
    FinishEpoch(FinishEpochEvent),
    // Ordering events.
    OrderRound(OrderRoundEvent),
    DeliverPreblock(DeliverPreblockEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus only stops after every publisher.
            let _ = event_publisher.send(event);
        }
    }
}

/// A unit was inserted into the DAG of its epoch.
pub struct InsertUnitEvent {
    pub timestamp: SystemTime,
    pub unit: UnitID,
    pub hash: CryptoHash,
    pub level: u32,
}

/// This process created a unit, inserted it into its own DAG, and multicast it.
pub struct CreateUnitEvent {
    pub timestamp: SystemTime,
    pub unit: UnitID,
    pub hash: CryptoHash,
    pub level: u32,
}

pub struct ReceivePreunitsEvent {
    pub timestamp: SystemTime,
    pub origin: ProcessID,
    pub count: usize,

    /// How many of the preunits were staged or inserted without error.
    pub accepted: usize,
}

pub struct NewEpochEvent {
    pub timestamp: SystemTime,
    pub epoch: EpochID,
}

pub struct FinishEpochEvent {
    pub timestamp: SystemTime,
    pub epoch: EpochID,
    pub last_timing_unit: CryptoHash,
}

pub struct OrderRoundEvent {
    pub timestamp: SystemTime,
    pub epoch: EpochID,
    pub timing_unit: CryptoHash,
    pub level: u32,
    pub units: usize,
}

pub struct DeliverPreblockEvent {
    pub timestamp: SystemTime,
    pub epoch: EpochID,
    pub data_items: usize,
}
