/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via replica's
//! [config](crate::replica::Configuration).
//!
//! aleph-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how an [InsertUnit](crate::events::InsertUnitEvent) is printed:
//!
//! ```text
//! InsertUnit, 1701329264, 3, 2, 0, fNGCJyk, 1
//! ```
//!
//! In the snippet:
//! - The third, fourth and fifth values are the epoch, creator and height of the unit.
//! - The sixth value is the first seven characters of the Base64 encoding of the unit's hash.
//! - The seventh value is the level of the unit.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use std::time::SystemTime;

use crate::events::*;
use crate::types::data_types::UnitID;

pub const INSERT_UNIT: &str = "InsertUnit";
pub const CREATE_UNIT: &str = "CreateUnit";
pub const RECEIVE_PREUNITS: &str = "ReceivePreunits";
pub const NEW_EPOCH: &str = "NewEpoch";
pub const FINISH_EPOCH: &str = "FinishEpoch";
pub const ORDER_ROUND: &str = "OrderRound";
pub const DELIVER_PREBLOCK: &str = "DeliverPreblock";

pub(crate) trait Logger {
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for InsertUnitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |insert_unit_event: &InsertUnitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                INSERT_UNIT,
                secs_since_unix_epoch(insert_unit_event.timestamp),
                unit_id_info(insert_unit_event.unit),
                first_seven_base64_chars(&insert_unit_event.hash.bytes()),
                insert_unit_event.level
            )
        };
        Box::new(logger)
    }
}

impl Logger for CreateUnitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |create_unit_event: &CreateUnitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                CREATE_UNIT,
                secs_since_unix_epoch(create_unit_event.timestamp),
                unit_id_info(create_unit_event.unit),
                first_seven_base64_chars(&create_unit_event.hash.bytes()),
                create_unit_event.level
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceivePreunitsEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_preunits_event: &ReceivePreunitsEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_PREUNITS,
                secs_since_unix_epoch(receive_preunits_event.timestamp),
                receive_preunits_event.origin,
                receive_preunits_event.count,
                receive_preunits_event.accepted
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewEpochEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_epoch_event: &NewEpochEvent| {
            log::info!(
                "{}, {}, {}",
                NEW_EPOCH,
                secs_since_unix_epoch(new_epoch_event.timestamp),
                new_epoch_event.epoch
            )
        };
        Box::new(logger)
    }
}

impl Logger for FinishEpochEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |finish_epoch_event: &FinishEpochEvent| {
            log::info!(
                "{}, {}, {}, {}",
                FINISH_EPOCH,
                secs_since_unix_epoch(finish_epoch_event.timestamp),
                finish_epoch_event.epoch,
                first_seven_base64_chars(&finish_epoch_event.last_timing_unit.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for OrderRoundEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |order_round_event: &OrderRoundEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                ORDER_ROUND,
                secs_since_unix_epoch(order_round_event.timestamp),
                order_round_event.epoch,
                first_seven_base64_chars(&order_round_event.timing_unit.bytes()),
                order_round_event.level,
                order_round_event.units
            )
        };
        Box::new(logger)
    }
}

impl Logger for DeliverPreblockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |deliver_preblock_event: &DeliverPreblockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                DELIVER_PREBLOCK,
                secs_since_unix_epoch(deliver_preblock_event.timestamp),
                deliver_preblock_event.epoch,
                deliver_preblock_event.data_items
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

// Epoch, creator and height, in that order.
fn unit_id_info(unit: UnitID) -> String {
    format!("{}, {}, {}", unit.epoch(), unit.creator(), unit.height())
}
