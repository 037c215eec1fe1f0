/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The interface between Aleph-rs and the application it orders data for.
//!
//! The application supplies the payload of every regular unit through a [`DataSource`], and
//! receives the totally ordered output as a stream of [`Preblock`]s through a [`PreblockSink`].
//!
//! Both methods are called from Aleph-rs's own threads (the creator thread and the timing thread
//! respectively), and should return quickly.

use crate::{ordering::TimingRound, types::data_types::EpochID};

pub trait DataSource: Send {
    /// Application data to put into this process's next unit. May be empty.
    fn get(&mut self) -> Vec<u8>;
}

pub trait PreblockSink: Send {
    /// Called once per timing round, in order.
    fn deliver(&mut self, preblock: Preblock);
}

/// The ordered output of one timing round.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Preblock {
    /// The epoch the round belongs to.
    pub epoch: EpochID,

    /// The application data of every non-dealing unit of the round, in round order.
    pub data: Vec<Vec<u8>>,

    /// The random-source data of the round's timing unit.
    pub random_bytes: Vec<u8>,
}

impl Preblock {
    pub fn from_round(round: &TimingRound) -> Preblock {
        let data = round
            .units()
            .iter()
            .filter(|unit| !unit.is_dealing())
            .map(|unit| unit.data().to_vec())
            .collect();
        let timing_unit = round.timing_unit();
        Preblock {
            epoch: timing_unit.epoch(),
            data,
            random_bytes: timing_unit.random_source_data().to_vec(),
        }
    }
}

#[test]
fn preblocks_skip_dealing_units() {
    use std::sync::Arc;

    use crate::types::{
        crypto_primitives::{Keypair, SigningKey},
        data_types::ProcessID,
        unit::{level_from_parents, Unit},
    };

    let make = |pid: u16, parents: Vec<Option<Arc<Unit>>>, data: &[u8]| {
        let level = level_from_parents(&parents);
        Arc::new(Unit::new(
            ProcessID::new(pid),
            EpochID::new(3),
            parents,
            level,
            data.to_vec(),
            vec![pid as u8; 4],
            &Keypair::new(SigningKey::from_bytes(&[9; 32])),
        ))
    };
    let dealings: Vec<Arc<Unit>> = (0..4).map(|pid| make(pid, vec![None; 4], b"dealing")).collect();
    let timing = make(1, dealings.iter().cloned().map(Some).collect(), b"tx");

    let mut units = dealings.clone();
    units.push(timing);
    let preblock = Preblock::from_round(&TimingRound::new(units).unwrap());

    assert_eq!(preblock.epoch, EpochID::new(3));
    assert_eq!(preblock.data, vec![b"tx".to_vec()]);
    assert_eq!(preblock.random_bytes, vec![1u8; 4]);
}
