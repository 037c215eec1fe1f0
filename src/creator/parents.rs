/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Choosing the parents of a new unit.

use std::sync::Arc;

use crate::types::{data_types::ProcessID, unit::Unit};

/// Raise every parent slot to the highest unit of that creator seen by any other parent, until no
/// slot changes.
///
/// Afterwards, for all `i` and `j`, `parents[j].parents[i].level <= parents[i].level`, which is what
/// [`parent_consistency`](crate::dag::checks::parent_consistency) requires.
pub fn make_consistent(parents: &mut [Option<Arc<Unit>>]) {
    loop {
        let mut changed = false;
        for i in 0..parents.len() {
            let creator = ProcessID::new(i as u16);
            for j in 0..parents.len() {
                let seen = match parents[j].as_ref().and_then(|parent| parent.parent(creator)) {
                    Some(seen) => seen.clone(),
                    None => continue,
                };
                let outdated = parents[i]
                    .as_ref()
                    .map_or(true, |own| own.level() < seen.level());
                if outdated {
                    parents[i] = Some(seen);
                    changed = true;
                }
            }
        }
        if !changed {
            return;
        }
    }
}

/// Lower every candidate along its creator's chain until it sits on a level below `level`. Used in
/// setup mode, where a new unit climbs exactly one level.
pub fn parents_below_level(candidates: &[Option<Arc<Unit>>], level: u32) -> Vec<Option<Arc<Unit>>> {
    candidates
        .iter()
        .map(|candidate| {
            let mut candidate = candidate.clone();
            while let Some(unit) = candidate.as_ref() {
                if unit.level() < level {
                    break;
                }
                candidate = unit.predecessor().cloned();
            }
            candidate
        })
        .collect()
}
