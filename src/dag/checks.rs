/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable structural checks that a unit must pass before it is inserted into a [`Dag`].
//!
//! Checks observe the unit and the DAG, but never mutate either. [`Dag::check`] runs them in the
//! order they were added and stops at the first failure.

use crate::types::{
    data_types::{minimal_quorum, ProcessID},
    unit::Unit,
};

use super::Dag;

/// A predicate over a unit about to be inserted.
pub trait UnitChecker: Send + Sync {
    fn check(&self, unit: &Unit, dag: &Dag) -> Result<(), CheckError>;
}

impl<F> UnitChecker for F
where
    F: Fn(&Unit, &Dag) -> Result<(), CheckError> + Send + Sync,
{
    fn check(&self, unit: &Unit, dag: &Dag) -> Result<(), CheckError> {
        self(unit, dag)
    }
}

/// The reasons a unit can fail to be accepted into the DAG after its parents were resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    /// The unit's crown does not have one slot per process.
    WrongNumberOfParents { expected: usize, got: usize },

    /// The parent in `slot` was created by some other process.
    ParentCreatorMismatch { slot: ProcessID, creator: ProcessID },

    /// A unit of height 0 references parents.
    DealingUnitWithParents,

    /// A unit above height 0 does not reference the previous unit of its creator.
    MissingSelfPredecessor,

    /// The self-predecessor is not exactly one height below the unit.
    WrongHeight { expected: u32, got: u32 },

    /// A non-dealing unit references fewer than a quorum of parents.
    NotEnoughParents { required: usize, got: usize },

    /// The unit does not advance past the level of its self-predecessor.
    LevelNotAbovePredecessor { level: u32, predecessor_level: u32 },

    /// The parent of `through` sees a unit of `slot` on a higher level than the unit's own parent in
    /// `slot`.
    ParentInconsistency { slot: ProcessID, through: ProcessID },

    /// The parent of `through` sees a unit of the creator that is not below the self-predecessor.
    SelfForkingEvidence { through: ProcessID },

    /// In setup mode, a unit must be exactly one level above its self-predecessor.
    LevelSkipped { level: u32, predecessor_level: u32 },

    /// The combined hash of the resolved parents differs from the crown's control hash.
    InvalidControlHash,

    /// Several units occupy a parent slot and none of them could be vouched for.
    UnresolvedFork { creator: ProcessID, height: u32 },

    /// A parent was produced by a known forker and no commitment to it was received.
    MissingCommitment { creator: ProcessID, height: u32 },
}

/// Structural sanity of the parent vector.
///
/// - Parent `i` must be created by process `i`.
/// - Dealing units (height 0) have no parents.
/// - Other units have their self-predecessor at `height - 1`, at least a quorum of parents, and a
///   level above the predecessor's.
pub fn basic_correctness(unit: &Unit, dag: &Dag) -> Result<(), CheckError> {
    let parents = unit.parents();
    if parents.len() != dag.nproc() {
        return Err(CheckError::WrongNumberOfParents {
            expected: dag.nproc(),
            got: parents.len(),
        });
    }

    let mut non_empty = 0;
    for (slot, parent) in parents.iter().enumerate() {
        if let Some(parent) = parent {
            non_empty += 1;
            if parent.creator().index() != slot {
                return Err(CheckError::ParentCreatorMismatch {
                    slot: ProcessID::new(slot as u16),
                    creator: parent.creator(),
                });
            }
        }
    }

    if unit.is_dealing() {
        if non_empty > 0 {
            return Err(CheckError::DealingUnitWithParents);
        }
        return Ok(());
    }

    let predecessor = unit.predecessor().ok_or(CheckError::MissingSelfPredecessor)?;
    if predecessor.height() + 1 != unit.height() {
        return Err(CheckError::WrongHeight {
            expected: predecessor.height() + 1,
            got: unit.height(),
        });
    }

    let required = minimal_quorum(dag.nproc());
    if non_empty < required {
        return Err(CheckError::NotEnoughParents {
            required,
            got: non_empty,
        });
    }

    if unit.level() <= predecessor.level() {
        return Err(CheckError::LevelNotAbovePredecessor {
            level: unit.level(),
            predecessor_level: predecessor.level(),
        });
    }

    Ok(())
}

/// No parent may see a unit of some creator on a higher level than the unit's own parent of that
/// creator: `parents[j].parents[i].level <= parents[i].level` for all `i`, `j`.
pub fn parent_consistency(unit: &Unit, _: &Dag) -> Result<(), CheckError> {
    let parents = unit.parents();
    for (i, own) in parents.iter().enumerate() {
        for (j, parent) in parents.iter().enumerate() {
            let seen = match parent.as_ref().and_then(|parent| parent.parents().get(i)).cloned().flatten() {
                Some(seen) => seen,
                None => continue,
            };
            let consistent = own
                .as_ref()
                .map_or(false, |own| seen.level() <= own.level());
            if !consistent {
                return Err(CheckError::ParentInconsistency {
                    slot: ProcessID::new(i as u16),
                    through: ProcessID::new(j as u16),
                });
            }
        }
    }
    Ok(())
}

/// A unit must not carry evidence that its own creator forked: whatever unit of the creator a parent
/// sees must lie below the self-predecessor.
pub fn no_self_forking_evidence(unit: &Unit, _: &Dag) -> Result<(), CheckError> {
    let predecessor = match unit.predecessor() {
        Some(predecessor) => predecessor,
        None => return Ok(()),
    };
    let creator = unit.creator();
    for (j, parent) in unit.parents().iter().enumerate() {
        if j == creator.index() {
            continue;
        }
        if let Some(seen) = parent.as_ref().and_then(|parent| parent.parent(creator)) {
            if !predecessor.above(seen) {
                return Err(CheckError::SelfForkingEvidence {
                    through: ProcessID::new(j as u16),
                });
            }
        }
    }
    Ok(())
}

/// Setup-mode rule: every unit climbs exactly one level above its self-predecessor.
pub fn no_level_skipping(unit: &Unit, _: &Dag) -> Result<(), CheckError> {
    if let Some(predecessor) = unit.predecessor() {
        if unit.level() != predecessor.level() + 1 {
            return Err(CheckError::LevelSkipped {
                level: unit.level(),
                predecessor_level: predecessor.level(),
            });
        }
    }
    Ok(())
}

/// The checks every epoch's DAG runs, in order. `can_skip_level == false` selects setup mode.
pub fn standard_checks(can_skip_level: bool) -> Vec<Box<dyn UnitChecker>> {
    let mut checks: Vec<Box<dyn UnitChecker>> = vec![
        Box::new(basic_correctness),
        Box::new(parent_consistency),
        Box::new(no_self_forking_evidence),
    ];
    if !can_skip_level {
        checks.push(Box::new(no_level_skipping));
    }
    checks
}
