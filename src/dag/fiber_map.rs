/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-creator unit slots, and sparse "fiber maps" of such slots indexed by height or level.
//!
//! Every slot has its own lock so that queries can run concurrently with the insertion of units into
//! unrelated slots. A slot holds more than one unit only if its creator forked.

use std::sync::{Arc, RwLock};

use crate::types::{data_types::ProcessID, unit::Unit};

/// One unit list per process.
pub struct SlottedUnits {
    slots: Vec<RwLock<Vec<Arc<Unit>>>>,
}

impl SlottedUnits {
    pub(crate) fn new(nproc: usize) -> SlottedUnits {
        SlottedUnits {
            slots: (0..nproc).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    /// The units in the slot of `process`.
    pub fn get(&self, process: ProcessID) -> Vec<Arc<Unit>> {
        match self.slots.get(process.index()) {
            Some(slot) => slot.read().unwrap().clone(),
            None => Vec::new(),
        }
    }

    pub(crate) fn set(&self, process: ProcessID, units: Vec<Arc<Unit>>) {
        *self.slots[process.index()].write().unwrap() = units;
    }

    pub(crate) fn push(&self, process: ProcessID, unit: Arc<Unit>) {
        self.slots[process.index()].write().unwrap().push(unit);
    }

    /// Copy of all slots, indexed by process.
    pub fn snapshot(&self) -> Vec<Vec<Arc<Unit>>> {
        self.slots
            .iter()
            .map(|slot| slot.read().unwrap().clone())
            .collect()
    }
}

/// A growable array of [`SlottedUnits`], one per height (or level) value.
pub(crate) struct FiberMap {
    width: usize,
    content: RwLock<Vec<Arc<SlottedUnits>>>,
}

impl FiberMap {
    pub(crate) fn new(width: usize, initial_len: usize) -> FiberMap {
        FiberMap {
            width,
            content: RwLock::new(
                (0..initial_len)
                    .map(|_| Arc::new(SlottedUnits::new(width)))
                    .collect(),
            ),
        }
    }

    /// The fiber of `value`, if the map reaches that far.
    pub(crate) fn fiber(&self, value: usize) -> Option<Arc<SlottedUnits>> {
        self.content.read().unwrap().get(value).cloned()
    }

    /// Append `unit` to the `creator` slot of fiber `value`, growing the map if needed.
    pub(crate) fn add(&self, value: usize, creator: ProcessID, unit: Arc<Unit>) {
        let fiber = match self.fiber(value) {
            Some(fiber) => fiber,
            None => {
                let mut content = self.content.write().unwrap();
                while content.len() <= value {
                    content.push(Arc::new(SlottedUnits::new(self.width)));
                }
                content[value].clone()
            }
        };
        fiber.push(creator, unit);
    }

    /// For every creator with a height in `heights`, the units sitting at exactly that height, along
    /// with the number of referenced slots that are still empty.
    pub(crate) fn get(&self, heights: &[Option<u32>]) -> (Vec<Vec<Arc<Unit>>>, usize) {
        let mut result = vec![Vec::new(); heights.len()];
        let mut unknown = 0;
        for (pid, height) in heights.iter().enumerate() {
            let height = match height {
                Some(height) => *height as usize,
                None => continue,
            };
            if let Some(fiber) = self.fiber(height) {
                result[pid] = fiber.get(ProcessID::new(pid as u16));
            }
            if result[pid].is_empty() {
                unknown += 1;
            }
        }
        (result, unknown)
    }

    /// All units strictly above `heights` (per creator). `None` means "above nothing", i.e. every
    /// unit in the map. Units come out fiber by fiber.
    pub(crate) fn above(&self, heights: Option<&[Option<u32>]>) -> Vec<Arc<Unit>> {
        let content = self.content.read().unwrap();
        let start = match heights {
            Some(heights) if heights.len() == self.width => heights
                .iter()
                .map(|height| height.map_or(0, |height| height as usize + 1))
                .min()
                .unwrap_or(0),
            _ => 0,
        };
        let mut result = Vec::new();
        for (value, fiber) in content.iter().enumerate().skip(start) {
            for pid in 0..self.width {
                let known = heights
                    .and_then(|heights| heights.get(pid).copied().flatten())
                    .map_or(false, |height| height as usize >= value);
                if !known {
                    result.extend(fiber.get(ProcessID::new(pid as u16)));
                }
            }
        }
        result
    }
}
