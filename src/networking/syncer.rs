/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::sync::Arc;

use crate::types::{
    data_types::{ProcessID, UnitID},
    unit::Unit,
};

/// Network requests issued by the consensus core.
///
/// All methods are fire-and-forget: they must not block, and their failure only delays progress
/// (missing units are requested again after [`fetch_interval`](crate::replica::Configuration)).
pub trait Syncer: Send + Sync {
    /// Ask `process` for the units at positions `ids`.
    fn request_fetch(&self, process: ProcessID, ids: Vec<UnitID>);

    /// Exchange [`DagInfo`](super::messages::DagInfo) with `process` and push each other the
    /// difference.
    fn request_gossip(&self, process: ProcessID);

    /// Send a freshly created unit to every other process.
    fn multicast(&self, unit: &Arc<Unit>);
}
