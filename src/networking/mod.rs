/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer (P2P) networking.
//!
//! Aleph-rs does not implement a transport. Instead, it asks the library user's [`Syncer`] to fetch,
//! gossip, and multicast units, and expects received units to be passed back in through
//! [`Orderer::add_preunits`](crate::orderer::Orderer::add_preunits). The wire format of the units
//! themselves is defined in [`messages`].

pub mod syncer;

pub mod messages;
