/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of the Aleph DAG-based consensus core.
//!
//! Every process of a fixed committee keeps growing a DAG of signed *units*. Each unit references
//! one parent per process and sits on a *level* derived from its parents. An external
//! [extender](ordering) picks timing units from the DAG; every timing round becomes a
//! [preblock](app::Preblock) delivered to the application, in the same order on every honest
//! process.
//!
//! The main components are:
//! - [`dag`]: the per-epoch, append-only DAG with its structural checks.
//! - [`adder`]: admission of units received from the network, staging them until their parents
//!   arrive.
//! - [`creator`]: production of this process's units.
//! - [`orderer`]: the live epochs, the transitions between them, and the queries peers need.
//! - [`replica`]: wiring all of the above into running threads.

pub mod adder;

pub mod alerter;

pub mod app;

pub mod creator;

pub mod dag;

pub mod epoch_proof;

pub(crate) mod event_bus;

pub mod events;

pub mod logging;

pub mod networking;

pub mod orderer;

pub mod ordering;

pub mod random_source;

pub mod replica;

pub mod types;
