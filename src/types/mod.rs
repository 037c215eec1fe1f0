//! Types and traits that are used across multiple components of Aleph-rs.
//!
//! Other types and traits, specific to single components, can be found in the modules of those
//! components, e.g., [`crate::dag::checks`].

pub mod crypto_primitives;

pub mod data_types;

pub mod unit;
