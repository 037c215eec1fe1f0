pub(crate) mod logging;

pub(crate) mod mocks;

pub(crate) mod network;

pub(crate) mod units;
