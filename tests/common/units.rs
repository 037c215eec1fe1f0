use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use aleph_rs::types::{
    crypto_primitives::{Keypair, SigningKey, VerifyingKey},
    data_types::{EpochID, ProcessID},
    unit::{level_from_parents, Unit},
};

/// Deterministic signing keys for a committee of `nproc` processes.
pub(crate) fn signing_keys(nproc: usize) -> Vec<SigningKey> {
    (0..nproc)
        .map(|pid| SigningKey::from_bytes(&[pid as u8 + 1; 32]))
        .collect()
}

pub(crate) fn public_keys(signing_keys: &[SigningKey]) -> Vec<VerifyingKey> {
    signing_keys.iter().map(SigningKey::verifying_key).collect()
}

/// A unit of `pid` on top of `parents`, signed with `signing_keys[pid]`.
pub(crate) fn make_unit(
    signing_keys: &[SigningKey],
    pid: usize,
    epoch: u32,
    parents: Vec<Option<Arc<Unit>>>,
    data: Vec<u8>,
) -> Arc<Unit> {
    let level = level_from_parents(&parents);
    Arc::new(Unit::new(
        ProcessID::new(pid as u16),
        EpochID::new(epoch),
        parents,
        level,
        data,
        Vec::new(),
        &Keypair::new(signing_keys[pid].clone()),
    ))
}

/// The dealing units of every process in `epoch`.
pub(crate) fn dealings(signing_keys: &[SigningKey], epoch: u32) -> Vec<Arc<Unit>> {
    (0..signing_keys.len())
        .map(|pid| make_unit(signing_keys, pid, epoch, vec![None; signing_keys.len()], vec![pid as u8]))
        .collect()
}

/// Poll `condition` until it holds or `timeout` passes. Returns whether it held.
pub(crate) fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
