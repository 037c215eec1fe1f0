/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Proofs that an epoch has finished.
//!
//! Once the timing unit of an epoch reaches the last level, every process puts a *share* into its
//! next unit: a signature over the epoch and the hash of the last timing unit. Any process that sees
//! a quorum of matching shares in the DAG combines them into a *proof*, and starts the next epoch
//! with a dealing unit carrying that proof as its data. Processes that receive units of an epoch
//! they have not started yet use the proof to decide whether to trust them.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    crypto_primitives::{is_correctly_signed, Keypair, VerifyingKey},
    data_types::{minimal_quorum, CryptoHash, EpochID, ProcessID, SignatureBytes},
    unit::{Preunit, Unit},
};

pub trait EpochProofBuilder: Send + Sync {
    /// Whether `preunit` is a dealing unit carrying a valid proof that the previous epoch finished.
    fn verify(&self, preunit: &Preunit) -> bool;

    /// Collect the share in `unit`, if any. Returns the encoded proof once a quorum of shares for the
    /// unit's epoch has been collected.
    fn try_building(&self, unit: &Unit) -> Option<Vec<u8>>;

    /// This process's share for the epoch finished by `last_timing_unit`.
    fn build_share(&self, last_timing_unit: &Unit) -> Vec<u8>;
}

/// What a share or proof signs.
#[derive(BorshSerialize)]
struct EpochEnd {
    domain: [u8; 8],
    epoch: EpochID,
    last_timing_unit: CryptoHash,
}

impl EpochEnd {
    fn new(epoch: EpochID, last_timing_unit: CryptoHash) -> EpochEnd {
        EpochEnd {
            domain: *b"aleph/ep",
            epoch,
            last_timing_unit,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        // Serializing fixed-size fields into a Vec cannot fail.
        self.try_to_vec().unwrap_or_default()
    }
}

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
struct EpochShare {
    epoch: EpochID,
    last_timing_unit: CryptoHash,
    signature: SignatureBytes,
}

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
struct EpochProof {
    epoch: EpochID,
    last_timing_unit: CryptoHash,
    signatures: Vec<(ProcessID, SignatureBytes)>,
}

/// An [`EpochProofBuilder`] whose proofs are a quorum of plain Ed25519 signatures.
pub struct MultisigEpochProof {
    me: ProcessID,
    keypair: Keypair,
    public_keys: Vec<VerifyingKey>,
    last_level: u32,
    shares: Mutex<HashMap<(EpochID, CryptoHash), HashMap<ProcessID, SignatureBytes>>>,
}

impl MultisigEpochProof {
    pub fn new(
        me: ProcessID,
        keypair: Keypair,
        public_keys: Vec<VerifyingKey>,
        last_level: u32,
    ) -> MultisigEpochProof {
        MultisigEpochProof {
            me,
            keypair,
            public_keys,
            last_level,
            shares: Mutex::new(HashMap::new()),
        }
    }

    fn quorum(&self) -> usize {
        minimal_quorum(self.public_keys.len())
    }

    fn is_signed_by(&self, process: ProcessID, end: &EpochEnd, signature: &SignatureBytes) -> bool {
        match self.public_keys.get(process.index()) {
            Some(public_key) => is_correctly_signed(public_key, &end.to_bytes(), signature),
            None => false,
        }
    }
}

impl EpochProofBuilder for MultisigEpochProof {
    fn verify(&self, preunit: &Preunit) -> bool {
        if !preunit.is_dealing() || preunit.epoch().int() == 0 {
            return false;
        }
        let proof = match EpochProof::try_from_slice(preunit.data()) {
            Ok(proof) => proof,
            Err(_) => return false,
        };
        if proof.epoch.next() != preunit.epoch() {
            return false;
        }
        let end = EpochEnd::new(proof.epoch, proof.last_timing_unit);
        let mut signers = Vec::with_capacity(proof.signatures.len());
        for (signer, signature) in &proof.signatures {
            if signers.contains(signer) || !self.is_signed_by(*signer, &end, signature) {
                return false;
            }
            signers.push(*signer);
        }
        signers.len() >= self.quorum()
    }

    fn try_building(&self, unit: &Unit) -> Option<Vec<u8>> {
        if unit.level() < self.last_level {
            return None;
        }
        let share = EpochShare::try_from_slice(unit.data()).ok()?;
        if share.epoch != unit.epoch() {
            return None;
        }
        let end = EpochEnd::new(share.epoch, share.last_timing_unit);
        if !self.is_signed_by(unit.creator(), &end, &share.signature) {
            log::debug!("invalid epoch share in unit {:?}", unit.id());
            return None;
        }

        let mut shares = self.shares.lock().unwrap();
        let collected = shares
            .entry((share.epoch, share.last_timing_unit))
            .or_default();
        collected.insert(unit.creator(), share.signature);
        if collected.len() < self.quorum() {
            return None;
        }

        let mut signatures: Vec<(ProcessID, SignatureBytes)> =
            collected.iter().map(|(pid, signature)| (*pid, *signature)).collect();
        signatures.sort_by_key(|(pid, _)| *pid);
        let proof = EpochProof {
            epoch: share.epoch,
            last_timing_unit: share.last_timing_unit,
            signatures,
        };
        // Shares of older epochs are never needed again.
        shares.retain(|(epoch, _), _| *epoch >= share.epoch);
        proof.try_to_vec().ok()
    }

    fn build_share(&self, last_timing_unit: &Unit) -> Vec<u8> {
        let end = EpochEnd::new(last_timing_unit.epoch(), last_timing_unit.hash());
        let share = EpochShare {
            epoch: last_timing_unit.epoch(),
            last_timing_unit: last_timing_unit.hash(),
            signature: self.keypair.sign(&end.to_bytes()),
        };
        log::debug!("process {} built its share for epoch {}", self.me, share.epoch);
        share.try_to_vec().unwrap_or_default()
    }
}
