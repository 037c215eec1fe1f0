/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The definitions and re-exports in this module provide two categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: provided by the [`sha2`] crate.
//! 2. **Digital Signatures**: provided by the [`ed25519_dalek`] crate.

use super::data_types::{CryptoHash, SignatureBytes};

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};

/// A facade around [`SigningKey`] that implements method for [`sign`](Self::sign)-ing messages as well
/// as a getter for the [`public`](Self::public) key associated with the signing key.
#[derive(Clone)]
pub struct Keypair(pub(crate) SigningKey);

impl Keypair {
    /// Create a `Keypair` that wraps over `signing_key`.
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Sign an arbitrary `message` with the `Keypair`.
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(message).to_bytes())
    }

    /// Get the `VerifyingKey` of this `Keypair`.
    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}

/// Check that `signature` was produced by `verifying_key` over `message`.
pub fn is_correctly_signed(
    verifying_key: &VerifyingKey,
    message: &[u8],
    signature: &SignatureBytes,
) -> bool {
    let signature = Signature::from_bytes(&signature.bytes());
    verifying_key.verify(message, &signature).is_ok()
}

/// Combine the hashes of a unit's parents into its control hash.
///
/// Slots without a parent contribute [`CryptoHash::zero`], so the result also commits to which
/// creators were skipped.
pub fn combine_hashes<'a>(hashes: impl IntoIterator<Item = Option<&'a CryptoHash>>) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    for hash in hashes {
        let bytes = hash.copied().unwrap_or(CryptoHash::zero()).bytes();
        hasher.update(bytes);
    }
    CryptoHash::new(hasher.finalize().into())
}

#[test]
fn combined_hash_depends_on_missing_slots() {
    let a = CryptoHash::new([1; 32]);
    let b = CryptoHash::new([2; 32]);
    let with_gap = combine_hashes([Some(&a), None, Some(&b)]);
    let without_gap = combine_hashes([Some(&a), Some(&b), None]);
    assert_ne!(with_gap, without_gap);
    assert_eq!(with_gap, combine_hashes([Some(&a), None, Some(&b)]));
}
