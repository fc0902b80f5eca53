//! The opaque sealing envelope applied to every blob that leaves the
//! trusted environment.
//!
//! This build uses a deterministic keyed-digest envelope:
//! `magic || payload || SHA-256(key || payload)`. A deployment with real
//! sealing hardware replaces these two functions; callers only rely on
//! determinism and authentication.

use std::sync::LazyLock;

use anyhow::Context;
use common::sha256::Sha256;
use errors::ErrorMetadata;

use crate::wire::PASSPHRASE;

const SEAL_MAGIC: &[u8; 4] = b"SKV1";
const TAG_LEN: usize = 32;

static SEALING_KEY: LazyLock<[u8; 32]> = LazyLock::new(|| {
    let mut hasher = Sha256::new();
    hasher.update(b"sealing-key:");
    hasher.update(PASSPHRASE.as_bytes());
    *hasher.finalize()
});

fn tag(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(*SEALING_KEY);
    hasher.update(payload);
    *hasher.finalize()
}

pub fn seal(plaintext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEAL_MAGIC.len() + plaintext.len() + TAG_LEN);
    out.extend_from_slice(SEAL_MAGIC);
    out.extend_from_slice(plaintext);
    out.extend_from_slice(&tag(plaintext));
    out
}

pub fn unseal(sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
    let payload = sealed
        .strip_prefix(SEAL_MAGIC)
        .with_context(|| ErrorMetadata::integrity("BadSealMagic", "Sealed blob has no envelope"))?;
    if payload.len() < TAG_LEN {
        anyhow::bail!(ErrorMetadata::integrity(
            "TruncatedSeal",
            "Sealed blob shorter than its authentication tag"
        ));
    }
    let (plaintext, stored_tag) = payload.split_at(payload.len() - TAG_LEN);
    if tag(plaintext)[..] != *stored_tag {
        anyhow::bail!(ErrorMetadata::integrity(
            "SealTagMismatch",
            "Sealed blob failed authentication"
        ));
    }
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::{
        seal,
        unseal,
    };

    #[test]
    fn test_round_trip_and_determinism() {
        let sealed = seal(b"hello");
        assert_eq!(unseal(&sealed).unwrap(), b"hello");
        assert_eq!(sealed, seal(b"hello"));
    }

    #[test]
    fn test_bit_flip_detected() {
        let mut sealed = seal(b"payload bytes");
        sealed[7] ^= 1;
        assert!(unseal(&sealed).is_err());
    }

    #[test]
    fn test_truncation_detected() {
        let sealed = seal(b"payload");
        assert!(unseal(&sealed[..sealed.len() - 1]).is_err());
        assert!(unseal(&sealed[..10]).is_err());
    }
}
