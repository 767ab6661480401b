//! Root secret derivation
//!
//! The default root secret is reproducible from fixed mathematical constants
//! and an ordered phrase list. Anyone holding this source can recompute it, so
//! it only obfuscates. Production deployments mix in an operator secret.

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, StrataError};

pub const ROOT_SECRET_LEN: usize = 32;

/// High-precision constants hashed into the default seed, in order
const SEED_CONSTANTS: [(&str, &str); 6] = [
    ("pi", "3.14159265358979323846264338327950288419716939937510"),
    ("e", "2.71828182845904523536028747135266249775724709369995"),
    ("phi", "1.61803398874989484820458683436563811772030917980576"),
    ("sqrt2", "1.41421356237309504880168872420969807856967187537694"),
    ("ln2", "0.69314718055994530941723212145817656807550013436025"),
    ("gamma", "0.57721566490153286060651209008240243104215933593992"),
];

/// Ordered phrases hashed after the constants
const SEED_PHRASES: [&str; 6] = [
    "what is remembered shapes what is next",
    "every frame is written once",
    "significance fades unless it is recalled",
    "the private stays sealed",
    "indexes are caches, archives are truth",
    "three layers, opened in reverse",
];

const SEED_DOMAIN: &[u8] = b"strata/root-secret/v1";
const OPERATOR_DOMAIN: &[u8] = b"strata/root-secret/operator/v1";
const FINGERPRINT_DOMAIN: &[u8] = b"strata/root-secret/fingerprint";

/// 32-byte root secret, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootSecret([u8; ROOT_SECRET_LEN]);

impl RootSecret {
    /// Secret derived from the built-in constants and phrases only
    pub fn builtin() -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SEED_DOMAIN);
        for (name, digits) in SEED_CONSTANTS {
            hasher.update((name.len() as u32).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update((digits.len() as u32).to_le_bytes());
            hasher.update(digits.as_bytes());
        }
        for phrase in SEED_PHRASES {
            hasher.update((phrase.len() as u32).to_le_bytes());
            hasher.update(phrase.as_bytes());
        }
        Self(hasher.finalize().into())
    }

    /// Built-in seed combined with an operator-supplied secret
    pub fn with_operator_secret(operator_secret: &[u8]) -> Result<Self> {
        if operator_secret.len() < 16 {
            return Err(StrataError::Config(
                "Operator secret must be at least 16 bytes".to_string(),
            ));
        }
        let builtin = Self::builtin();
        let mut hasher = Sha256::new();
        hasher.update(OPERATOR_DOMAIN);
        hasher.update(builtin.0);
        hasher.update((operator_secret.len() as u32).to_le_bytes());
        hasher.update(operator_secret);
        Ok(Self(hasher.finalize().into()))
    }

    /// Decode a hex operator secret (as stored in an environment variable)
    pub fn from_operator_hex(hex_secret: &str) -> Result<Self> {
        let mut bytes = hex::decode(hex_secret.trim())
            .map_err(|e| StrataError::Config(format!("Operator secret is not valid hex: {e}")))?;
        let secret = Self::with_operator_secret(&bytes);
        bytes.zeroize();
        secret
    }

    pub(crate) fn expose(&self) -> &[u8; ROOT_SECRET_LEN] {
        &self.0
    }

    /// Short public identifier of the secret; does not reveal the seed
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(self.0);
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }
}

impl std::fmt::Debug for RootSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RootSecret")
            .field(&self.fingerprint())
            .finish()
    }
}
