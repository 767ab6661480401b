//! Encryption vault
//!
//! Seals content under three nested AES-256-GCM layers. Each layer key is
//! derived independently with PBKDF2-HMAC-SHA256 from the root secret, a fixed
//! per-layer context and the capsule id, each layer with its own iteration
//! count. Unsealing peels the layers in reverse and aborts on the first
//! authentication failure.
//!
//! One `Vault` is built per process and shared by reference; it holds nothing
//! mutable, so capsules can be sealed and opened in parallel.

pub mod secret;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::config::VaultConfig;
use crate::error::{Result, StrataError};

pub use secret::RootSecret;

/// AES-256-GCM key size
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size for AES-GCM
pub const TAG_SIZE: usize = 16;

/// Number of encryption layers in every capsule
pub const LAYER_COUNT: u8 = 3;

const LAYER_CONTEXTS: [&str; LAYER_COUNT as usize] = [
    "strata.vault.layer1.inner",
    "strata.vault.layer2.middle",
    "strata.vault.layer3.outer",
];

const CAPSULE_MAGIC: &[u8; 4] = b"SCAP";
const CAPSULE_VERSION: u8 = 1;

/// Opaque sealed bytes plus layer count and capsule id. Never holds key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capsule {
    pub capsule_id: String,
    pub layers: u8,
    pub sealed: Vec<u8>,
}

impl Capsule {
    /// `magic | version | layers | id len (u16 LE) | id | sealed`
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let id = self.capsule_id.as_bytes();
        let id_len = capsule_id_len(&self.capsule_id)?;
        let mut out = Vec::with_capacity(4 + 1 + 1 + 2 + id.len() + self.sealed.len());
        out.extend_from_slice(CAPSULE_MAGIC);
        out.push(CAPSULE_VERSION);
        out.push(self.layers);
        out.extend_from_slice(&id_len.to_le_bytes());
        out.extend_from_slice(id);
        out.extend_from_slice(&self.sealed);
        Ok(out)
    }

    /// Parse the wire form. Malformed input is reported as a decryption failure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let malformed = || StrataError::Decryption {
            capsule_id: "<malformed>".to_string(),
        };

        if bytes.len() < 8 || &bytes[..4] != CAPSULE_MAGIC || bytes[4] != CAPSULE_VERSION {
            return Err(malformed());
        }
        let layers = bytes[5];
        let id_len = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
        let id_end = 8 + id_len;
        if bytes.len() < id_end {
            return Err(malformed());
        }
        let capsule_id = std::str::from_utf8(&bytes[8..id_end])
            .map_err(|_| malformed())?
            .to_string();

        Ok(Self {
            capsule_id,
            layers,
            sealed: bytes[id_end..].to_vec(),
        })
    }
}

fn capsule_id_len(capsule_id: &str) -> Result<u16> {
    u16::try_from(capsule_id.len()).map_err(|_| {
        StrataError::Validation(format!(
            "Capsule id is {} bytes; at most {} are allowed",
            capsule_id.len(),
            u16::MAX
        ))
    })
}

pub struct Vault {
    secret: RootSecret,
    layer_iterations: [u32; LAYER_COUNT as usize],
}

impl Vault {
    pub fn new(secret: RootSecret, layer_iterations: [u32; LAYER_COUNT as usize]) -> Result<Self> {
        if layer_iterations.iter().any(|&n| n == 0) {
            return Err(StrataError::Config(
                "Vault iteration counts must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            secret,
            layer_iterations,
        })
    }

    /// Build the process vault from configuration. Uses the operator secret
    /// from `operator_secret_env` when set, otherwise the built-in seed.
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        let secret = match &config.operator_secret_env {
            Some(var) => match std::env::var(var) {
                Ok(value) => RootSecret::from_operator_hex(&value)?,
                Err(_) => {
                    return Err(StrataError::Config(format!(
                        "Operator secret variable {var} is not set"
                    )));
                }
            },
            None => {
                tracing::warn!(
                    "Vault is using the built-in root secret; set vault.operator_secret_env for production"
                );
                RootSecret::builtin()
            }
        };
        Self::new(secret, config.layer_iterations)
    }

    pub fn fingerprint(&self) -> String {
        self.secret.fingerprint()
    }

    pub fn layer_count(&self) -> u8 {
        LAYER_COUNT
    }

    fn derive_key(&self, layer: usize, capsule_id: &str) -> Zeroizing<[u8; KEY_SIZE]> {
        let context = LAYER_CONTEXTS[layer];
        let mut salt = Vec::with_capacity(context.len() + 1 + capsule_id.len());
        salt.extend_from_slice(context.as_bytes());
        salt.push(0);
        salt.extend_from_slice(capsule_id.as_bytes());

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        pbkdf2_hmac::<Sha256>(
            self.secret.expose(),
            &salt,
            self.layer_iterations[layer],
            &mut key[..],
        );
        key
    }

    fn layer_aad(layer: usize, capsule_id: &str) -> Vec<u8> {
        let mut aad = Vec::with_capacity(capsule_id.len() + 1);
        aad.extend_from_slice(capsule_id.as_bytes());
        aad.push(layer as u8);
        aad
    }

    /// Encrypt `plaintext` under K1, then K2, then K3.
    pub fn seal(&self, plaintext: &[u8], capsule_id: &str) -> Result<Capsule> {
        if capsule_id.is_empty() {
            return Err(StrataError::Validation(
                "Capsule id must not be empty".to_string(),
            ));
        }
        capsule_id_len(capsule_id)?;

        let mut data = Zeroizing::new(plaintext.to_vec());
        for layer in 0..LAYER_COUNT as usize {
            let key = self.derive_key(layer, capsule_id);
            let cipher = Aes256Gcm::new_from_slice(&key[..])
                .map_err(|e| StrataError::Storage(format!("Failed to create cipher: {e}")))?;

            let mut nonce_bytes = [0u8; NONCE_SIZE];
            rand::thread_rng().fill_bytes(&mut nonce_bytes);
            let nonce = Nonce::from_slice(&nonce_bytes);

            let aad = Self::layer_aad(layer, capsule_id);
            let ciphertext = cipher
                .encrypt(
                    nonce,
                    Payload {
                        msg: data.as_slice(),
                        aad: &aad,
                    },
                )
                .map_err(|e| StrataError::Storage(format!("Encryption failed: {e}")))?;

            let mut next = Zeroizing::new(Vec::with_capacity(NONCE_SIZE + ciphertext.len()));
            next.extend_from_slice(&nonce_bytes);
            next.extend_from_slice(&ciphertext);
            data = next;
        }

        Ok(Capsule {
            capsule_id: capsule_id.to_string(),
            layers: LAYER_COUNT,
            sealed: data.to_vec(),
        })
    }

    /// Decrypt K3 first, then K2, then K1. Any failure yields `Decryption`
    /// and no partially decrypted bytes.
    pub fn unseal(&self, capsule: &Capsule) -> Result<Vec<u8>> {
        let fail = || StrataError::Decryption {
            capsule_id: capsule.capsule_id.clone(),
        };

        if capsule.layers != LAYER_COUNT {
            return Err(fail());
        }

        let mut data = Zeroizing::new(capsule.sealed.clone());
        for layer in (0..LAYER_COUNT as usize).rev() {
            if data.len() < NONCE_SIZE + TAG_SIZE {
                return Err(fail());
            }
            let key = self.derive_key(layer, &capsule.capsule_id);
            let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| fail())?;

            let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
            let aad = Self::layer_aad(layer, &capsule.capsule_id);
            let opened = cipher
                .decrypt(
                    nonce,
                    Payload {
                        msg: &data[NONCE_SIZE..],
                        aad: &aad,
                    },
                )
                .map_err(|_| fail())?;
            data = Zeroizing::new(opened);
        }

        Ok(data.to_vec())
    }

    /// Parse and unseal a capsule in wire form
    pub fn unseal_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let capsule = Capsule::from_bytes(bytes)?;
        self.unseal(&capsule)
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("fingerprint", &self.secret.fingerprint())
            .field("layer_iterations", &self.layer_iterations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> Vault {
        Vault::new(RootSecret::builtin(), [4, 8, 16]).unwrap()
    }

    #[test]
    fn test_seal_unseal_roundtrip() {
        let vault = test_vault();
        let capsule = vault.seal(b"secret-value-42", "capsule-1").unwrap();
        assert_eq!(capsule.layers, 3);
        assert_eq!(capsule.capsule_id, "capsule-1");
        assert_eq!(vault.unseal(&capsule).unwrap(), b"secret-value-42");
    }

    #[test]
    fn test_sealed_size_has_three_envelopes() {
        let vault = test_vault();
        let capsule = vault.seal(b"abc", "c").unwrap();
        assert_eq!(capsule.sealed.len(), 3 + 3 * (NONCE_SIZE + TAG_SIZE));
    }

    #[test]
    fn test_sealed_bytes_do_not_contain_plaintext() {
        let vault = test_vault();
        let capsule = vault.seal(b"plainly-visible-text", "c").unwrap();
        let needle = b"plainly-visible-text";
        assert!(!capsule.sealed.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_wrong_capsule_id_fails() {
        let vault = test_vault();
        let mut capsule = vault.seal(b"data", "capsule-a").unwrap();
        capsule.capsule_id = "capsule-b".to_string();
        assert!(matches!(
            vault.unseal(&capsule),
            Err(StrataError::Decryption { .. })
        ));
    }

    #[test]
    fn test_wrong_root_secret_fails() {
        let vault = test_vault();
        let other = Vault::new(
            RootSecret::with_operator_secret(b"a different operator secret").unwrap(),
            [4, 8, 16],
        )
        .unwrap();
        let capsule = vault.seal(b"data", "capsule").unwrap();
        assert!(other.unseal(&capsule).is_err());
    }

    #[test]
    fn test_layer_keys_are_independent() {
        let vault = test_vault();
        let k1 = vault.derive_key(0, "id");
        let k2 = vault.derive_key(1, "id");
        let k3 = vault.derive_key(2, "id");
        assert_ne!(*k1, *k2);
        assert_ne!(*k2, *k3);
        assert_ne!(*k1, *k3);
        assert_eq!(*k1, *vault.derive_key(0, "id"));
        assert_ne!(*k1, *vault.derive_key(0, "other-id"));
    }

    #[test]
    fn test_every_flipped_byte_is_detected() {
        let vault = test_vault();
        let capsule = vault.seal(b"tamper me", "capsule").unwrap();
        for i in 0..capsule.sealed.len() {
            let mut tampered = capsule.clone();
            tampered.sealed[i] ^= 0x01;
            assert!(
                matches!(vault.unseal(&tampered), Err(StrataError::Decryption { .. })),
                "flip at byte {i} was not detected"
            );
        }
    }

    #[test]
    fn test_wrong_layer_count_fails() {
        let vault = test_vault();
        let mut capsule = vault.seal(b"data", "capsule").unwrap();
        capsule.layers = 2;
        assert!(vault.unseal(&capsule).is_err());
    }

    #[test]
    fn test_truncated_capsule_fails() {
        let vault = test_vault();
        let mut capsule = vault.seal(b"data", "capsule").unwrap();
        capsule.sealed.truncate(10);
        assert!(vault.unseal(&capsule).is_err());
    }

    #[test]
    fn test_wire_roundtrip_and_tamper() {
        let vault = test_vault();
        let capsule = vault.seal(b"wire", "capsule-wire").unwrap();
        let bytes = capsule.to_bytes().unwrap();
        assert_eq!(Capsule::from_bytes(&bytes).unwrap(), capsule);
        assert_eq!(vault.unseal_bytes(&bytes).unwrap(), b"wire");

        for i in 0..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[i] ^= 0x80;
            assert!(vault.unseal_bytes(&tampered).is_err(), "flip at {i}");
        }
    }

    #[test]
    fn test_empty_capsule_id_rejected() {
        let vault = test_vault();
        assert!(matches!(
            vault.seal(b"x", ""),
            Err(StrataError::Validation(_))
        ));
    }

    #[test]
    fn test_oversized_capsule_id_rejected() {
        let vault = test_vault();
        let long_id = "c".repeat(usize::from(u16::MAX) + 1);
        assert!(matches!(
            vault.seal(b"x", &long_id),
            Err(StrataError::Validation(_))
        ));

        let capsule = Capsule {
            capsule_id: long_id,
            layers: LAYER_COUNT,
            sealed: Vec::new(),
        };
        assert!(matches!(capsule.to_bytes(), Err(StrataError::Validation(_))));

        let widest = "c".repeat(usize::from(u16::MAX));
        assert!(vault.seal(b"x", &widest).is_ok());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        assert!(Vault::new(RootSecret::builtin(), [1, 0, 1]).is_err());
    }
}
