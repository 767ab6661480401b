//! Property tests for the encryption vault
//!
//! Verifies seal/unseal round trips, tamper detection and key separation for
//! arbitrary payloads and capsule ids.

use proptest::prelude::*;
use strata::StrataError;
use strata::testing::{TEST_LAYER_ITERATIONS, test_vault};
use strata::vault::{Capsule, RootSecret, Vault};

fn capsule_id_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9-]{1,40}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_roundtrip_any_payload(
        plaintext in proptest::collection::vec(any::<u8>(), 0..2048),
        capsule_id in capsule_id_strategy(),
    ) {
        let vault = test_vault();
        let capsule = vault.seal(&plaintext, &capsule_id).unwrap();
        prop_assert_eq!(capsule.layers, 3);
        prop_assert_eq!(vault.unseal(&capsule).unwrap(), plaintext.clone());

        let wire = capsule.to_bytes().unwrap();
        prop_assert_eq!(vault.unseal_bytes(&wire).unwrap(), plaintext);
    }

    #[test]
    fn test_any_flipped_bit_is_rejected(
        plaintext in proptest::collection::vec(any::<u8>(), 1..256),
        capsule_id in capsule_id_strategy(),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let vault = test_vault();
        let mut capsule = vault.seal(&plaintext, &capsule_id).unwrap();
        let at = position.index(capsule.sealed.len());
        capsule.sealed[at] ^= 1 << bit;
        let is_decryption_error = matches!(
            vault.unseal(&capsule),
            Err(StrataError::Decryption { .. })
        );
        prop_assert!(is_decryption_error);
    }

    #[test]
    fn test_capsules_are_bound_to_their_id(
        plaintext in proptest::collection::vec(any::<u8>(), 1..128),
        id_a in capsule_id_strategy(),
        id_b in capsule_id_strategy(),
    ) {
        prop_assume!(id_a != id_b);
        let vault = test_vault();
        let capsule = vault.seal(&plaintext, &id_a).unwrap();
        let moved = Capsule {
            capsule_id: id_b,
            ..capsule
        };
        prop_assert!(vault.unseal(&moved).is_err());
    }
}

#[test]
fn test_sealing_is_randomized() {
    let vault = test_vault();
    let a = vault.seal(b"same plaintext", "same-id").unwrap();
    let b = vault.seal(b"same plaintext", "same-id").unwrap();
    assert_ne!(a.sealed, b.sealed);
}

#[test]
fn test_operator_secret_isolates_capsules() {
    let builtin = test_vault();
    let operator = Vault::new(
        RootSecret::with_operator_secret(b"operator supplied secret bytes").unwrap(),
        TEST_LAYER_ITERATIONS,
    )
    .unwrap();
    assert_ne!(builtin.fingerprint(), operator.fingerprint());

    let capsule = operator.seal(b"operator only", "capsule-1").unwrap();
    assert!(builtin.unseal(&capsule).is_err());
    assert_eq!(operator.unseal(&capsule).unwrap(), b"operator only");
}

#[test]
fn test_iteration_counts_change_keys() {
    let vault = test_vault();
    let other = Vault::new(RootSecret::builtin(), [11, 12, 14]).unwrap();
    let capsule = vault.seal(b"payload", "capsule-2").unwrap();
    assert!(other.unseal(&capsule).is_err());
}
