use rand_core::OsRng;
use signal_session::keys::KeyPair;
use signal_session::x3dh::{initiate, respond, PreKeyBundle, ResponderKeys};
use signal_session::{DoubleRatchet, Error, IdentityKeyPair, SecretKey};

fn signed_bundle(identity: &IdentityKeyPair, signed: &KeyPair) -> PreKeyBundle {
    PreKeyBundle {
        registration_id: 1,
        device_id: 1,
        pre_key: None,
        signed_pre_key_id: 1,
        signed_pre_key: *signed.public_key(),
        signed_pre_key_signature: identity.sign(&mut OsRng, &signed.public_key().serialize()),
        identity_key: *identity.public_key(),
    }
}

fn bincode_round_trip(ratchet: &DoubleRatchet) -> (Vec<u8>, DoubleRatchet) {
    let bytes = bincode::serde::encode_to_vec(ratchet, bincode::config::standard()).unwrap();
    let (restored, _) =
        bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
    (bytes, restored)
}

#[test]
fn test_x3dh_formal_symmetry_multiple_runs() {
    for run in 0..100 {
        let alice_identity = IdentityKeyPair::generate(&mut OsRng);
        let bob_identity = IdentityKeyPair::generate(&mut OsRng);
        let bob_signed = KeyPair::generate(&mut OsRng);
        let bob_one_time = KeyPair::generate(&mut OsRng);

        let mut bundle = signed_bundle(&bob_identity, &bob_signed);
        let with_one_time = run % 2 == 0;
        if with_one_time {
            bundle.pre_key = Some((run, *bob_one_time.public_key()));
        }

        let init = initiate(&mut OsRng, &alice_identity, &bundle).unwrap();
        let keys = ResponderKeys {
            identity: &bob_identity,
            signed_pre_key: &bob_signed,
            one_time_pre_key: with_one_time.then_some(&bob_one_time),
        };
        let response = respond(&keys, alice_identity.public_key(), &init.base_key).unwrap();

        assert_eq!(init.root_key, response.root_key, "X3DH symmetry violated");
        assert_eq!(init.associated_data, response.associated_data);
    }
}

#[test]
fn test_one_time_key_mismatch_breaks_agreement() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob_signed = KeyPair::generate(&mut OsRng);
    let published = KeyPair::generate(&mut OsRng);
    let other = KeyPair::generate(&mut OsRng);

    let mut bundle = signed_bundle(&bob_identity, &bob_signed);
    bundle.pre_key = Some((1, *published.public_key()));
    let init = initiate(&mut OsRng, &alice_identity, &bundle).unwrap();

    let keys = ResponderKeys {
        identity: &bob_identity,
        signed_pre_key: &bob_signed,
        one_time_pre_key: Some(&other),
    };
    let response = respond(&keys, alice_identity.public_key(), &init.base_key).unwrap();
    assert_ne!(init.root_key, response.root_key);
}

#[test]
fn test_dh_input_sensitivity() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob_identity = IdentityKeyPair::generate(&mut OsRng);

    let first = signed_bundle(&bob_identity, &KeyPair::generate(&mut OsRng));
    let second = signed_bundle(&bob_identity, &KeyPair::generate(&mut OsRng));

    let init_1 = initiate(&mut OsRng, &alice_identity, &first).unwrap();
    let init_2 = initiate(&mut OsRng, &alice_identity, &second).unwrap();

    assert_ne!(
        init_1.root_key, init_2.root_key,
        "Changing DH inputs must change the root key"
    );
    assert_ne!(init_1.base_key, init_2.base_key, "Base keys are ephemeral");
}

#[test]
fn test_root_chain_key_separation() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob_signed = KeyPair::generate(&mut OsRng);

    let bundle = signed_bundle(&bob_identity, &bob_signed);
    let init = initiate(&mut OsRng, &alice_identity, &bundle).unwrap();
    let root = *init.root_key.as_bytes();

    let mut alice =
        DoubleRatchet::new_sender(&mut OsRng, init.root_key, *bob_signed.public_key()).unwrap();
    let encrypted = alice.encrypt(b"test key material", &init.associated_data).unwrap();

    assert_ne!(
        &root[..],
        &encrypted.ciphertext[..32],
        "Root key must never equal message key material"
    );
}

#[test]
fn test_identity_substitution_attempts() {
    let bob_identity = IdentityKeyPair::generate(&mut OsRng);
    let attempter_identity = IdentityKeyPair::generate(&mut OsRng);
    let original_bundle = signed_bundle(&bob_identity, &KeyPair::generate(&mut OsRng));
    let attempter_spk = SecretKey::generate(&mut OsRng).public_key();

    assert!(original_bundle.verify_signature().is_ok());

    let mut identity_swapped = original_bundle.clone();
    identity_swapped.identity_key = *attempter_identity.public_key();
    assert!(identity_swapped.verify_signature().is_err());

    let mut spk_swapped = original_bundle.clone();
    spk_swapped.signed_pre_key = attempter_spk;
    assert!(spk_swapped.verify_signature().is_err());

    let mut both_swapped = original_bundle.clone();
    both_swapped.identity_key = *attempter_identity.public_key();
    both_swapped.signed_pre_key = attempter_spk;
    assert!(both_swapped.verify_signature().is_err());

    let mut tampered = original_bundle;
    tampered.signed_pre_key_signature[0] ^= 0xFF;
    assert!(tampered.verify_signature().is_err());
}

#[test]
fn test_mitm_full_attempt_scenario() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob_identity = IdentityKeyPair::generate(&mut OsRng);
    let attempter_identity = IdentityKeyPair::generate(&mut OsRng);

    let mut bundle = signed_bundle(&bob_identity, &KeyPair::generate(&mut OsRng));
    bundle.identity_key = *attempter_identity.public_key();

    assert_eq!(
        initiate(&mut OsRng, &alice_identity, &bundle).unwrap_err(),
        Error::InvalidSignature
    );
}

#[test]
fn test_xeddsa_signature_uniqueness() {
    let bob_identity = IdentityKeyPair::generate(&mut OsRng);
    let signed = KeyPair::generate(&mut OsRng);

    let bundle1 = signed_bundle(&bob_identity, &signed);
    let bundle2 = signed_bundle(&bob_identity, &signed);

    assert_ne!(
        bundle1.signed_pre_key_signature, bundle2.signed_pre_key_signature,
        "XEdDSA signatures should be randomized"
    );
    assert!(bundle1.verify_signature().is_ok());
    assert!(bundle2.verify_signature().is_ok());
}

#[test]
fn test_xeddsa_cross_bundle_signature_reuse_fails() {
    let bob_bundle = signed_bundle(
        &IdentityKeyPair::generate(&mut OsRng),
        &KeyPair::generate(&mut OsRng),
    );
    let mut eve_bundle = signed_bundle(
        &IdentityKeyPair::generate(&mut OsRng),
        &KeyPair::generate(&mut OsRng),
    );

    eve_bundle.signed_pre_key_signature = bob_bundle.signed_pre_key_signature;
    assert!(eve_bundle.verify_signature().is_err());
}

#[test]
fn test_ratchet_state_persistence() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob_signed = KeyPair::generate(&mut OsRng);

    let bundle = signed_bundle(&bob_identity, &bob_signed);
    let init = initiate(&mut OsRng, &alice_identity, &bundle).unwrap();
    let keys = ResponderKeys {
        identity: &bob_identity,
        signed_pre_key: &bob_signed,
        one_time_pre_key: None,
    };
    let response = respond(&keys, alice_identity.public_key(), &init.base_key).unwrap();
    let ad = init.associated_data.clone();

    let mut alice =
        DoubleRatchet::new_sender(&mut OsRng, init.root_key, *bob_signed.public_key()).unwrap();
    let mut bob = DoubleRatchet::new_receiver(response.root_key, bob_signed.secret_key().clone());

    let skipped = alice.encrypt(b"skipped", &ad).unwrap();
    let msg1 = alice.encrypt(b"hello", &ad).unwrap();
    bob.decrypt(&mut OsRng, &msg1, &ad).unwrap();

    let (_, mut restored) = bincode_round_trip(&bob);
    assert_eq!(restored.skipped_key_count(), 1);

    let msg2 = alice.encrypt(b"after restore", &ad).unwrap();
    assert_eq!(restored.decrypt(&mut OsRng, &msg2, &ad).unwrap(), b"after restore");
    assert_eq!(restored.decrypt(&mut OsRng, &skipped, &ad).unwrap(), b"skipped");
    assert_eq!(
        restored.decrypt(&mut OsRng, &msg1, &ad).unwrap_err(),
        Error::DuplicateMessage
    );
}

#[test]
fn test_ratchet_serialization_determinism() {
    let bob_dh = SecretKey::generate(&mut OsRng);
    let bob = DoubleRatchet::new_receiver(
        signal_session::crypto::SymmetricKey::from_bytes([7u8; 32]),
        bob_dh,
    );

    let (first, restored) = bincode_round_trip(&bob);
    let (second, _) = bincode_round_trip(&restored);
    assert_eq!(first, second, "Serialization must be deterministic");
}
