//! Round-trip laws for the crypto surface: signatures, the Ed25519 →
//! X25519 bridge, sealed boxes and secret-box envelopes.

use ember::crypto::{pubkey_tag, verify_hex};
use ember::e2e::{
    curve_public_hex, curve_secret, decrypt_envelope, encrypt_envelope, generate_room_key,
    seal_room_key, sign_curve_pk, unseal_room_key, verify_curve_pk_sig,
};
use ember::Identity;

#[test]
fn signature_roundtrip() {
    let identity = Identity::generate("ada");
    let sig = identity.sign_hex(b"the payload");
    assert!(verify_hex(&identity.pubkey_hex(), &sig, b"the payload"));
}

#[test]
fn signature_rejects_wrong_message() {
    let identity = Identity::generate("ada");
    let sig = identity.sign_hex(b"original");
    assert!(!verify_hex(&identity.pubkey_hex(), &sig, b"tampered"));
}

#[test]
fn signature_rejects_wrong_key() {
    let ada = Identity::generate("ada");
    let eve = Identity::generate("eve");
    let sig = ada.sign_hex(b"payload");
    assert!(!verify_hex(&eve.pubkey_hex(), &sig, b"payload"));
}

#[test]
fn identities_are_unique() {
    let a = Identity::generate("ada");
    let b = Identity::generate("ada");
    assert_ne!(a.pubkey_hex(), b.pubkey_hex());
}

#[test]
fn tag_is_first_four_hex_chars() {
    let identity = Identity::generate("ada");
    assert_eq!(identity.tag(), pubkey_tag(&identity.pubkey_hex()));
    assert_eq!(identity.tag().len(), 4);
}

#[test]
fn sealed_box_roundtrip() {
    // unseal(seal(k, recipient_pk), recipient_sk) == k
    let recipient = Identity::generate("bob");
    let key = generate_room_key();
    let sealed = seal_room_key(&key, &curve_public_hex(&recipient)).unwrap();
    let opened = unseal_room_key(&sealed, &curve_secret(&recipient)).unwrap();
    assert_eq!(opened, key);
}

#[test]
fn sealed_box_is_recipient_bound() {
    let bob = Identity::generate("bob");
    let eve = Identity::generate("eve");
    let key = generate_room_key();
    let sealed = seal_room_key(&key, &curve_public_hex(&bob)).unwrap();
    assert!(unseal_room_key(&sealed, &curve_secret(&eve)).is_err());
}

#[test]
fn envelope_roundtrip() {
    // decrypt(encrypt(p, k), k) == p
    let key = generate_room_key();
    for plaintext in [
        &b""[..],
        &b"x"[..],
        &b"a longer plaintext with \xf0\x9f\x8c\x8d bytes"[..],
    ] {
        let envelope = encrypt_envelope(plaintext, &key).unwrap();
        assert_eq!(decrypt_envelope(&envelope, &key).unwrap(), plaintext);
    }
}

#[test]
fn envelopes_are_randomized() {
    // Fresh nonce per envelope: same plaintext, different ciphertext.
    let key = generate_room_key();
    let a = encrypt_envelope(b"same", &key).unwrap();
    let b = encrypt_envelope(b"same", &key).unwrap();
    assert_ne!(a, b);
}

#[test]
fn curve_pk_signature_binds_to_identity() {
    let identity = Identity::generate("ada");
    let curve_pk = curve_public_hex(&identity);
    let sig = sign_curve_pk(&identity, &curve_pk).unwrap();
    assert!(verify_curve_pk_sig(&identity.pubkey_hex(), &curve_pk, &sig));
    assert!(!verify_curve_pk_sig(&identity.pubkey_hex(), &curve_pk, &sig[2..]));
}
