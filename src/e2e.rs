//! End-to-end encryption for the relay path.
//!
//! X25519 keys are derived from the Ed25519 identity key. The room key is
//! distributed in sealed boxes (anonymous, only the recipient can open)
//! and messages travel in secret-box envelopes (symmetric XSalsa20-Poly1305).
//! The relay forwards opaque blobs; it never holds key material.

use crate::crypto::Identity;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::StaticSecret;

/// Room key size in bytes (secret-box key).
pub const ROOM_KEY_SIZE: usize = 32;

/// Secret-box nonce size in bytes.
const NONCE_SIZE: usize = 24;

/// Symmetric key shared by all peers currently on one relay.
pub type RoomKey = [u8; ROOM_KEY_SIZE];

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("bad public key encoding")]
    BadPublicKey,
    #[error("seal failed")]
    Seal,
    #[error("unseal failed")]
    Unseal,
    #[error("encrypt failed")]
    Encrypt,
    #[error("decrypt failed")]
    Decrypt,
}

/// X25519 secret derived from the Ed25519 signing key
/// (libsodium sk-to-curve25519 conversion).
pub fn curve_secret(identity: &Identity) -> StaticSecret {
    StaticSecret::from(identity.scalar_bytes())
}

/// X25519 public key matching [`curve_secret`], lowercase hex.
pub fn curve_public_hex(identity: &Identity) -> String {
    hex::encode(identity.verifying_key().to_montgomery().to_bytes())
}

pub fn generate_room_key() -> RoomKey {
    let mut key = [0u8; ROOM_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Seal the room key to a recipient's X25519 public key. The sealed box
/// carries no sender identity. Returns base64.
pub fn seal_room_key(room_key: &RoomKey, recipient_pk_hex: &str) -> Result<String, E2eError> {
    let pk_bytes: [u8; 32] = hex::decode(recipient_pk_hex)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or(E2eError::BadPublicKey)?;
    let pk = crypto_box::PublicKey::from(pk_bytes);
    let sealed = pk.seal(&mut OsRng, room_key).map_err(|_| E2eError::Seal)?;
    Ok(BASE64.encode(sealed))
}

/// Open a sealed room key with our X25519 secret.
pub fn unseal_room_key(sealed_b64: &str, secret: &StaticSecret) -> Result<RoomKey, E2eError> {
    let sealed = BASE64.decode(sealed_b64).map_err(|_| E2eError::Unseal)?;
    let sk = crypto_box::SecretKey::from(secret.to_bytes());
    let plain = sk.unseal(&sealed).map_err(|_| E2eError::Unseal)?;
    plain.try_into().map_err(|_| E2eError::Unseal)
}

/// Encrypt message bytes under the room key. The envelope is
/// base64(nonce ∥ ciphertext).
pub fn encrypt_envelope(plaintext: &[u8], room_key: &RoomKey) -> Result<String, E2eError> {
    let cipher = XSalsa20Poly1305::new(Key::from_slice(room_key));
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| E2eError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

/// Decrypt a base64 envelope back to plaintext bytes.
pub fn decrypt_envelope(envelope_b64: &str, room_key: &RoomKey) -> Result<Vec<u8>, E2eError> {
    let data = BASE64.decode(envelope_b64).map_err(|_| E2eError::Decrypt)?;
    if data.len() < NONCE_SIZE {
        return Err(E2eError::Decrypt);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XSalsa20Poly1305::new(Key::from_slice(room_key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| E2eError::Decrypt)
}

/// Sign an X25519 public key under the Ed25519 identity key, binding the
/// curve key to the signing identity for peers that choose to check it
/// before sealing a room key to a claimed `curve_pk`.
pub fn sign_curve_pk(identity: &Identity, curve_pk_hex: &str) -> Result<String, E2eError> {
    let pk_bytes = hex::decode(curve_pk_hex).map_err(|_| E2eError::BadPublicKey)?;
    Ok(identity.sign_hex(&pk_bytes))
}

/// Verify that a curve public key was signed by the claimed identity.
pub fn verify_curve_pk_sig(verify_key_hex: &str, curve_pk_hex: &str, sig_hex: &str) -> bool {
    let Ok(pk_bytes) = hex::decode(curve_pk_hex) else {
        return false;
    };
    crate::crypto::verify_hex(verify_key_hex, sig_hex, &pk_bytes)
}
