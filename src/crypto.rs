//! Ed25519 identity: keypair, signing, verification, on-disk persistence.
//!
//! The verify key is the canonical peer identity. The `tag` — the first
//! four hex characters of the verify key — is only a visual disambiguator;
//! the full key is authoritative everywhere a decision is made.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Hex characters of the verify key shown as the short tag.
pub const TAG_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key material")]
    InvalidKey,
    #[error("identity file: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity file: {0}")]
    Format(#[from] serde_json::Error),
}

/// Local signing identity: display name plus Ed25519 keypair.
pub struct Identity {
    pub name: String,
    signing: SigningKey,
}

impl Identity {
    pub fn generate(name: &str) -> Self {
        Self {
            name: name.to_string(),
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_signing_key_hex(name: &str, hex_key: &str) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = hex::decode(hex_key)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(CryptoError::InvalidKey)?;
        Ok(Self {
            name: name.to_string(),
            signing: SigningKey::from_bytes(&bytes),
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Full verify key, lowercase hex (64 chars).
    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    /// First four hex chars of the verify key.
    pub fn tag(&self) -> String {
        self.pubkey_hex()[..TAG_LEN].to_string()
    }

    /// `name#tag`, the display and peer-table key.
    pub fn peer_id(&self) -> String {
        format!("{}#{}", self.name, self.tag())
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing.sign(data)
    }

    pub fn sign_hex(&self, data: &[u8]) -> String {
        hex::encode(self.sign(data).to_bytes())
    }

    /// Expanded secret scalar bytes, the X25519 conversion input.
    pub(crate) fn scalar_bytes(&self) -> [u8; 32] {
        self.signing.to_scalar_bytes()
    }

    fn signing_key_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }
}

/// Verify a hex signature over `data` with a hex verify key.
/// Any malformed input verifies false.
pub fn verify_hex(pubkey_hex: &str, signature_hex: &str, data: &[u8]) -> bool {
    let Some(pk_bytes) = hex::decode(pubkey_hex)
        .ok()
        .and_then(|v| <[u8; 32]>::try_from(v).ok())
    else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(&pk_bytes) else {
        return false;
    };
    let Some(sig) = hex::decode(signature_hex)
        .ok()
        .and_then(|v| Signature::from_slice(&v).ok())
    else {
        return false;
    };
    vk.verify(data, &sig).is_ok()
}

/// Short tag for an arbitrary hex verify key.
pub fn pubkey_tag(pubkey_hex: &str) -> String {
    pubkey_hex.chars().take(TAG_LEN).collect()
}

/// Display names are 1–20 characters with no spaces.
pub fn validate_name(name: &str) -> bool {
    !name.is_empty() && name.chars().count() <= 20 && !name.contains(' ')
}

// =============================================================================
// PERSISTENCE
// =============================================================================

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    name: String,
    signing_key_hex: String,
}

/// Write the identity file with owner-only permissions.
pub fn save_identity(path: &Path, identity: &Identity) -> Result<(), CryptoError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = IdentityFile {
        name: identity.name.clone(),
        signing_key_hex: identity.signing_key_hex(),
    };
    std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Load the identity file. `None` when absent or unreadable.
pub fn load_identity(path: &Path) -> Option<Identity> {
    let data = std::fs::read_to_string(path).ok()?;
    let file: IdentityFile = serde_json::from_str(&data).ok()?;
    Identity::from_signing_key_hex(&file.name, &file.signing_key_hex).ok()
}
