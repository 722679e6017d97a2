//! Passphrase encryption for the primary key
//!
//! The primary extended private key rests encrypted under a passphrase:
//! PBKDF2-HMAC-SHA256 stretches the passphrase into an AES-256-GCM key, and
//! the GCM tag doubles as the authenticity check, so a wrong passphrase
//! surfaces as a clean authentication failure rather than garbage key bytes.
//! Salt and nonce are fresh per encryption and stored alongside the
//! ciphertext in a versioned blob.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bitcoin::bip32::ExtendedPrivKey;
use pbkdf2::pbkdf2_hmac_array;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{WalletError, WalletResult};
use crate::types::SensitiveString;

/// Current blob layout version.
pub const VAULT_VERSION: u8 = 1;

/// PBKDF2 iteration count for new blobs.
pub const PBKDF2_ROUNDS: u32 = 600_000;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// An extended private key at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKey {
    pub version: u8,
    pub rounds: u32,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Encrypt an extended private key under a passphrase.
pub fn encrypt_key(
    xprv: &ExtendedPrivKey,
    passphrase: &SensitiveString,
) -> WalletResult<EncryptedKey> {
    if passphrase.is_empty() {
        return Err(WalletError::Validation(
            "passphrase must not be empty".to_string(),
        ));
    }

    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let key = Zeroizing::new(pbkdf2_hmac_array::<Sha256, 32>(
        passphrase.as_bytes(),
        &salt,
        PBKDF2_ROUNDS,
    ));
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| WalletError::Vault(e.to_string()))?;

    let plaintext = Zeroizing::new(xprv.encode().to_vec());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| WalletError::Vault("encryption failed".to_string()))?;

    Ok(EncryptedKey {
        version: VAULT_VERSION,
        rounds: PBKDF2_ROUNDS,
        salt,
        nonce,
        ciphertext,
    })
}

/// Decrypt a stored key blob. A wrong passphrase and a tampered blob both
/// fail the same way, as [`WalletError::Authentication`].
pub fn decrypt_key(
    blob: &EncryptedKey,
    passphrase: &SensitiveString,
) -> WalletResult<ExtendedPrivKey> {
    if blob.version != VAULT_VERSION {
        return Err(WalletError::Vault(format!(
            "unsupported key blob version {}",
            blob.version
        )));
    }

    let key = Zeroizing::new(pbkdf2_hmac_array::<Sha256, 32>(
        passphrase.as_bytes(),
        &blob.salt,
        blob.rounds,
    ));
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| WalletError::Vault(e.to_string()))?;

    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&blob.nonce), blob.ciphertext.as_slice())
            .map_err(|_| WalletError::Authentication)?,
    );

    ExtendedPrivKey::decode(&plaintext).map_err(|e| WalletError::Vault(e.to_string()))
}

/// Re-encrypt a stored key under a new passphrase. The old passphrase must
/// authenticate first.
pub fn change_passphrase(
    blob: &EncryptedKey,
    old: &SensitiveString,
    new: &SensitiveString,
) -> WalletResult<EncryptedKey> {
    let xprv = decrypt_key(blob, old)?;
    encrypt_key(&xprv, new)
}
