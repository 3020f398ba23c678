use crate::app_error::{AppError, AppResult};
use crate::cipher;
use crate::hashing::{hex_prefixed, keccak256};
use crate::phrase::normalize_phrase;
use crate::signing;
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use k256::ecdsa::{SigningKey, VerifyingKey};
use sha2::Sha256;
use std::fmt;

pub const IDENTITY_HKDF_SALT: &[u8] = b"memvault-identity-v1";
pub const IDENTITY_HKDF_INFO: &[u8] = b"secp256k1-private-key";
pub const SYMMETRIC_SALT_LEN: usize = 16;
pub const SYMMETRIC_KEY_LEN: usize = 32;

const ARGON2_MEMORY_KIB: u32 = 65_536;
const ARGON2_ITERATIONS: u32 = 3;
const ARGON2_PARALLELISM: u32 = 1;

fn key_error(message: &str, details: serde_json::Value) -> AppError {
    AppError::new("MV_KEY_DERIVE_FAILED", "keys", message, false, details)
}

pub fn generate_salt() -> AppResult<[u8; SYMMETRIC_SALT_LEN]> {
    let mut salt = [0u8; SYMMETRIC_SALT_LEN];
    getrandom::getrandom(&mut salt).map_err(|e| {
        AppError::new(
            "MV_ENTROPY_FAILED",
            "keys",
            "failed drawing symmetric key salt",
            false,
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;
    Ok(salt)
}

pub fn derive_signing_key(phrase: &str) -> AppResult<SigningKey> {
    let normalized = normalize_phrase(phrase);
    let hk = Hkdf::<Sha256>::new(Some(IDENTITY_HKDF_SALT), normalized.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(IDENTITY_HKDF_INFO, &mut okm)
        .map_err(|e| key_error("hkdf expand failed", serde_json::json!({ "error": e.to_string() })))?;
    SigningKey::from_slice(&okm).map_err(|e| {
        key_error(
            "derived bytes are not a valid secp256k1 private key",
            serde_json::json!({ "error": e.to_string() }),
        )
    })
}

// Last 20 bytes of Keccak-256 over the uncompressed public point's x||y.
pub fn wallet_address_from_verifying_key(verifying_key: &VerifyingKey) -> String {
    let point = verifying_key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    hex_prefixed(&digest[12..])
}

pub fn derive_symmetric_key(
    phrase: &str,
    salt: &[u8; SYMMETRIC_SALT_LEN],
) -> AppResult<[u8; SYMMETRIC_KEY_LEN]> {
    let normalized = normalize_phrase(phrase);
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(SYMMETRIC_KEY_LEN),
    )
    .map_err(|e| {
        key_error(
            "invalid argon2 parameters",
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; SYMMETRIC_KEY_LEN];
    argon
        .hash_password_into(normalized.as_bytes(), salt, &mut key)
        .map_err(|e| {
            key_error(
                "argon2 key derivation failed",
                serde_json::json!({ "error": e.to_string() }),
            )
        })?;
    Ok(key)
}

pub struct KeyMaterial {
    pub wallet_address: String,
    pub symmetric_key: [u8; SYMMETRIC_KEY_LEN],
    signing_key: SigningKey,
}

impl KeyMaterial {
    // (phrase, salt) -> (wallet, signing key, symmetric key), deterministic.
    pub fn derive(phrase: &str, salt: &[u8; SYMMETRIC_SALT_LEN]) -> AppResult<Self> {
        let signing_key = derive_signing_key(phrase)?;
        let wallet_address = wallet_address_from_verifying_key(signing_key.verifying_key());
        let symmetric_key = derive_symmetric_key(phrase, salt)?;
        Ok(Self {
            wallet_address,
            symmetric_key,
            signing_key,
        })
    }

    pub fn sign(&self, payload: &[u8]) -> AppResult<String> {
        signing::sign_payload(&self.signing_key, payload)
    }

    pub fn compressed_public_key_hex(&self) -> String {
        let point = self.signing_key.verifying_key().to_encoded_point(true);
        hex_prefixed(point.as_bytes())
    }

    // nonce || ciphertext || tag over the raw 32-byte private key; this is
    // the identity record payload.
    pub fn seal_private_key(&self) -> AppResult<Vec<u8>> {
        cipher::encrypt(&self.symmetric_key, self.signing_key.to_bytes().as_slice())
    }

    pub fn private_key_matches(&self, candidate: &[u8]) -> bool {
        candidate.len() == 32 && candidate == self.signing_key.to_bytes().as_slice()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("wallet_address", &self.wallet_address)
            .finish_non_exhaustive()
    }
}
