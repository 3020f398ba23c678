use crate::app_error::{AppError, AppResult};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const ENCRYPTION_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

fn tampered(details: serde_json::Value) -> AppError {
    AppError::new(
        "MV_CIPHER_TAMPERED",
        "cipher",
        "authenticated decryption failed",
        false,
        details,
    )
}

// Output layout: nonce || ciphertext || tag.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> AppResult<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|e| {
        AppError::new(
            "MV_ENTROPY_FAILED",
            "cipher",
            "failed drawing encryption nonce",
            false,
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| {
            AppError::new(
                "MV_CIPHER_FAILED",
                "cipher",
                "encryption failed",
                false,
                serde_json::json!({ "error": e.to_string() }),
            )
        })?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt(key: &[u8; 32], blob: &[u8]) -> AppResult<Vec<u8>> {
    if blob.len() < ENCRYPTION_OVERHEAD {
        return Err(tampered(serde_json::json!({
            "len": blob.len(),
            "min": ENCRYPTION_OVERHEAD
        })));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| tampered(serde_json::json!({ "len": blob.len() })))
}
