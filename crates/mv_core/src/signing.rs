use crate::app_error::{AppError, AppResult};
use crate::hashing::{hex_prefixed, keccak256};
use crate::keys::wallet_address_from_verifying_key;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};

pub const SIGNATURE_LEN: usize = 65;

// 0x-prefixed hex of r || s || recovery_id over the Keccak-256 prehash.
pub fn sign_payload(signing_key: &SigningKey, payload: &[u8]) -> AppResult<String> {
    let digest = keccak256(payload);
    let (signature, recovery_id) =
        signing_key.sign_prehash_recoverable(&digest).map_err(|e| {
            AppError::new(
                "MV_SIGNING_FAILED",
                "signing",
                "recoverable signature failed",
                false,
                serde_json::json!({ "error": e.to_string() }),
            )
        })?;

    let mut bytes = [0u8; SIGNATURE_LEN];
    bytes[..64].copy_from_slice(signature.to_bytes().as_slice());
    bytes[64] = recovery_id.to_byte();
    Ok(hex_prefixed(&bytes))
}

// Recovers the signer from the signature and compares wallet identifiers
// case-insensitively. Any parse or recovery failure is false, never an error.
pub fn verify_payload(payload: &[u8], signature: &str, expected_wallet: &str) -> bool {
    let hex_part = signature.strip_prefix("0x").unwrap_or(signature);
    let Ok(bytes) = hex::decode(hex_part) else {
        return false;
    };
    if bytes.len() != SIGNATURE_LEN {
        return false;
    }
    let Ok(parsed) = Signature::from_slice(&bytes[..64]) else {
        return false;
    };
    // Ethereum-style signatures carry 27/28 here.
    let recovery_byte = if bytes[64] >= 27 { bytes[64] - 27 } else { bytes[64] };
    let Some(recovery_id) = RecoveryId::from_byte(recovery_byte) else {
        return false;
    };

    let digest = keccak256(payload);
    let Ok(recovered) = VerifyingKey::recover_from_prehash(&digest, &parsed, recovery_id) else {
        return false;
    };
    wallet_address_from_verifying_key(&recovered).eq_ignore_ascii_case(expected_wallet)
}
