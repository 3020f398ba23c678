use crate::app_error::{AppError, AppResult};
use bip39::{Language, Mnemonic};

pub const PHRASE_WORD_COUNT: usize = 12;
const ENTROPY_LEN: usize = 16;

fn phrase_error(message: &str, details: serde_json::Value) -> AppError {
    AppError::new("MV_BAD_PHRASE", "phrase", message, false, details)
}

// Lowercase, whitespace-collapsed. Shared with key derivation so the same
// phrase text always yields the same key material.
pub fn normalize_phrase(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn generate_phrase() -> AppResult<String> {
    let mut entropy = [0u8; ENTROPY_LEN];
    getrandom::getrandom(&mut entropy).map_err(|e| {
        AppError::new(
            "MV_ENTROPY_FAILED",
            "phrase",
            "failed drawing phrase entropy",
            false,
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;
    let mnemonic = Mnemonic::from_entropy(&entropy).map_err(|e| {
        phrase_error(
            "failed encoding entropy into phrase words",
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;
    Ok(mnemonic.to_string())
}

// Returns the normalized phrase on success.
pub fn validate_phrase(raw: &str) -> AppResult<String> {
    let normalized = normalize_phrase(raw);
    let word_count = normalized.split(' ').filter(|w| !w.is_empty()).count();
    if word_count != PHRASE_WORD_COUNT {
        return Err(phrase_error(
            "recovery phrase must contain exactly 12 words",
            serde_json::json!({ "expected": PHRASE_WORD_COUNT, "actual": word_count }),
        ));
    }

    match Mnemonic::parse_in_normalized(Language::English, &normalized) {
        Ok(_) => Ok(normalized),
        Err(bip39::Error::UnknownWord(index)) => {
            let word = normalized.split(' ').nth(index).unwrap_or_default().to_string();
            Err(phrase_error(
                "recovery phrase contains a word outside the wordlist",
                serde_json::json!({ "word": word, "index": index }),
            ))
        }
        Err(bip39::Error::InvalidChecksum) => Err(phrase_error(
            "recovery phrase checksum does not match",
            serde_json::json!({}),
        )),
        Err(e) => Err(phrase_error(
            "recovery phrase is invalid",
            serde_json::json!({ "error": e.to_string() }),
        )),
    }
}
