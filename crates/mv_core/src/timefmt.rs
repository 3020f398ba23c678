use crate::app_error::{AppError, AppResult};
use chrono::{DateTime, Utc};

// Fixed-width UTC text form; lexicographic order equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub fn utc_text(now_ms: i64) -> AppResult<String> {
    let dt: DateTime<Utc> = DateTime::from_timestamp_millis(now_ms).ok_or_else(|| {
        AppError::new(
            "MV_TIMESTAMP_INVALID",
            "timefmt",
            "millisecond timestamp is out of range",
            false,
            serde_json::json!({ "now_ms": now_ms }),
        )
    })?;
    Ok(dt.format(TIMESTAMP_FORMAT).to_string())
}

pub fn epoch_seconds(now_ms: i64) -> i64 {
    now_ms.div_euclid(1000)
}
