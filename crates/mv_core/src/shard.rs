use crate::app_error::{AppError, AppResult};
use crate::canon_json::to_canonical_bytes;
use crate::cipher::ENCRYPTION_OVERHEAD;
use crate::store::{FactRecord, PendingDelete};
use crate::types::Scope;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ShardOperation {
    Upsert {
        key: String,
        value: String,
        tags: Vec<String>,
        scope: Scope,
        confidence: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fact_id: Option<String>,
    },
    Delete {
        key: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Shard {
    pub shard_version: u64,
    pub timestamp: String,
    pub session_id: String,
    pub operations: Vec<ShardOperation>,
}

impl Shard {
    pub fn new(
        operations: Vec<ShardOperation>,
        shard_version: u64,
        session_id: &str,
        timestamp: &str,
    ) -> Self {
        Self {
            shard_version,
            timestamp: timestamp.to_string(),
            session_id: session_id.to_string(),
            operations,
        }
    }
}

fn shard_error(code: &str, message: &str, details: serde_json::Value) -> AppError {
    AppError::new(code, "shard", message, false, details)
}

pub fn fact_to_upsert_op(fact: &FactRecord) -> ShardOperation {
    ShardOperation::Upsert {
        key: fact.key.clone(),
        value: fact.value.clone(),
        tags: fact.tags.clone(),
        scope: fact.scope.clone(),
        confidence: fact.confidence,
        fact_id: Some(fact.fact_id.clone()),
    }
}

pub fn tombstone_to_delete_op(tombstone: &PendingDelete) -> ShardOperation {
    ShardOperation::Delete {
        key: tombstone.key.clone(),
    }
}

// Canonical bytes: sorted keys, no insignificant whitespace. Two machines
// serialize the same shard to the same bytes.
pub fn serialize_shard(shard: &Shard) -> AppResult<Vec<u8>> {
    let value = serde_json::to_value(shard).map_err(|e| {
        shard_error(
            "MV_SHARD_ENCODE_FAILED",
            "failed encoding shard",
            serde_json::json!({ "error": e.to_string(), "shard_version": shard.shard_version }),
        )
    })?;
    to_canonical_bytes(&value)
}

pub fn deserialize_shard(bytes: &[u8]) -> AppResult<Shard> {
    serde_json::from_slice(bytes).map_err(|e| {
        shard_error(
            "MV_SHARD_DECODE_FAILED",
            "failed decoding shard",
            serde_json::json!({ "error": e.to_string() }),
        )
    })
}

fn encoded_op_len(op: &ShardOperation) -> AppResult<usize> {
    let value = serde_json::to_value(op).map_err(|e| {
        shard_error(
            "MV_SHARD_ENCODE_FAILED",
            "failed encoding shard operation",
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;
    Ok(to_canonical_bytes(&value)?.len())
}

// The wrapper is measured by encoding a shard with the final version,
// timestamp, and session id and an empty operation list. Never a constant:
// version digits and session id width vary.
fn wrapper_len(shard_version: u64, session_id: &str, timestamp: &str) -> AppResult<usize> {
    Ok(serialize_shard(&Shard::new(Vec::new(), shard_version, session_id, timestamp))?.len())
}

// Splits the operation list into shards with consecutive versions such that
// each serialized-then-encrypted shard fits the budget. A single operation
// that alone exceeds the budget is still emitted as its own shard; the
// chunker never discards data.
pub fn chunk_operations(
    operations: Vec<ShardOperation>,
    start_version: u64,
    session_id: &str,
    timestamp: &str,
    budget: usize,
) -> AppResult<Vec<Shard>> {
    let mut shards: Vec<Shard> = Vec::new();
    let mut version = start_version;
    let mut wrapper = wrapper_len(version, session_id, timestamp)?;
    let mut current: Vec<ShardOperation> = Vec::new();
    let mut current_bytes = 0usize;

    for op in operations {
        let op_len = encoded_op_len(&op)?;

        if !current.is_empty()
            && wrapper + current_bytes + 1 + op_len + ENCRYPTION_OVERHEAD > budget
        {
            shards.push(Shard::new(
                std::mem::take(&mut current),
                version,
                session_id,
                timestamp,
            ));
            version += 1;
            wrapper = wrapper_len(version, session_id, timestamp)?;
            current_bytes = 0;
        }

        if current.is_empty() && wrapper + op_len + ENCRYPTION_OVERHEAD > budget {
            warn!(
                code = "MV_SHARD_TOO_LARGE",
                shard_version = version,
                op_bytes = op_len,
                budget,
                "single operation exceeds the upload budget; emitting it alone"
            );
            shards.push(Shard::new(vec![op], version, session_id, timestamp));
            version += 1;
            wrapper = wrapper_len(version, session_id, timestamp)?;
            continue;
        }

        if current.is_empty() {
            current_bytes = op_len;
        } else {
            current_bytes += 1 + op_len;
        }
        current.push(op);
    }

    if !current.is_empty() {
        shards.push(Shard::new(current, version, session_id, timestamp));
    }

    Ok(shards)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayedFact {
    pub fact_id: Option<String>,
    pub key: String,
    pub value: String,
    pub tags: Vec<String>,
    pub scope: Scope,
    pub confidence: f64,
    pub source_session: String,
    pub created: String,
    pub last_confirmed: String,
    pub access_count: i64,
}

// Folds version-ascending shards into the final fact map. Upserts preserve
// `created` and `access_count` from the existing entry; deletes remove the
// entry, so a later upsert resurrects the key with a fresh `created`.
// Shards with equal versions are taken in input order.
pub fn replay_shards(shards: &[Shard]) -> Vec<ReplayedFact> {
    let mut order: Vec<String> = Vec::new();
    let mut state: HashMap<String, ReplayedFact> = HashMap::new();

    for shard in shards {
        for op in &shard.operations {
            match op {
                ShardOperation::Upsert {
                    key,
                    value,
                    tags,
                    scope,
                    confidence,
                    fact_id,
                } => {
                    let (created, access_count) = match state.get(key) {
                        Some(existing) => (existing.created.clone(), existing.access_count),
                        None => {
                            order.push(key.clone());
                            (shard.timestamp.clone(), 0)
                        }
                    };
                    state.insert(
                        key.clone(),
                        ReplayedFact {
                            fact_id: fact_id.clone(),
                            key: key.clone(),
                            value: value.clone(),
                            tags: tags.clone(),
                            scope: scope.clone(),
                            confidence: *confidence,
                            source_session: shard.session_id.clone(),
                            created,
                            last_confirmed: shard.timestamp.clone(),
                            access_count,
                        },
                    );
                }
                ShardOperation::Delete { key } => {
                    if state.remove(key).is_some() {
                        order.retain(|k| k != key);
                    }
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| state.remove(&key))
        .collect()
}
