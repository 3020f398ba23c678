use crate::app_error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

pub const TAG_APP_NAME: &str = "App-Name";
pub const TAG_WALLET: &str = "Wallet";
pub const TAG_CONTENT_TYPE: &str = "Content-Type";
pub const TAG_TIMESTAMP: &str = "Timestamp";
pub const TAG_SIGNATURE: &str = "Signature";
pub const TAG_TYPE: &str = "Type";
pub const TAG_VERSION: &str = "Version";
pub const TAG_SALT: &str = "Salt";
pub const TAG_CLIENT: &str = "Client";
pub const TAG_PROJECT: &str = "Project";
pub const TAG_SESSION: &str = "Session";
pub const TAG_OFFSET: &str = "Offset";
pub const TAG_COUNT: &str = "Count";
pub const TAG_CHUNK: &str = "Chunk";

pub const APP_NAME: &str = "memvault";
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";
pub const TYPE_DELTA: &str = "delta";
pub const TYPE_SNAPSHOT: &str = "snapshot";
pub const TYPE_IDENTITY: &str = "identity";
pub const TYPE_CONVERSATION: &str = "conversation";

// The bundling service's free-upload ceiling. A default, not a literal:
// sync::SyncOptions carries the effective value.
pub const FREE_UPLOAD_BUDGET_BYTES: usize = 92_160;

// Defensive caps against a hostile uploader staking a wallet's tag
// namespace with oversized blobs.
pub const DATA_FETCH_CAP_BYTES: usize = 102_400;
pub const IDENTITY_FETCH_CAP_BYTES: usize = 16_384;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

pub fn tag(name: &str, value: impl Into<String>) -> Tag {
    Tag {
        name: name.to_string(),
        value: value.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub name: String,
    pub values: Vec<String>,
}

pub fn tag_filter(name: &str, values: &[&str]) -> TagFilter {
    TagFilter {
        name: name.to_string(),
        values: values.iter().map(|v| v.to_string()).collect(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadReceipt {
    pub tx_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerBalance {
    pub human_readable: String,
    pub estimated_uploads_remaining: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxMeta {
    pub tx_id: String,
    pub tags: Vec<Tag>,
}

impl TxMeta {
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }
}

// The adapter moves opaque bytes and tags; the sync engine sizes and tags.
// The concrete network client implements this outside the core.
pub trait LedgerClient: Send + Sync {
    fn upload(&self, data: &[u8], tags: &[Tag]) -> AppResult<UploadReceipt>;
    fn balance(&self) -> AppResult<LedgerBalance>;
    fn query_by_tags(&self, filter: &[TagFilter]) -> AppResult<Vec<TxMeta>>;
    fn fetch_blob(&self, tx_id: &str, max_bytes: usize) -> AppResult<Vec<u8>>;
}

struct StoredTx {
    tx_id: String,
    tags: Vec<Tag>,
    data: Vec<u8>,
}

#[derive(Default)]
struct MemoryLedgerState {
    transactions: Vec<StoredTx>,
    next_id: u64,
}

// In-process ledger: tests and offline collaborators run against it.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryLedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_count(&self) -> usize {
        self.state.lock().map(|s| s.transactions.len()).unwrap_or(0)
    }
}

fn ledger_lock_error() -> AppError {
    AppError::new(
        "MV_LEDGER_REJECTED",
        "ledger",
        "memory ledger state is poisoned",
        false,
        serde_json::json!({}),
    )
}

impl LedgerClient for MemoryLedger {
    fn upload(&self, data: &[u8], tags: &[Tag]) -> AppResult<UploadReceipt> {
        let mut state = self.state.lock().map_err(|_| ledger_lock_error())?;
        state.next_id += 1;
        let tx_id = format!("memtx-{:08}", state.next_id);
        state.transactions.push(StoredTx {
            tx_id: tx_id.clone(),
            tags: tags.to_vec(),
            data: data.to_vec(),
        });
        Ok(UploadReceipt { tx_id })
    }

    fn balance(&self) -> AppResult<LedgerBalance> {
        Ok(LedgerBalance {
            human_readable: "unmetered (in-memory)".to_string(),
            estimated_uploads_remaining: u64::MAX,
        })
    }

    fn query_by_tags(&self, filter: &[TagFilter]) -> AppResult<Vec<TxMeta>> {
        let state = self.state.lock().map_err(|_| ledger_lock_error())?;
        let matches = state
            .transactions
            .iter()
            .filter(|tx| {
                filter.iter().all(|f| {
                    tx.tags
                        .iter()
                        .any(|t| t.name == f.name && f.values.contains(&t.value))
                })
            })
            .map(|tx| TxMeta {
                tx_id: tx.tx_id.clone(),
                tags: tx.tags.clone(),
            })
            .collect();
        Ok(matches)
    }

    fn fetch_blob(&self, tx_id: &str, max_bytes: usize) -> AppResult<Vec<u8>> {
        let state = self.state.lock().map_err(|_| ledger_lock_error())?;
        let tx = state
            .transactions
            .iter()
            .find(|tx| tx.tx_id == tx_id)
            .ok_or_else(|| {
                AppError::new(
                    "MV_LEDGER_REJECTED",
                    "ledger",
                    "transaction not found",
                    false,
                    serde_json::json!({ "tx_id": tx_id }),
                )
            })?;
        if tx.data.len() > max_bytes {
            return Err(AppError::new(
                "MV_FETCH_CAP_EXCEEDED",
                "ledger",
                "blob exceeds the fetch size cap",
                false,
                serde_json::json!({ "tx_id": tx_id, "len": tx.data.len(), "cap": max_bytes }),
            ));
        }
        Ok(tx.data.clone())
    }
}
