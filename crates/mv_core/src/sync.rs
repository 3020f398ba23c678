use crate::app_error::{AppError, AppResult};
use crate::cipher;
use crate::conversation::{
    parse_segment, serialize_segment, stitch_segments, Conversation, ConversationSegment,
    TimedSegment,
};
use crate::keys::{self, KeyMaterial};
use crate::ledger::{
    tag, tag_filter, LedgerClient, Tag, TxMeta, APP_NAME, CONTENT_TYPE_OCTET_STREAM,
    DATA_FETCH_CAP_BYTES, FREE_UPLOAD_BUDGET_BYTES, IDENTITY_FETCH_CAP_BYTES, TAG_APP_NAME,
    TAG_CHUNK, TAG_CLIENT, TAG_CONTENT_TYPE, TAG_COUNT, TAG_OFFSET, TAG_PROJECT, TAG_SALT,
    TAG_SESSION, TAG_SIGNATURE, TAG_TIMESTAMP, TAG_TYPE, TAG_VERSION, TAG_WALLET, TYPE_CONVERSATION,
    TYPE_DELTA, TYPE_IDENTITY, TYPE_SNAPSHOT,
};
use crate::phrase;
use crate::shard::{
    chunk_operations, deserialize_shard, fact_to_upsert_op, serialize_shard,
    tombstone_to_delete_op, Shard, ShardOperation,
};
use crate::signing;
use crate::store;
use crate::timefmt;
use crate::vault::{self, VaultPaths};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub upload_budget: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            upload_budget: FREE_UPLOAD_BUDGET_BYTES,
        }
    }
}

fn sync_error(code: &str, message: &str, details: serde_json::Value) -> AppError {
    AppError::new(code, "sync", message, false, details)
}

fn base_tags(wallet: &str, now_ms: i64, signature: &str) -> Vec<Tag> {
    vec![
        tag(TAG_APP_NAME, APP_NAME),
        tag(TAG_WALLET, wallet),
        tag(TAG_CONTENT_TYPE, CONTENT_TYPE_OCTET_STREAM),
        tag(TAG_TIMESTAMP, timefmt::epoch_seconds(now_ms).to_string()),
        tag(TAG_SIGNATURE, signature),
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushFactsOutcome {
    pub uploaded_shards: usize,
    pub first_version: u64,
    pub last_version: u64,
}

// One push tick. Dirty facts become upserts, tombstones become deletes, the
// batch is chunked from current_version + 1 and uploaded in strict version
// order. Dirty state clears only after the whole batch lands; an upload
// failure mid-batch leaves it for the next tick to retry at a higher
// start version.
pub fn push_facts(
    conn: &Connection,
    ledger: &dyn LedgerClient,
    key_material: &KeyMaterial,
    now_ms: i64,
    options: &SyncOptions,
) -> AppResult<PushFactsOutcome> {
    let tx = conn.unchecked_transaction().map_err(|e| {
        sync_error(
            "MV_DB_QUERY_FAILED",
            "failed snapshotting dirty state",
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;
    let dirty = store::get_dirty(&tx)?;
    let tombstones = store::get_pending_deletes(&tx)?;
    drop(tx);

    if dirty.is_empty() && tombstones.is_empty() {
        return Ok(PushFactsOutcome {
            uploaded_shards: 0,
            first_version: 0,
            last_version: store::meta_u64(conn, store::META_CURRENT_VERSION)?,
        });
    }

    let mut operations: Vec<ShardOperation> = Vec::with_capacity(dirty.len() + tombstones.len());
    for fact in &dirty {
        operations.push(fact_to_upsert_op(fact));
    }
    for tombstone in &tombstones {
        operations.push(tombstone_to_delete_op(tombstone));
    }

    let current_version = store::meta_u64(conn, store::META_CURRENT_VERSION)?;
    let start_version = current_version + 1;
    let session_id = uuid::Uuid::new_v4().to_string();
    let timestamp = timefmt::utc_text(now_ms)?;
    let shards = chunk_operations(
        operations,
        start_version,
        &session_id,
        &timestamp,
        options.upload_budget,
    )?;

    let mut last_version = current_version;
    for shard in &shards {
        let bytes = serialize_shard(shard)?;
        let ciphertext = cipher::encrypt(&key_material.symmetric_key, &bytes)?;
        let signature = key_material.sign(&ciphertext)?;
        let mut tags = base_tags(&key_material.wallet_address, now_ms, &signature);
        tags.push(tag(TAG_TYPE, TYPE_DELTA));
        tags.push(tag(TAG_VERSION, shard.shard_version.to_string()));

        // Shard v+1 is not attempted until v has a transaction id.
        let receipt = ledger.upload(&ciphertext, &tags)?;
        store::set_meta(
            conn,
            store::META_LAST_PUSHED_VERSION,
            &shard.shard_version.to_string(),
        )?;
        last_version = shard.shard_version;
        debug!(
            version = shard.shard_version,
            tx_id = %receipt.tx_id,
            operations = shard.operations.len(),
            "uploaded fact shard"
        );
    }

    store::clear_dirty(conn)?;
    store::set_meta(conn, store::META_CURRENT_VERSION, &last_version.to_string())?;

    Ok(PushFactsOutcome {
        uploaded_shards: shards.len(),
        first_version: start_version,
        last_version,
    })
}

// Runs once per home: uploads the sealed private key with the salt in its
// tags so recovery can start from nothing but the phrase.
pub fn push_identity(
    conn: &Connection,
    ledger: &dyn LedgerClient,
    key_material: &KeyMaterial,
    paths: &VaultPaths,
    now_ms: i64,
) -> AppResult<Option<String>> {
    if store::get_meta(conn, store::META_IDENTITY_PUSHED)?.is_some() {
        return Ok(None);
    }

    let salt = vault::read_salt(paths)?;
    let sealed = vault::read_identity_blob(paths)?;
    let signature = key_material.sign(&sealed)?;
    let mut tags = base_tags(&key_material.wallet_address, now_ms, &signature);
    tags.push(tag(TAG_TYPE, TYPE_IDENTITY));
    tags.push(tag(TAG_SALT, hex::encode(salt)));

    let receipt = ledger.upload(&sealed, &tags)?;
    store::set_meta(conn, store::META_IDENTITY_PUSHED, &receipt.tx_id)?;
    debug!(tx_id = %receipt.tx_id, "uploaded identity record");
    Ok(Some(receipt.tx_id))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationPushOutcome {
    pub uploaded_chunks: usize,
    pub cursor: u64,
}

// Uploads the messages past the per-session cursor as one segment. The
// ciphertext, not the plaintext, is what gets split into chunks. The cursor
// only advances after every chunk has landed; a partial failure re-uploads
// the whole segment next tick (duplicates are tolerated on pull).
pub fn push_conversation_delta(
    conn: &Connection,
    ledger: &dyn LedgerClient,
    key_material: &KeyMaterial,
    conversation: &Conversation,
    now_ms: i64,
    options: &SyncOptions,
) -> AppResult<ConversationPushOutcome> {
    let cursor_key =
        store::conversation_offset_key(conversation.client.as_str(), &conversation.id);
    let last_synced = store::meta_u64(conn, &cursor_key)?;
    let total = conversation.messages.len() as u64;
    let safe_offset = last_synced.min(total);
    let delta = &conversation.messages[safe_offset as usize..];

    if delta.is_empty() {
        return Ok(ConversationPushOutcome {
            uploaded_chunks: 0,
            cursor: last_synced,
        });
    }

    let segment = ConversationSegment {
        id: conversation.id.clone(),
        client: conversation.client,
        project: conversation.project.clone(),
        started_at: conversation.started_at.clone(),
        updated_at: conversation.updated_at.clone(),
        offset: safe_offset,
        count: delta.len() as u64,
        messages: delta.to_vec(),
    };
    let payload = serialize_segment(&segment)?;
    let ciphertext = cipher::encrypt(&key_material.symmetric_key, &payload)?;

    let pieces: Vec<&[u8]> = ciphertext.chunks(options.upload_budget.max(1)).collect();
    let total_pieces = pieces.len();
    for (index, piece) in pieces.iter().enumerate() {
        let signature = key_material.sign(piece)?;
        let mut tags = base_tags(&key_material.wallet_address, now_ms, &signature);
        tags.push(tag(TAG_TYPE, TYPE_CONVERSATION));
        tags.push(tag(TAG_CLIENT, conversation.client.as_str()));
        tags.push(tag(TAG_PROJECT, conversation.project.clone()));
        tags.push(tag(TAG_SESSION, conversation.id.clone()));
        tags.push(tag(TAG_OFFSET, safe_offset.to_string()));
        tags.push(tag(TAG_COUNT, segment.count.to_string()));
        tags.push(tag(TAG_CHUNK, format!("{}/{}", index + 1, total_pieces)));
        ledger.upload(piece, &tags)?;
    }

    store::set_meta(conn, &cursor_key, &total.to_string())?;
    debug!(
        session = %conversation.id,
        offset = safe_offset,
        count = segment.count,
        chunks = total_pieces,
        "uploaded conversation delta"
    );
    Ok(ConversationPushOutcome {
        uploaded_chunks: total_pieces,
        cursor: total,
    })
}

#[derive(Debug, Clone)]
struct ShardEntry {
    tx_id: String,
    version: u64,
    shard_type: String,
    signature: Option<String>,
}

fn data_shard_entries(ledger: &dyn LedgerClient, wallet: &str) -> AppResult<Vec<ShardEntry>> {
    let metas = ledger.query_by_tags(&[
        tag_filter(TAG_APP_NAME, &[APP_NAME]),
        tag_filter(TAG_WALLET, &[wallet]),
        tag_filter(TAG_TYPE, &[TYPE_DELTA, TYPE_SNAPSHOT]),
    ])?;

    let mut entries = Vec::with_capacity(metas.len());
    for meta in metas {
        let Some(version) = meta
            .tag_value(TAG_VERSION)
            .and_then(|v| v.parse::<u64>().ok())
        else {
            warn!(tx_id = %meta.tx_id, "data shard has no usable Version tag; ignoring");
            continue;
        };
        let shard_type = meta
            .tag_value(TAG_TYPE)
            .unwrap_or(TYPE_DELTA)
            .to_string();
        entries.push(ShardEntry {
            signature: meta.tag_value(TAG_SIGNATURE).map(|s| s.to_string()),
            tx_id: meta.tx_id,
            version,
            shard_type,
        });
    }
    Ok(entries)
}

// Highest shard version the ledger knows for this wallet; collaborators
// compare it against the local cursor to detect divergence.
pub fn check_remote_version(ledger: &dyn LedgerClient, wallet: &str) -> AppResult<u64> {
    let entries = data_shard_entries(ledger, wallet)?;
    Ok(entries.iter().map(|e| e.version).max().unwrap_or(0))
}

fn fetch_shard(
    ledger: &dyn LedgerClient,
    entry: &ShardEntry,
    wallet: &str,
    symmetric_key: &[u8; 32],
) -> AppResult<Shard> {
    let blob = ledger.fetch_blob(&entry.tx_id, DATA_FETCH_CAP_BYTES)?;
    if blob.len() > DATA_FETCH_CAP_BYTES {
        return Err(sync_error(
            "MV_FETCH_CAP_EXCEEDED",
            "data shard exceeds the fetch size cap",
            serde_json::json!({ "tx_id": entry.tx_id, "len": blob.len() }),
        ));
    }

    // Verification comes first; a shard that fails it is never decrypted.
    let signature = entry.signature.as_deref().ok_or_else(|| {
        sync_error(
            "MV_SIGNATURE_INVALID",
            "data shard carries no signature tag",
            serde_json::json!({ "tx_id": entry.tx_id }),
        )
    })?;
    if !signing::verify_payload(&blob, signature, wallet) {
        return Err(sync_error(
            "MV_SIGNATURE_INVALID",
            "data shard signature does not verify against the wallet",
            serde_json::json!({ "tx_id": entry.tx_id, "version": entry.version }),
        ));
    }

    let bytes = cipher::decrypt(symmetric_key, &blob)?;
    deserialize_shard(&bytes)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreOutcome {
    pub wallet_address: String,
    pub fact_count: usize,
    pub current_version: u64,
    pub replayed_shards: usize,
    pub skipped_shards: usize,
}

// Full restore on a fresh machine from the wallet identifier and the
// recovery phrase. Fatal recovery errors tear down whatever part of the
// home this attempt created.
pub fn pull_and_reconstruct(
    ledger: &dyn LedgerClient,
    wallet: &str,
    raw_phrase: &str,
    home: &Path,
) -> AppResult<RestoreOutcome> {
    if vault::vault_is_initialized(home) {
        return Err(sync_error(
            "MV_ALREADY_INITIALIZED",
            "restore target already contains local state",
            serde_json::json!({ "path": home }),
        ));
    }

    // Wallet identifiers are lowercase on the wire; accept pasted
    // checksummed forms.
    let wallet = wallet.to_ascii_lowercase();
    let home_existed = home.exists();
    let result = restore_into(ledger, &wallet, raw_phrase, home);
    if result.is_err() {
        teardown_home(home, home_existed);
    }
    result
}

fn teardown_home(home: &Path, home_existed: bool) {
    let paths = vault::vault_paths(home);
    for path in [&paths.db, &paths.salt, &paths.identity] {
        let _ = std::fs::remove_file(path);
    }
    if !home_existed {
        let _ = std::fs::remove_dir_all(home);
    }
}

fn restore_into(
    ledger: &dyn LedgerClient,
    wallet: &str,
    raw_phrase: &str,
    home: &Path,
) -> AppResult<RestoreOutcome> {
    let normalized = phrase::validate_phrase(raw_phrase)?;

    // 1. Identity record: the salt rides in its tags, the sealed private
    //    key is the payload.
    let identity_metas = ledger.query_by_tags(&[
        tag_filter(TAG_APP_NAME, &[APP_NAME]),
        tag_filter(TAG_WALLET, &[wallet]),
        tag_filter(TAG_TYPE, &[TYPE_IDENTITY]),
    ])?;
    let identity = identity_metas.first().ok_or_else(|| {
        sync_error(
            "MV_IDENTITY_MISSING",
            "no identity record exists for this wallet",
            serde_json::json!({ "wallet": wallet }),
        )
    })?;
    let salt_hex = identity.tag_value(TAG_SALT).ok_or_else(|| {
        sync_error(
            "MV_IDENTITY_MISSING",
            "identity record carries no salt tag",
            serde_json::json!({ "tx_id": identity.tx_id }),
        )
    })?;
    let salt: [u8; keys::SYMMETRIC_SALT_LEN] = hex::decode(salt_hex)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            sync_error(
                "MV_IDENTITY_MISSING",
                "identity record salt tag is not 16 hex-encoded bytes",
                serde_json::json!({ "tx_id": identity.tx_id }),
            )
        })?;
    let sealed = ledger.fetch_blob(&identity.tx_id, IDENTITY_FETCH_CAP_BYTES)?;
    if sealed.len() > IDENTITY_FETCH_CAP_BYTES {
        return Err(sync_error(
            "MV_FETCH_CAP_EXCEEDED",
            "identity record exceeds the fetch size cap",
            serde_json::json!({ "tx_id": identity.tx_id, "len": sealed.len() }),
        ));
    }

    // 2–3. The phrase must decrypt the payload, and the decrypted key must
    //      be the phrase-derived key bit-for-bit.
    let key_material = KeyMaterial::derive(&normalized, &salt)?;
    let private_key = cipher::decrypt(&key_material.symmetric_key, &sealed).map_err(|_| {
        sync_error(
            "MV_BAD_PASSPHRASE",
            "recovery phrase does not decrypt the identity record",
            serde_json::json!({ "tx_id": identity.tx_id }),
        )
    })?;
    if !key_material.private_key_matches(&private_key) {
        return Err(sync_error(
            "MV_IDENTITY_MISMATCH",
            "identity record decrypts to a different private key than the phrase derives",
            serde_json::json!({ "tx_id": identity.tx_id }),
        ));
    }

    let paths = vault::vault_paths(home);
    vault::materialize_identity(&paths, &salt, &sealed)?;
    let conn = store::open_store(&paths.db)?;
    store::set_meta(&conn, store::META_WALLET_ADDRESS, wallet)?;
    store::set_meta(&conn, store::META_IDENTITY_PUSHED, &identity.tx_id)?;

    // 4–5. Discover the shard log; an empty log is a valid empty vault.
    let entries = data_shard_entries(ledger, wallet)?;
    if entries.is_empty() {
        store::set_meta(&conn, store::META_CURRENT_VERSION, "0")?;
        store::set_meta(&conn, store::META_LAST_PUSHED_VERSION, "0")?;
        return Ok(RestoreOutcome {
            wallet_address: wallet.to_string(),
            fact_count: 0,
            current_version: 0,
            replayed_shards: 0,
            skipped_shards: 0,
        });
    }

    // 6. A snapshot, when present, truncates the history below it.
    let snapshot_floor = entries
        .iter()
        .filter(|e| e.shard_type == TYPE_SNAPSHOT)
        .map(|e| e.version)
        .max();
    let selected: Vec<&ShardEntry> = match snapshot_floor {
        Some(floor) => entries.iter().filter(|e| e.version >= floor).collect(),
        None => entries.iter().collect(),
    };

    // 7. Unreadable shards are skipped, never fatal.
    let mut survivors: Vec<Shard> = Vec::new();
    let mut skipped = 0usize;
    for entry in &selected {
        match fetch_shard(ledger, entry, wallet, &key_material.symmetric_key) {
            Ok(shard) => survivors.push(shard),
            Err(e) => {
                skipped += 1;
                warn!(
                    tx_id = %entry.tx_id,
                    version = entry.version,
                    code = %e.code,
                    "skipping unreadable shard during restore"
                );
            }
        }
    }

    // 8.
    if survivors.is_empty() {
        return Err(sync_error(
            "MV_NO_RECOVERABLE_SHARDS",
            "no shard for this wallet survived verification and decryption",
            serde_json::json!({ "queried": entries.len(), "skipped": skipped }),
        ));
    }

    // 9. The cursor covers every queried shard so an unreadable one is not
    //    re-attempted on every subsequent pull.
    survivors.sort_by_key(|s| s.shard_version);
    let replayed_shards = survivors.len();
    let facts = crate::shard::replay_shards(&survivors);
    for fact in &facts {
        let record = store::FactRecord {
            fact_id: fact
                .fact_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            key: fact.key.clone(),
            scope: fact.scope.clone(),
            value: fact.value.clone(),
            tags: fact.tags.clone(),
            confidence: fact.confidence,
            source_session: Some(fact.source_session.clone()),
            created: fact.created.clone(),
            last_confirmed: fact.last_confirmed.clone(),
            access_count: fact.access_count,
            dirty: false,
        };
        store::insert_restored_fact(&conn, &record)?;
    }

    let current_version = entries.iter().map(|e| e.version).max().unwrap_or(0);
    store::set_meta(&conn, store::META_CURRENT_VERSION, &current_version.to_string())?;
    store::set_meta(
        &conn,
        store::META_LAST_PUSHED_VERSION,
        &current_version.to_string(),
    )?;
    store::clear_dirty(&conn)?;

    Ok(RestoreOutcome {
        wallet_address: wallet.to_string(),
        fact_count: facts.len(),
        current_version,
        replayed_shards,
        skipped_shards: skipped,
    })
}

#[derive(Debug, Clone)]
struct ChunkRef {
    index: u64,
    total: u64,
    tx_id: String,
    signature: Option<String>,
}

fn parse_chunk_tag(value: &str) -> Option<(u64, u64)> {
    let (index, total) = value.split_once('/')?;
    let index: u64 = index.parse().ok()?;
    let total: u64 = total.parse().ok()?;
    if index == 0 || index > total {
        return None;
    }
    Some((index, total))
}

// A group is usable only when its chunk indices are exactly 1..N for one
// consistent N.
fn group_is_complete(chunks: &[ChunkRef]) -> bool {
    let Some(total) = chunks.first().map(|c| c.total) else {
        return false;
    };
    if chunks.iter().any(|c| c.total != total) || chunks.len() as u64 != total {
        return false;
    }
    chunks
        .iter()
        .enumerate()
        .all(|(i, c)| c.index == i as u64 + 1)
}

// Rebuilds conversations from the wallet's chunked segment uploads.
// Incomplete groups are silently skipped; groups that fail verification or
// decryption are skipped with a warning.
pub fn pull_conversations(
    ledger: &dyn LedgerClient,
    wallet: &str,
    symmetric_key: &[u8; 32],
) -> AppResult<Vec<Conversation>> {
    let metas = ledger.query_by_tags(&[
        tag_filter(TAG_APP_NAME, &[APP_NAME]),
        tag_filter(TAG_WALLET, &[wallet]),
        tag_filter(TAG_TYPE, &[TYPE_CONVERSATION]),
    ])?;

    let mut groups: HashMap<(String, u64, i64), Vec<ChunkRef>> = HashMap::new();
    for meta in metas {
        let Some(group) = chunk_group_key(&meta) else {
            continue;
        };
        let Some((index, total)) = meta.tag_value(TAG_CHUNK).and_then(parse_chunk_tag) else {
            continue;
        };
        groups.entry(group).or_default().push(ChunkRef {
            index,
            total,
            tx_id: meta.tx_id.clone(),
            signature: meta.tag_value(TAG_SIGNATURE).map(|s| s.to_string()),
        });
    }

    let mut segments: Vec<TimedSegment> = Vec::new();
    for ((session, offset, uploaded_at), mut chunks) in groups {
        chunks.sort_by_key(|c| c.index);
        if !group_is_complete(&chunks) {
            continue;
        }
        match decode_chunk_group(ledger, wallet, symmetric_key, &chunks) {
            Ok(segment) => segments.push(TimedSegment {
                segment,
                uploaded_at,
            }),
            Err(e) => {
                warn!(
                    session = %session,
                    offset,
                    code = %e.code,
                    "skipping undecodable conversation segment"
                );
            }
        }
    }

    Ok(stitch_segments(segments))
}

fn chunk_group_key(meta: &TxMeta) -> Option<(String, u64, i64)> {
    let session = meta.tag_value(TAG_SESSION)?.to_string();
    let offset: u64 = meta.tag_value(TAG_OFFSET)?.parse().ok()?;
    let uploaded_at: i64 = meta.tag_value(TAG_TIMESTAMP)?.parse().ok()?;
    Some((session, offset, uploaded_at))
}

fn decode_chunk_group(
    ledger: &dyn LedgerClient,
    wallet: &str,
    symmetric_key: &[u8; 32],
    chunks: &[ChunkRef],
) -> AppResult<ConversationSegment> {
    let mut ciphertext = Vec::new();
    for chunk in chunks {
        let piece = ledger.fetch_blob(&chunk.tx_id, DATA_FETCH_CAP_BYTES)?;
        if piece.len() > DATA_FETCH_CAP_BYTES {
            return Err(sync_error(
                "MV_FETCH_CAP_EXCEEDED",
                "conversation chunk exceeds the fetch size cap",
                serde_json::json!({ "tx_id": chunk.tx_id, "len": piece.len() }),
            ));
        }
        let signature = chunk.signature.as_deref().ok_or_else(|| {
            sync_error(
                "MV_SIGNATURE_INVALID",
                "conversation chunk carries no signature tag",
                serde_json::json!({ "tx_id": chunk.tx_id }),
            )
        })?;
        if !signing::verify_payload(&piece, signature, wallet) {
            return Err(sync_error(
                "MV_SIGNATURE_INVALID",
                "conversation chunk signature does not verify against the wallet",
                serde_json::json!({ "tx_id": chunk.tx_id }),
            ));
        }
        ciphertext.extend_from_slice(&piece);
    }

    let payload = cipher::decrypt(symmetric_key, &ciphertext)?;
    parse_segment(&payload)
}
