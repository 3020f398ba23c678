use mv_core::canon_json::to_canonical_bytes;
use mv_core::cipher;
use mv_core::conversation::{
    stitch_segments, Conversation, ConversationSegment, TimedSegment, TranscriptClient,
};
use mv_core::ledger::{
    tag, tag_filter, LedgerClient, MemoryLedger, APP_NAME, TAG_APP_NAME, TAG_CHUNK, TAG_CLIENT,
    TAG_COUNT, TAG_OFFSET, TAG_PROJECT, TAG_SESSION, TAG_SIGNATURE, TAG_TIMESTAMP, TAG_TYPE,
    TAG_WALLET, TYPE_CONVERSATION,
};
use mv_core::store::{self, conversation_offset_key, open_store};
use mv_core::sync::{pull_conversations, push_conversation_delta, SyncOptions};
use mv_core::vault::vault_init;
use serde_json::json;

const T0: i64 = 1_760_000_000_000;
const T1: i64 = 1_760_000_060_000;
const T2: i64 = 1_760_000_120_000;

fn conversation(session: &str, message_count: usize) -> Conversation {
    Conversation {
        id: session.to_string(),
        client: TranscriptClient::ClaudeCode,
        project: "demo".to_string(),
        started_at: "2026-01-10T08:00:00.000Z".to_string(),
        updated_at: "2026-01-10T09:00:00.000Z".to_string(),
        messages: (0..message_count)
            .map(|i| json!({ "role": if i % 2 == 0 { "user" } else { "assistant" }, "content": format!("message {i}") }))
            .collect(),
    }
}

#[test]
fn delta_push_respects_the_cursor_and_advances_it() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = vault_init(&temp.path().join("home"), T0).expect("init");
    let conn = open_store(&init.paths.db).expect("open store");
    let ledger = MemoryLedger::new();
    let options = SyncOptions::default();

    let conv = conversation("sess-1", 10);
    let cursor_key = conversation_offset_key("claude-code", "sess-1");
    store::set_meta(&conn, &cursor_key, "4").expect("seed cursor");

    let outcome = push_conversation_delta(&conn, &ledger, &init.keys, &conv, T1, &options)
        .expect("push delta");
    assert_eq!(outcome.uploaded_chunks, 1);
    assert_eq!(outcome.cursor, 10);
    assert_eq!(store::meta_u64(&conn, &cursor_key).expect("cursor"), 10);

    let metas = ledger
        .query_by_tags(&[tag_filter(TAG_TYPE, &[TYPE_CONVERSATION])])
        .expect("query");
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].tag_value(TAG_OFFSET), Some("4"));
    assert_eq!(metas[0].tag_value(TAG_COUNT), Some("6"));
    assert_eq!(metas[0].tag_value(TAG_CHUNK), Some("1/1"));
    assert_eq!(metas[0].tag_value(TAG_SESSION), Some("sess-1"));
    assert_eq!(metas[0].tag_value(TAG_CLIENT), Some("claude-code"));
    assert_eq!(metas[0].tag_value(TAG_PROJECT), Some("demo"));

    // Same transcript, same cursor: nothing left to upload.
    let again = push_conversation_delta(&conn, &ledger, &init.keys, &conv, T2, &options)
        .expect("no-op push");
    assert_eq!(again.uploaded_chunks, 0);
    assert_eq!(ledger.transaction_count(), 1);
}

#[test]
fn chunked_segments_reassemble_on_pull() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = vault_init(&temp.path().join("home"), T0).expect("init");
    let conn = open_store(&init.paths.db).expect("open store");
    let ledger = MemoryLedger::new();
    // A tiny budget forces the ciphertext itself to split.
    let options = SyncOptions { upload_budget: 128 };

    let conv = conversation("sess-chunks", 8);
    let outcome = push_conversation_delta(&conn, &ledger, &init.keys, &conv, T1, &options)
        .expect("push delta");
    assert!(outcome.uploaded_chunks >= 2);

    let pulled = pull_conversations(&ledger, &init.keys.wallet_address, &init.keys.symmetric_key)
        .expect("pull");
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].id, "sess-chunks");
    assert_eq!(pulled[0].client, TranscriptClient::ClaudeCode);
    assert_eq!(pulled[0].messages, conv.messages);
}

#[test]
fn growing_transcripts_stitch_back_in_offset_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = vault_init(&temp.path().join("home"), T0).expect("init");
    let conn = open_store(&init.paths.db).expect("open store");
    let ledger = MemoryLedger::new();
    let options = SyncOptions::default();

    let short = conversation("sess-grow", 3);
    push_conversation_delta(&conn, &ledger, &init.keys, &short, T1, &options)
        .expect("first delta");

    let long = conversation("sess-grow", 5);
    push_conversation_delta(&conn, &ledger, &init.keys, &long, T2, &options)
        .expect("second delta");

    let pulled = pull_conversations(&ledger, &init.keys.wallet_address, &init.keys.symmetric_key)
        .expect("pull");
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].messages, long.messages);
}

#[test]
fn duplicate_offsets_take_the_first_seen_segment() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = vault_init(&temp.path().join("home"), T0).expect("init");
    let conn = open_store(&init.paths.db).expect("open store");
    let ledger = MemoryLedger::new();
    let options = SyncOptions::default();

    let conv = conversation("sess-dup", 5);
    push_conversation_delta(&conn, &ledger, &init.keys, &conv, T1, &options).expect("push");

    // A cursor reset re-uploads the same offset; pull must not double the
    // messages.
    let cursor_key = conversation_offset_key("claude-code", "sess-dup");
    store::set_meta(&conn, &cursor_key, "0").expect("reset cursor");
    push_conversation_delta(&conn, &ledger, &init.keys, &conv, T2, &options).expect("re-push");
    assert_eq!(ledger.transaction_count(), 2);

    let pulled = pull_conversations(&ledger, &init.keys.wallet_address, &init.keys.symmetric_key)
        .expect("pull");
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].messages.len(), 5);
}

#[test]
fn incomplete_chunk_groups_are_silently_skipped() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = vault_init(&temp.path().join("home"), T0).expect("init");
    let ledger = MemoryLedger::new();

    let segment = ConversationSegment {
        id: "sess-lost".to_string(),
        client: TranscriptClient::Cursor,
        project: "demo".to_string(),
        started_at: "2026-01-10T08:00:00.000Z".to_string(),
        updated_at: "2026-01-10T09:00:00.000Z".to_string(),
        offset: 0,
        count: 1,
        messages: vec![json!({ "role": "user", "content": "hello" })],
    };
    let payload =
        to_canonical_bytes(&serde_json::to_value(&segment).expect("to value")).expect("canonical");
    let ciphertext = cipher::encrypt(&init.keys.symmetric_key, &payload).expect("encrypt");
    let half = ciphertext.len() / 2;
    let piece = &ciphertext[..half];
    let signature = init.keys.sign(piece).expect("sign");

    // Chunk 2/2 never arrives.
    ledger
        .upload(
            piece,
            &[
                tag(TAG_APP_NAME, APP_NAME),
                tag(TAG_WALLET, init.keys.wallet_address.clone()),
                tag(TAG_TIMESTAMP, "1760000060"),
                tag(TAG_SIGNATURE, signature),
                tag(TAG_TYPE, TYPE_CONVERSATION),
                tag(TAG_SESSION, "sess-lost"),
                tag(TAG_OFFSET, "0"),
                tag(TAG_COUNT, "1"),
                tag(TAG_CHUNK, "1/2"),
            ],
        )
        .expect("upload");

    let pulled = pull_conversations(&ledger, &init.keys.wallet_address, &init.keys.symmetric_key)
        .expect("pull");
    assert!(pulled.is_empty());
}

#[test]
fn payloads_with_unknown_shapes_are_rejected_on_pull() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = vault_init(&temp.path().join("home"), T0).expect("init");
    let ledger = MemoryLedger::new();

    let payload = to_canonical_bytes(&json!({
        "id": "sess-bad",
        "client": "windsurf",
        "project": "demo",
        "startedAt": "2026-01-10T08:00:00.000Z",
        "updatedAt": "2026-01-10T09:00:00.000Z",
        "offset": 0,
        "count": 1,
        "messages": [{ "role": "user", "content": "hello" }]
    }))
    .expect("canonical");
    let ciphertext = cipher::encrypt(&init.keys.symmetric_key, &payload).expect("encrypt");
    let signature = init.keys.sign(&ciphertext).expect("sign");
    ledger
        .upload(
            &ciphertext,
            &[
                tag(TAG_APP_NAME, APP_NAME),
                tag(TAG_WALLET, init.keys.wallet_address.clone()),
                tag(TAG_TIMESTAMP, "1760000060"),
                tag(TAG_SIGNATURE, signature),
                tag(TAG_TYPE, TYPE_CONVERSATION),
                tag(TAG_SESSION, "sess-bad"),
                tag(TAG_OFFSET, "0"),
                tag(TAG_COUNT, "1"),
                tag(TAG_CHUNK, "1/1"),
            ],
        )
        .expect("upload");

    let pulled = pull_conversations(&ledger, &init.keys.wallet_address, &init.keys.symmetric_key)
        .expect("pull");
    assert!(pulled.is_empty());
}

#[test]
fn stitching_tracks_time_bounds_across_segments() {
    let early = ConversationSegment {
        id: "sess-t".to_string(),
        client: TranscriptClient::Cursor,
        project: "demo".to_string(),
        started_at: "2026-01-10T08:00:00.000Z".to_string(),
        updated_at: "2026-01-10T08:30:00.000Z".to_string(),
        offset: 0,
        count: 1,
        messages: vec![json!("first")],
    };
    let late = ConversationSegment {
        id: "sess-t".to_string(),
        client: TranscriptClient::Cursor,
        project: "demo".to_string(),
        started_at: "2026-01-10T08:15:00.000Z".to_string(),
        updated_at: "2026-01-10T10:00:00.000Z".to_string(),
        offset: 1,
        count: 1,
        messages: vec![json!("second")],
    };

    let conversations = stitch_segments(vec![
        TimedSegment { segment: late, uploaded_at: 2 },
        TimedSegment { segment: early, uploaded_at: 1 },
    ]);
    assert_eq!(conversations.len(), 1);
    let stitched = &conversations[0];
    assert_eq!(stitched.started_at, "2026-01-10T08:00:00.000Z");
    assert_eq!(stitched.updated_at, "2026-01-10T10:00:00.000Z");
    assert_eq!(stitched.messages, vec![json!("first"), json!("second")]);
}
