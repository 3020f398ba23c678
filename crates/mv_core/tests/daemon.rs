use mv_core::app_error::AppResult;
use mv_core::conversation::{Conversation, TranscriptClient};
use mv_core::daemon::{
    conversation_tick, discover_transcripts, fact_sync_tick, run, DaemonConfig, FileObservation,
    TranscriptRef, TranscriptSource,
};
use mv_core::ledger::MemoryLedger;
use mv_core::store::{self, open_store, FactUpsert};
use mv_core::sync::SyncOptions;
use mv_core::types::Scope;
use mv_core::vault::vault_init;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const T0: i64 = 1_760_000_000_000;
const T1: i64 = 1_760_000_060_000;
const T2: i64 = 1_760_000_120_000;

// Transcripts are plain text here: one line, one message.
struct LineSource {
    root: PathBuf,
}

impl TranscriptSource for LineSource {
    fn discover(&self) -> AppResult<Vec<TranscriptRef>> {
        discover_transcripts(&self.root, |path| {
            let session_id = path.file_stem()?.to_str()?.to_string();
            if path.extension()?.to_str()? != "log" {
                return None;
            }
            Some(TranscriptRef {
                path: path.to_path_buf(),
                client: TranscriptClient::ClaudeCode,
                project: "demo".to_string(),
                session_id,
            })
        })
    }

    fn parse(&self, transcript: &TranscriptRef) -> AppResult<Conversation> {
        let text = std::fs::read_to_string(&transcript.path).unwrap_or_default();
        Ok(Conversation {
            id: transcript.session_id.clone(),
            client: transcript.client,
            project: transcript.project.clone(),
            started_at: "2026-01-10T08:00:00.000Z".to_string(),
            updated_at: "2026-01-10T09:00:00.000Z".to_string(),
            messages: text.lines().map(|line| json!({ "content": line })).collect(),
        })
    }
}

fn write_transcript(dir: &Path, name: &str, lines: &[&str]) {
    std::fs::create_dir_all(dir).expect("transcript dir");
    std::fs::write(dir.join(name), lines.join("\n")).expect("write transcript");
}

#[test]
fn fact_tick_pushes_dirty_rows() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = vault_init(&temp.path().join("home"), T0).expect("init");
    let conn = open_store(&init.paths.db).expect("open store");
    let ledger = MemoryLedger::new();

    store::upsert_fact(
        &conn,
        &FactUpsert {
            key: "decision:ledger".to_string(),
            scope: Scope::Global,
            value: "permanent".to_string(),
            tags: vec![],
            confidence: 1.0,
            source_session: None,
            fact_id: None,
        },
        "2026-01-10T08:00:00.000Z",
    )
    .expect("upsert");

    fact_sync_tick(&conn, &ledger, &init.keys, T1, &SyncOptions::default());
    assert_eq!(ledger.transaction_count(), 1);
    assert!(store::get_dirty(&conn).expect("dirty").is_empty());

    // Nothing new: the next tick uploads nothing.
    fact_sync_tick(&conn, &ledger, &init.keys, T2, &SyncOptions::default());
    assert_eq!(ledger.transaction_count(), 1);
}

#[test]
fn conversation_tick_uploads_only_changed_transcripts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = vault_init(&temp.path().join("home"), T0).expect("init");
    let conn = open_store(&init.paths.db).expect("open store");
    let ledger = MemoryLedger::new();
    let transcripts = temp.path().join("transcripts");
    write_transcript(&transcripts, "sess-1.log", &["hello", "world"]);

    let source = LineSource {
        root: transcripts.clone(),
    };
    let mut seen: HashMap<PathBuf, FileObservation> = HashMap::new();
    let options = SyncOptions::default();

    conversation_tick(&conn, &ledger, &init.keys, &source, &mut seen, T1, &options);
    assert_eq!(ledger.transaction_count(), 1);
    assert_eq!(
        store::meta_u64(&conn, &store::conversation_offset_key("claude-code", "sess-1"))
            .expect("cursor"),
        2
    );

    // Unchanged file: no re-parse, no upload.
    conversation_tick(&conn, &ledger, &init.keys, &source, &mut seen, T1, &options);
    assert_eq!(ledger.transaction_count(), 1);

    // The transcript grew; only the delta goes out.
    write_transcript(&transcripts, "sess-1.log", &["hello", "world", "again"]);
    conversation_tick(&conn, &ledger, &init.keys, &source, &mut seen, T2, &options);
    assert_eq!(ledger.transaction_count(), 2);
    assert_eq!(
        store::meta_u64(&conn, &store::conversation_offset_key("claude-code", "sess-1"))
            .expect("cursor"),
        3
    );
}

#[test]
fn discovery_is_deterministic_and_filtered() {
    let temp = tempfile::tempdir().expect("tempdir");
    let transcripts = temp.path().join("transcripts");
    write_transcript(&transcripts, "b.log", &["x"]);
    write_transcript(&transcripts, "a.log", &["y"]);
    write_transcript(&transcripts, "notes.txt", &["ignored"]);

    let source = LineSource {
        root: transcripts,
    };
    let found = source.discover().expect("discover");
    let sessions: Vec<&str> = found.iter().map(|t| t.session_id.as_str()).collect();
    assert_eq!(sessions, vec!["a", "b"]);
}

#[test]
fn run_loop_ticks_until_shutdown() {
    let temp = tempfile::tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let transcripts = temp.path().join("transcripts");
    write_transcript(&transcripts, "sess-1.log", &["hello"]);
    let init = vault_init(&home, T0).expect("init");
    let ledger = Arc::new(MemoryLedger::new());

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    let thread_ledger = Arc::clone(&ledger);
    let db_path = init.paths.db.clone();
    let phrase = init.phrase.clone();
    let salt = std::fs::read(&init.paths.salt).expect("salt");

    let handle = std::thread::spawn(move || {
        let salt: [u8; 16] = salt.as_slice().try_into().expect("salt len");
        let keys = mv_core::keys::KeyMaterial::derive(&phrase, &salt).expect("derive");
        let conn = open_store(&db_path).expect("open store");
        store::upsert_fact(
            &conn,
            &FactUpsert {
                key: "loop:fact".to_string(),
                scope: Scope::Global,
                value: "ticks".to_string(),
                tags: vec![],
                confidence: 1.0,
                source_session: None,
                fact_id: None,
            },
            "2026-01-10T08:00:00.000Z",
        )
        .expect("upsert");

        let source = LineSource { root: transcripts };
        let config = DaemonConfig {
            fact_sync_interval: Duration::from_millis(20),
            conversation_poll_interval: Duration::from_millis(20),
            sync_options: SyncOptions::default(),
        };
        run(&conn, &*thread_ledger, &keys, &source, &config, &shutdown_rx);
    });

    std::thread::sleep(Duration::from_millis(200));
    shutdown_tx.send(()).expect("signal shutdown");
    handle.join().expect("join loop thread");

    // One fact shard and one conversation segment, each exactly once.
    assert_eq!(ledger.transaction_count(), 2);
}
