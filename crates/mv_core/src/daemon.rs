use crate::app_error::AppResult;
use crate::conversation::{Conversation, TranscriptClient};
use crate::keys::KeyMaterial;
use crate::ledger::LedgerClient;
use crate::sync::{self, SyncOptions};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub fact_sync_interval: Duration,
    pub conversation_poll_interval: Duration,
    pub sync_options: SyncOptions,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            fact_sync_interval: Duration::from_secs(60),
            conversation_poll_interval: Duration::from_secs(30),
            sync_options: SyncOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptRef {
    pub path: PathBuf,
    pub client: TranscriptClient,
    pub project: String,
    pub session_id: String,
}

// Collaborator seam: where transcripts live and how each client's format
// becomes a canonical Conversation are external concerns.
pub trait TranscriptSource: Send + Sync {
    fn discover(&self) -> AppResult<Vec<TranscriptRef>>;
    fn parse(&self, transcript: &TranscriptRef) -> AppResult<Conversation>;
}

// Deterministic traversal helper for TranscriptSource implementations:
// walks `root` in file-name order and keeps the entries `classify` accepts.
pub fn discover_transcripts<F>(root: &Path, classify: F) -> AppResult<Vec<TranscriptRef>>
where
    F: Fn(&Path) -> Option<TranscriptRef>,
{
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        if let Some(transcript) = classify(entry.path()) {
            out.push(transcript);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    size: u64,
    modified: Option<SystemTime>,
}

fn file_stamp(path: &Path) -> Option<FileStamp> {
    let meta = std::fs::metadata(path).ok()?;
    Some(FileStamp {
        size: meta.len(),
        modified: meta.modified().ok(),
    })
}

// One fact-sync tick. Retryable failures are left for the next tick.
pub fn fact_sync_tick(
    conn: &Connection,
    ledger: &dyn LedgerClient,
    key_material: &KeyMaterial,
    now_ms: i64,
    options: &SyncOptions,
) {
    match sync::push_facts(conn, ledger, key_material, now_ms, options) {
        Ok(outcome) if outcome.uploaded_shards > 0 => {
            debug!(
                shards = outcome.uploaded_shards,
                last_version = outcome.last_version,
                "fact sync tick pushed"
            );
        }
        Ok(_) => {}
        Err(e) if e.retryable => {
            warn!(code = %e.code, message = %e.message, "fact sync tick failed; will retry");
        }
        Err(e) => {
            error!(code = %e.code, message = %e.message, "fact sync tick failed");
        }
    }
}

// One conversation-watcher tick: re-parse only transcripts whose size or
// mtime changed since the last observation, then push their deltas. The
// per-session ledger cursor lives in meta and survives restarts; `seen`
// only throttles re-parsing within this process.
pub fn conversation_tick(
    conn: &Connection,
    ledger: &dyn LedgerClient,
    key_material: &KeyMaterial,
    source: &dyn TranscriptSource,
    seen: &mut HashMap<PathBuf, FileObservation>,
    now_ms: i64,
    options: &SyncOptions,
) {
    let transcripts = match source.discover() {
        Ok(transcripts) => transcripts,
        Err(e) => {
            warn!(code = %e.code, message = %e.message, "transcript discovery failed");
            return;
        }
    };

    for transcript in transcripts {
        let Some(stamp) = file_stamp(&transcript.path) else {
            continue;
        };
        if seen.get(&transcript.path).map(|o| o.0) == Some(stamp) {
            continue;
        }

        let conversation = match source.parse(&transcript) {
            Ok(conversation) => conversation,
            Err(e) => {
                warn!(
                    path = %transcript.path.display(),
                    code = %e.code,
                    "transcript parse failed"
                );
                continue;
            }
        };

        match sync::push_conversation_delta(
            conn,
            ledger,
            key_material,
            &conversation,
            now_ms,
            options,
        ) {
            Ok(outcome) => {
                seen.insert(transcript.path.clone(), FileObservation(stamp));
                if outcome.uploaded_chunks > 0 {
                    debug!(
                        session = %conversation.id,
                        chunks = outcome.uploaded_chunks,
                        cursor = outcome.cursor,
                        "conversation delta pushed"
                    );
                }
            }
            Err(e) => {
                warn!(
                    session = %conversation.id,
                    code = %e.code,
                    message = %e.message,
                    "conversation delta push failed; will retry"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileObservation(FileStamp);

// Single-threaded cooperative loop: both tickers run on this thread, so a
// tick never overlaps itself and store access stays serial. Returns when
// the shutdown channel fires or disconnects.
pub fn run(
    conn: &Connection,
    ledger: &dyn LedgerClient,
    key_material: &KeyMaterial,
    source: &dyn TranscriptSource,
    config: &DaemonConfig,
    shutdown: &Receiver<()>,
) {
    let mut seen: HashMap<PathBuf, FileObservation> = HashMap::new();
    let mut next_fact_tick = Instant::now() + config.fact_sync_interval;
    let mut next_conversation_tick = Instant::now() + config.conversation_poll_interval;

    loop {
        let next_deadline = next_fact_tick.min(next_conversation_tick);
        let wait = next_deadline.saturating_duration_since(Instant::now());
        match shutdown.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        let now_ms = chrono::Utc::now().timestamp_millis();
        if now >= next_fact_tick {
            fact_sync_tick(conn, ledger, key_material, now_ms, &config.sync_options);
            next_fact_tick = now + config.fact_sync_interval;
        }
        if now >= next_conversation_tick {
            conversation_tick(
                conn,
                ledger,
                key_material,
                source,
                &mut seen,
                now_ms,
                &config.sync_options,
            );
            next_conversation_tick = now + config.conversation_poll_interval;
        }
    }
}
