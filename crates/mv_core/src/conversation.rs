use crate::app_error::{AppError, AppResult};
use crate::canon_json::to_canonical_bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TranscriptClient {
    #[serde(rename = "cursor")]
    Cursor,
    #[serde(rename = "claude-code")]
    ClaudeCode,
}

impl TranscriptClient {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptClient::Cursor => "cursor",
            TranscriptClient::ClaudeCode => "claude-code",
        }
    }

    pub fn parse(text: &str) -> AppResult<Self> {
        match text {
            "cursor" => Ok(TranscriptClient::Cursor),
            "claude-code" => Ok(TranscriptClient::ClaudeCode),
            other => Err(AppError::new(
                "MV_CONVERSATION_INVALID",
                "conversation",
                "unknown transcript client",
                false,
                serde_json::json!({ "client": other }),
            )),
        }
    }
}

// Canonical transcript shape returned by the per-client parsers.
// `id` is the session identifier; message items are opaque JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Conversation {
    pub id: String,
    pub client: TranscriptClient,
    pub project: String,
    pub started_at: String,
    pub updated_at: String,
    pub messages: Vec<Value>,
}

// An offset-tagged slice of a transcript, the unit that goes to the ledger.
// `offset` counts messages already uploaded before this segment;
// `count` equals `messages.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConversationSegment {
    pub id: String,
    pub client: TranscriptClient,
    pub project: String,
    pub started_at: String,
    pub updated_at: String,
    pub offset: u64,
    pub count: u64,
    pub messages: Vec<Value>,
}

pub fn serialize_segment(segment: &ConversationSegment) -> AppResult<Vec<u8>> {
    let value = serde_json::to_value(segment).map_err(|e| {
        AppError::new(
            "MV_CONVERSATION_INVALID",
            "conversation",
            "failed encoding conversation segment",
            false,
            serde_json::json!({ "error": e.to_string(), "session": segment.id }),
        )
    })?;
    to_canonical_bytes(&value)
}

// Strict: unknown fields, unknown clients, and missing fields all reject.
pub fn parse_segment(bytes: &[u8]) -> AppResult<ConversationSegment> {
    serde_json::from_slice(bytes).map_err(|e| {
        AppError::new(
            "MV_CONVERSATION_INVALID",
            "conversation",
            "conversation segment payload has an invalid shape",
            false,
            serde_json::json!({ "error": e.to_string() }),
        )
    })
}

// A decoded segment plus the upload timestamp from its ledger tags; the
// timestamp breaks ties between re-uploads of the same offset.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedSegment {
    pub segment: ConversationSegment,
    pub uploaded_at: i64,
}

// Rebuilds one Conversation per session: segments sorted by (offset asc,
// uploaded_at asc), first seen wins for duplicate offsets, startedAt is the
// minimum and updatedAt the maximum across stitched segments.
pub fn stitch_segments(segments: Vec<TimedSegment>) -> Vec<Conversation> {
    let mut by_session: BTreeMap<String, Vec<TimedSegment>> = BTreeMap::new();
    for timed in segments {
        by_session
            .entry(timed.segment.id.clone())
            .or_default()
            .push(timed);
    }

    let mut out = Vec::new();
    for (session, mut parts) in by_session {
        parts.sort_by(|a, b| {
            (a.segment.offset, a.uploaded_at).cmp(&(b.segment.offset, b.uploaded_at))
        });

        let mut conversation: Option<Conversation> = None;
        let mut last_offset: Option<u64> = None;
        for timed in parts {
            if last_offset == Some(timed.segment.offset) {
                continue;
            }
            last_offset = Some(timed.segment.offset);

            match conversation.as_mut() {
                None => {
                    conversation = Some(Conversation {
                        id: session.clone(),
                        client: timed.segment.client,
                        project: timed.segment.project.clone(),
                        started_at: timed.segment.started_at.clone(),
                        updated_at: timed.segment.updated_at.clone(),
                        messages: timed.segment.messages,
                    });
                }
                Some(existing) => {
                    if timed.segment.started_at < existing.started_at {
                        existing.started_at = timed.segment.started_at.clone();
                    }
                    if timed.segment.updated_at > existing.updated_at {
                        existing.updated_at = timed.segment.updated_at.clone();
                    }
                    existing.messages.extend(timed.segment.messages);
                }
            }
        }
        if let Some(conversation) = conversation {
            out.push(conversation);
        }
    }
    out
}
