//! Typed stream events
//!
//! One decoded frame maps to at most one `StreamEvent`. Malformed frames are
//! logged and dropped here so they never reach the session.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::FrameError;
use crate::stages::StageStatus;

/// Event name used when a frame has no `event:` line
pub const DEFAULT_EVENT_NAME: &str = "message";

/// Authoritative outcome of an analysis, from either the stream or the fallback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub text: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Events the analysis endpoint can send
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A stage moved to a new status
    Stage { stage_id: String, status: StageStatus },

    /// Incremental text for live display
    Chunk { text: String },

    /// Final text; supersedes every chunk received so far
    Complete { result: AnalysisResult },

    /// Server-side failure, passed through verbatim
    Error { message: String },

    /// No more frames will follow
    End,
}

/// Event name and reassembled data of one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub event: String,
    pub data: String,
}

impl RawFrame {
    /// Split a frame block into its event name and data payload
    ///
    /// Multiple `data:` lines are joined with `\n`. Comment lines (`:`) and
    /// other fields (`id:`, `retry:`) are ignored.
    pub fn parse(block: &str) -> Self {
        let mut event: Option<String> = None;
        let mut data_lines: Vec<&str> = Vec::new();

        for line in block.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value.trim().to_string()),
                "data" => data_lines.push(value),
                _ => {}
            }
        }

        Self {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string()),
            data: data_lines.join("\n"),
        }
    }
}

#[derive(Deserialize)]
struct StagePayload {
    #[serde(alias = "stageId")]
    id: String,
    status: StageStatus,
}

#[derive(Deserialize)]
struct ChunkPayload {
    text: String,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(alias = "error")]
    message: String,
}

impl StreamEvent {
    /// Map a frame to an event by name
    ///
    /// Returns `Ok(None)` for event names this consumer does not know.
    pub fn from_frame(frame: &RawFrame) -> Result<Option<Self>, FrameError> {
        // `end` frames may legitimately carry no data at all
        let payload: Value = if frame.data.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&frame.data).map_err(|e| FrameError::MalformedJson {
                event: frame.event.clone(),
                message: e.to_string(),
            })?
        };

        let event = match frame.event.as_str() {
            "stage" => {
                let p: StagePayload = decode_payload(&frame.event, payload)?;
                StreamEvent::Stage {
                    stage_id: p.id,
                    status: p.status,
                }
            }
            "chunk" => {
                let p: ChunkPayload = decode_payload(&frame.event, payload)?;
                StreamEvent::Chunk { text: p.text }
            }
            "complete" => StreamEvent::Complete {
                result: decode_payload(&frame.event, payload)?,
            },
            "error" => {
                let p: ErrorPayload = decode_payload(&frame.event, payload)?;
                StreamEvent::Error { message: p.message }
            }
            "end" => StreamEvent::End,
            _ => return Ok(None),
        };

        Ok(Some(event))
    }
}

fn decode_payload<T: DeserializeOwned>(event: &str, payload: Value) -> Result<T, FrameError> {
    serde_json::from_value(payload).map_err(|e| FrameError::Shape {
        event: event.to_string(),
        message: e.to_string(),
    })
}

/// Frame-to-event parser with drop accounting
#[derive(Debug, Default)]
pub struct EventParser {
    parsed: usize,
    dropped: usize,
    ignored: usize,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one frame block; malformed and unknown frames yield `None`
    pub fn parse(&mut self, block: &str) -> Option<StreamEvent> {
        let frame = RawFrame::parse(block);
        match StreamEvent::from_frame(&frame) {
            Ok(Some(event)) => {
                self.parsed += 1;
                debug!("SSE event #{}: {}", self.parsed, frame.event);
                Some(event)
            }
            Ok(None) => {
                self.ignored += 1;
                debug!("Ignoring unknown SSE event '{}'", frame.event);
                None
            }
            Err(e) => {
                self.dropped += 1;
                warn!("Dropping SSE frame: {}", e);
                None
            }
        }
    }

    pub fn parsed(&self) -> usize {
        self.parsed
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn ignored(&self) -> usize {
        self.ignored
    }
}
