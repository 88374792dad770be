/// Events emitted during LLM streaming response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content from the model.
    TextDelta { text: String },

    /// Reasoning content delivered on a side channel (`reasoning_content`
    /// deltas). Rendered like an inline reasoning span, never persisted.
    Thinking { text: String },

    /// Stream completed successfully.
    Done {
        model: String,
        tokens_in: u32,
        tokens_out: u32,
        stop_reason: String,
    },

    /// Error during streaming.
    Error { message: String },
}

/// Parse a single SSE line.
/// SSE format: `event: <type>\ndata: <json>\n\n`
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// Splits a byte stream into complete SSE lines, carrying partial lines
/// (and partial UTF-8 sequences) across chunk boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, trimmed, blanks dropped.
    ///
    /// Bytes are decoded only once their line is complete, so a multi-byte
    /// character split across chunks survives intact.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        String::from_utf8_lossy(&complete)
            .split('\n')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    }
}
