//! Incremental `<think>...</think>` scanner.
//!
//! Two states (visible / reasoning). Each fragment is scanned once; a marker
//! split across fragments is held back until the next fragment decides it.

pub const OPEN_MARKER: &str = "<think>";
pub const CLOSE_MARKER: &str = "</think>";

/// One classified piece of model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Visible(String),
    Reasoning(String),
    /// A reasoning span starts.
    Open,
    /// The current reasoning span ends.
    Close,
}

#[derive(Debug, Default)]
pub struct ReasoningScanner {
    in_reasoning: bool,
    /// Tail of the previous fragment that may be the start of a marker.
    pending: String,
}

impl ReasoningScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_reasoning(&self) -> bool {
        self.in_reasoning
    }

    /// Classify `fragment`, returning segments in stream order.
    pub fn feed(&mut self, fragment: &str) -> Vec<Segment> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.push_str(fragment);

        let mut out = Vec::new();
        let mut rest = buf.as_str();
        loop {
            let marker = self.marker();
            if let Some(pos) = rest.find(marker) {
                self.emit(&rest[..pos], &mut out);
                self.in_reasoning = !self.in_reasoning;
                out.push(if self.in_reasoning {
                    Segment::Open
                } else {
                    Segment::Close
                });
                rest = &rest[pos + marker.len()..];
            } else {
                let keep = partial_marker_len(rest, marker);
                let (emit, hold) = rest.split_at(rest.len() - keep);
                self.emit(emit, &mut out);
                self.pending = hold.to_string();
                break;
            }
        }
        out
    }

    /// Flush any held-back text at end of stream.
    pub fn finish(&mut self) -> Vec<Segment> {
        let pending = std::mem::take(&mut self.pending);
        let mut out = Vec::new();
        self.emit(&pending, &mut out);
        out
    }

    fn marker(&self) -> &'static str {
        if self.in_reasoning {
            CLOSE_MARKER
        } else {
            OPEN_MARKER
        }
    }

    fn emit(&self, text: &str, out: &mut Vec<Segment>) {
        if text.is_empty() {
            return;
        }
        out.push(if self.in_reasoning {
            Segment::Reasoning(text.to_string())
        } else {
            Segment::Visible(text.to_string())
        });
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`.
fn partial_marker_len(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|&k| text.ends_with(&marker[..k]))
        .unwrap_or(0)
}
