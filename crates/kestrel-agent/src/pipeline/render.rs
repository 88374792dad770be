//! Streaming renderer: the state machine that turns a model stream into
//! one or more length-bounded chat messages.
//!
//! One task owns [`RenderState`]; fragments arrive over a bounded channel and
//! the flush timer is just another `select!` arm, so timer flushes and
//! ceiling splits never interleave.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use kestrel_core::config::PipelineConfig;

use crate::provider::{ChatRequest, LlmProvider, ProviderError};
use crate::stream::StreamEvent;

use super::delivery::{ChatDelivery, DeliveryError, MessageHandle};
use super::reasoning::{ReasoningScanner, Segment};
use super::split::{inside_fence, split_point};

/// Fragments buffered between the provider task and the renderer.
const CHANNEL_CAPACITY: usize = 64;

pub const PLACEHOLDER: &str = "⏳ Thinking…";

/// Shown when the model finished without any visible output.
pub const EMPTY_REPLY: &str = "_(empty response)_";

/// Prefix applied to every line of a reasoning span.
const QUOTE: &str = "> ";

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub flush_interval: Duration,
    /// Per-message ceiling, in characters.
    pub max_message_length: usize,
    pub split_lookahead: usize,
    /// Longest gap tolerated between two stream events.
    pub idle_timeout: Duration,
    pub placeholder: String,
}

impl RenderConfig {
    pub fn from_pipeline(cfg: &PipelineConfig) -> Self {
        Self {
            flush_interval: cfg.flush_interval(),
            max_message_length: cfg.max_message_length.max(1),
            split_lookahead: cfg.split_lookahead,
            idle_timeout: cfg.completion_idle_timeout(),
            placeholder: PLACEHOLDER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPhase {
    Idle,
    Opening,
    Streaming,
    Flushing,
    Done,
    Failed,
}

/// A completed render.
#[derive(Debug, Clone)]
pub struct RenderedReply {
    /// Visible reply text without reasoning spans; what goes into history.
    pub final_text: String,
    /// Output messages in publish order.
    pub messages: Vec<MessageHandle>,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamFailure {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("render cancelled")]
    Cancelled,
}

#[derive(Debug)]
pub enum RenderOutcome {
    Done(RenderedReply),
    Failed(StreamFailure),
}

/// Per-invocation render state. Never outlives one [`StreamRenderer::run`].
struct RenderState<'a> {
    config: &'a RenderConfig,
    phase: RenderPhase,
    /// Content of the current output message.
    visible_buffer: String,
    buffer_chars: usize,
    reasoning_active: bool,
    last_flush_at: Instant,
    output_messages: Vec<MessageHandle>,
    /// Visible text across all messages, reasoning excluded.
    final_text: String,
    /// Last content accepted for the current message.
    published: String,
    /// Current message starts inside a code fence opened by an earlier one.
    fence_open: bool,
    /// A split already ran past the ceiling to finish a code line.
    overshot: bool,
    scanner: ReasoningScanner,
    at_line_start: bool,
    trim_leading: bool,
    /// Reasoning span opened by `StreamEvent::Thinking` rather than a marker.
    native_reasoning: bool,
    /// The current message is finalised; the next publish opens a new one.
    needs_new_message: bool,
}

impl<'a> RenderState<'a> {
    fn new(config: &'a RenderConfig) -> Self {
        Self {
            config,
            phase: RenderPhase::Idle,
            visible_buffer: String::new(),
            buffer_chars: 0,
            reasoning_active: false,
            last_flush_at: Instant::now(),
            output_messages: Vec::new(),
            final_text: String::new(),
            published: String::new(),
            fence_open: false,
            overshot: false,
            scanner: ReasoningScanner::new(),
            at_line_start: true,
            trim_leading: true,
            native_reasoning: false,
            needs_new_message: false,
        }
    }

    fn set_phase(&mut self, phase: RenderPhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "render phase");
            self.phase = phase;
        }
    }

    fn on_text(&mut self, text: &str) {
        if self.native_reasoning {
            self.native_reasoning = false;
            self.apply(Segment::Close);
        }
        for segment in self.scanner.feed(text) {
            self.apply(segment);
        }
    }

    fn on_thinking(&mut self, text: String) {
        if !self.reasoning_active {
            self.native_reasoning = true;
            self.apply(Segment::Open);
        }
        self.apply(Segment::Reasoning(text));
    }

    fn apply(&mut self, segment: Segment) {
        match segment {
            Segment::Visible(text) => {
                let text = if self.trim_leading {
                    text.trim_start()
                } else {
                    text.as_str()
                };
                if text.is_empty() {
                    return;
                }
                self.trim_leading = false;
                self.push_visible(text);
                self.final_text.push_str(text);
                self.at_line_start = text.ends_with('\n');
            }
            Segment::Reasoning(text) => {
                let quoted = quote_lines(&text, &mut self.at_line_start);
                self.push_visible(&quoted);
            }
            Segment::Open => {
                self.reasoning_active = true;
                if !self.visible_buffer.is_empty() && !self.visible_buffer.ends_with('\n') {
                    self.push_visible("\n");
                }
                self.at_line_start = true;
            }
            Segment::Close => {
                self.reasoning_active = false;
                if !self.visible_buffer.is_empty() {
                    if !self.visible_buffer.ends_with('\n') {
                        self.push_visible("\n");
                    }
                    self.push_visible("\n");
                }
                self.at_line_start = true;
                self.trim_leading = true;
            }
        }
    }

    fn push_visible(&mut self, text: &str) {
        self.visible_buffer.push_str(text);
        self.buffer_chars += text.chars().count();
    }

    fn is_dirty(&self) -> bool {
        !self.visible_buffer.is_empty() && self.visible_buffer != self.published
    }

    /// Push `content` to the current message, opening one if needed.
    async fn publish(
        &mut self,
        delivery: &dyn ChatDelivery,
        content: String,
    ) -> Result<(), DeliveryError> {
        let resume = self.phase;
        self.set_phase(RenderPhase::Flushing);

        if self.needs_new_message || self.output_messages.is_empty() {
            let handle = delivery.send(&content).await?;
            debug!(handle = %handle.as_str(), index = self.output_messages.len(), "render: opened message");
            self.output_messages.push(handle);
            self.needs_new_message = false;
        } else if content != self.published {
            if let Some(handle) = self.output_messages.last() {
                delivery.edit(handle, &content).await?;
            }
        }

        self.published = content;
        self.last_flush_at = Instant::now();
        self.set_phase(resume);
        Ok(())
    }

    async fn flush(&mut self, delivery: &dyn ChatDelivery) -> Result<(), DeliveryError> {
        if self.is_dirty() {
            let content = self.visible_buffer.clone();
            self.publish(delivery, content).await?;
        }
        Ok(())
    }

    /// Split the buffer while it is over the ceiling: finalise the current
    /// message with the head and open the next one with the remainder.
    async fn enforce_ceiling(&mut self, delivery: &dyn ChatDelivery) -> Result<(), DeliveryError> {
        let max = self.config.max_message_length;
        while self.buffer_chars > max {
            let lookahead = if self.overshot {
                0
            } else {
                self.config.split_lookahead
            };
            let cut = split_point(&self.visible_buffer, max, lookahead, self.fence_open);
            let rest = self.visible_buffer.split_off(cut);
            let head = std::mem::replace(&mut self.visible_buffer, rest);
            self.buffer_chars = self.visible_buffer.chars().count();
            self.fence_open ^= inside_fence(&head);
            self.overshot |= head.chars().count() > max;

            debug!(head_chars = head.chars().count(), rest_chars = self.buffer_chars, "render: splitting message");
            self.publish(delivery, head).await?;
            self.needs_new_message = true;
            self.published.clear();

            if !self.visible_buffer.is_empty() && self.buffer_chars <= max {
                let first = self.visible_buffer.clone();
                self.publish(delivery, first).await?;
            }
        }
        Ok(())
    }

    /// Drain the scanner and publish whatever is left, unconditionally.
    async fn finish(&mut self, delivery: &dyn ChatDelivery) -> Result<(), DeliveryError> {
        for segment in self.scanner.finish() {
            self.apply(segment);
        }
        self.native_reasoning = false;
        self.reasoning_active = false;

        let trimmed = self.visible_buffer.trim_end().len();
        self.visible_buffer.truncate(trimmed);
        self.buffer_chars = self.visible_buffer.chars().count();

        self.enforce_ceiling(delivery).await?;

        if !self.visible_buffer.is_empty() {
            let content = self.visible_buffer.clone();
            self.publish(delivery, content).await?;
        } else if self.output_messages.len() == 1 && self.published == self.config.placeholder {
            self.publish(delivery, EMPTY_REPLY.to_string()).await?;
        }
        Ok(())
    }
}

/// Prefix each line of `text` with the quote marker, tracking line starts
/// across calls.
fn quote_lines(text: &str, at_line_start: &mut bool) -> String {
    let mut out = String::with_capacity(text.len() + QUOTE.len());
    for c in text.chars() {
        if *at_line_start {
            out.push_str(QUOTE);
        }
        out.push(c);
        *at_line_start = c == '\n';
    }
    out
}

pub struct StreamRenderer {
    config: RenderConfig,
}

impl StreamRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Stream `req` from `llm` into `delivery`.
    ///
    /// On failure, messages already published stay as they are; the caller
    /// decides what to tell the user.
    pub async fn run(
        &self,
        llm: &dyn LlmProvider,
        req: &ChatRequest,
        delivery: &dyn ChatDelivery,
        cancel: &CancellationToken,
    ) -> RenderOutcome {
        let mut state = RenderState::new(&self.config);
        match self.drive(&mut state, llm, req, delivery, cancel).await {
            Ok(reply) => {
                state.set_phase(RenderPhase::Done);
                info!(
                    model = %reply.model,
                    messages = reply.messages.len(),
                    chars = reply.final_text.chars().count(),
                    tokens_in = reply.tokens_in,
                    tokens_out = reply.tokens_out,
                    "render complete"
                );
                RenderOutcome::Done(reply)
            }
            Err(failure) => {
                state.set_phase(RenderPhase::Failed);
                debug!(error = %failure, messages = state.output_messages.len(), "render failed");
                RenderOutcome::Failed(failure)
            }
        }
    }

    async fn drive(
        &self,
        state: &mut RenderState<'_>,
        llm: &dyn LlmProvider,
        req: &ChatRequest,
        delivery: &dyn ChatDelivery,
        cancel: &CancellationToken,
    ) -> Result<RenderedReply, StreamFailure> {
        if cancel.is_cancelled() {
            return Err(StreamFailure::Cancelled);
        }

        state.set_phase(RenderPhase::Opening);
        state
            .publish(delivery, self.config.placeholder.clone())
            .await?;
        state.set_phase(RenderPhase::Streaming);

        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let producer = llm.send_stream(req, tx);
        tokio::pin!(producer);
        let mut producer_done = false;

        let idle = self.config.idle_timeout;
        let mut idle_deadline = Instant::now() + idle;

        let mut model = req.model.clone();
        let mut tokens_in = 0;
        let mut tokens_out = 0;

        loop {
            let flush_at = state.last_flush_at + self.config.flush_interval;
            let dirty = state.is_dirty();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(StreamFailure::Cancelled),

                result = &mut producer, if !producer_done => {
                    producer_done = true;
                    result?;
                }

                event = rx.recv() => {
                    idle_deadline = Instant::now() + idle;
                    match event {
                        Some(StreamEvent::TextDelta { text }) => {
                            state.on_text(&text);
                            state.enforce_ceiling(delivery).await?;
                        }
                        Some(StreamEvent::Thinking { text }) => {
                            state.on_thinking(text);
                            state.enforce_ceiling(delivery).await?;
                        }
                        Some(StreamEvent::Done { model: m, tokens_in: i, tokens_out: o, .. }) => {
                            model = m;
                            tokens_in = i;
                            tokens_out = o;
                            break;
                        }
                        Some(StreamEvent::Error { message }) => {
                            return Err(ProviderError::Unavailable(message).into());
                        }
                        None => break,
                    }
                }

                _ = sleep_until(flush_at), if dirty => {
                    state.flush(delivery).await?;
                }

                _ = sleep_until(idle_deadline) => {
                    return Err(ProviderError::Timeout { ms: idle.as_millis() as u64 }.into());
                }
            }
        }

        state.finish(delivery).await?;

        Ok(RenderedReply {
            final_text: state.final_text.trim().to_string(),
            messages: state.output_messages.clone(),
            model,
            tokens_in,
            tokens_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatResponse;
    use async_trait::async_trait;
    use kestrel_core::Turn;
    use std::sync::Mutex;

    struct ScriptedStream {
        events: Vec<StreamEvent>,
        hang: bool,
    }

    impl ScriptedStream {
        fn text(parts: &[&str]) -> Self {
            let mut events: Vec<StreamEvent> = parts
                .iter()
                .map(|p| StreamEvent::TextDelta {
                    text: p.to_string(),
                })
                .collect();
            events.push(StreamEvent::Done {
                model: "test-model".into(),
                tokens_in: 3,
                tokens_out: 2,
                stop_reason: "stop".into(),
            });
            Self {
                events,
                hang: false,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedStream {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Err(ProviderError::Unavailable("stream only".into()))
        }

        async fn send_stream(
            &self,
            _req: &ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), ProviderError> {
            for event in self.events.clone() {
                let _ = tx.send(event).await;
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Board {
        messages: Mutex<Vec<String>>,
    }

    impl Board {
        fn contents(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatDelivery for Board {
        async fn send(&self, content: &str) -> Result<MessageHandle, DeliveryError> {
            let mut messages = self.messages.lock().unwrap();
            messages.push(content.to_string());
            Ok(MessageHandle::new((messages.len() - 1).to_string()))
        }

        async fn edit(&self, handle: &MessageHandle, content: &str) -> Result<(), DeliveryError> {
            let idx: usize = handle.as_str().parse().unwrap();
            let mut messages = self.messages.lock().unwrap();
            let slot = messages
                .get_mut(idx)
                .ok_or_else(|| DeliveryError::NotFound(handle.0.clone()))?;
            *slot = content.to_string();
            Ok(())
        }
    }

    fn config(max: usize) -> RenderConfig {
        RenderConfig {
            flush_interval: Duration::from_millis(5),
            max_message_length: max,
            split_lookahead: 40,
            idle_timeout: Duration::from_millis(500),
            placeholder: PLACEHOLDER.to_string(),
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new("test-model", vec![Turn::user("hello")])
    }

    async fn render(llm: &ScriptedStream, board: &Board, max: usize) -> RenderOutcome {
        StreamRenderer::new(config(max))
            .run(llm, &request(), board, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn two_fragments_one_message() {
        let llm = ScriptedStream::text(&["Hi ", "there"]);
        let board = Board::default();
        let RenderOutcome::Done(reply) = render(&llm, &board, 100).await else {
            panic!("render failed");
        };
        assert_eq!(board.contents(), vec!["Hi there".to_string()]);
        assert_eq!(reply.final_text, "Hi there");
        assert_eq!(reply.messages.len(), 1);
        assert_eq!(reply.tokens_in, 3);
    }

    #[tokio::test]
    async fn reasoning_is_quoted_but_not_kept() {
        let llm = ScriptedStream::text(&["<think>reasoning</think>answer"]);
        let board = Board::default();
        let RenderOutcome::Done(reply) = render(&llm, &board, 100).await else {
            panic!("render failed");
        };
        assert_eq!(board.contents(), vec!["> reasoning\n\nanswer".to_string()]);
        assert_eq!(reply.final_text, "answer");
    }

    #[tokio::test]
    async fn native_thinking_events_render_as_quote() {
        let llm = ScriptedStream {
            events: vec![
                StreamEvent::Thinking {
                    text: "step one\nstep two".into(),
                },
                StreamEvent::TextDelta {
                    text: "\nresult".into(),
                },
            ],
            hang: false,
        };
        let board = Board::default();
        let RenderOutcome::Done(reply) = render(&llm, &board, 100).await else {
            panic!("render failed");
        };
        assert_eq!(
            board.contents(),
            vec!["> step one\n> step two\n\nresult".to_string()]
        );
        assert_eq!(reply.final_text, "result");
        assert_eq!(reply.model, "test-model");
    }

    #[tokio::test]
    async fn long_prose_splits_into_bounded_messages() {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let fragments: Vec<String> = (0..30).map(|_| sentence.to_string()).collect();
        let refs: Vec<&str> = fragments.iter().map(String::as_str).collect();
        let llm = ScriptedStream::text(&refs);
        let board = Board::default();
        let RenderOutcome::Done(reply) = render(&llm, &board, 200).await else {
            panic!("render failed");
        };

        let contents = board.contents();
        assert!(contents.len() > 1);
        assert_eq!(reply.messages.len(), contents.len());
        assert!(contents.iter().all(|c| c.chars().count() <= 200));
        assert_eq!(contents.concat().trim_end(), sentence.repeat(30).trim_end());
        assert_eq!(reply.final_text, sentence.repeat(30).trim());
    }

    #[tokio::test]
    async fn long_code_block_overshoots_the_ceiling_once() {
        let mut fragments = vec!["Here you go:\n```rust\n".to_string()];
        for i in 0..40 {
            fragments.push(format!("let value_{i:02} = compute_something({i}, {i});\n"));
        }
        fragments.push("```".to_string());
        let refs: Vec<&str> = fragments.iter().map(String::as_str).collect();
        let llm = ScriptedStream::text(&refs);
        let board = Board::default();
        let mut cfg = config(200);
        cfg.split_lookahead = 80;
        let outcome = StreamRenderer::new(cfg)
            .run(&llm, &request(), &board, &CancellationToken::new())
            .await;
        let RenderOutcome::Done(reply) = outcome else {
            panic!("render failed");
        };

        let contents = board.contents();
        let oversized: Vec<usize> = contents
            .iter()
            .map(|c| c.chars().count())
            .filter(|&n| n > 200)
            .collect();
        assert!(contents.len() > 4);
        assert!(oversized.len() <= 1, "oversized: {oversized:?}");
        assert_eq!(reply.final_text, fragments.concat().trim());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_are_throttled() {
        struct Trickle;

        #[async_trait]
        impl LlmProvider for Trickle {
            fn name(&self) -> &str {
                "trickle"
            }

            async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
                Err(ProviderError::Unavailable("stream only".into()))
            }

            async fn send_stream(
                &self,
                _req: &ChatRequest,
                tx: mpsc::Sender<StreamEvent>,
            ) -> Result<(), ProviderError> {
                for i in 0..50 {
                    let _ = tx.send(StreamEvent::TextDelta { text: format!("w{i} ") }).await;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                let _ = tx
                    .send(StreamEvent::Done {
                        model: "test-model".into(),
                        tokens_in: 1,
                        tokens_out: 50,
                        stop_reason: "stop".into(),
                    })
                    .await;
                Ok(())
            }
        }

        #[derive(Default)]
        struct EditCounter {
            sends: Mutex<usize>,
            edits: Mutex<Vec<Instant>>,
        }

        #[async_trait]
        impl ChatDelivery for EditCounter {
            async fn send(&self, _content: &str) -> Result<MessageHandle, DeliveryError> {
                *self.sends.lock().unwrap() += 1;
                Ok(MessageHandle::new("0"))
            }

            async fn edit(&self, _handle: &MessageHandle, _content: &str) -> Result<(), DeliveryError> {
                self.edits.lock().unwrap().push(Instant::now());
                Ok(())
            }
        }

        let board = EditCounter::default();
        let mut cfg = config(10_000);
        cfg.flush_interval = Duration::from_millis(100);
        cfg.idle_timeout = Duration::from_secs(5);
        let outcome = StreamRenderer::new(cfg)
            .run(&Trickle, &request(), &board, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, RenderOutcome::Done(_)));

        let edits = board.edits.lock().unwrap().clone();
        assert_eq!(*board.sends.lock().unwrap(), 1);
        // 50 fragments over ~500ms: a handful of timer edits plus the final one.
        assert!(edits.len() >= 3, "edits: {}", edits.len());
        assert!(edits.len() <= 7, "edits: {}", edits.len());
        let timer_edits = &edits[..edits.len() - 1];
        for pair in timer_edits.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn error_event_fails_and_keeps_partial_output() {
        let llm = ScriptedStream {
            events: vec![
                StreamEvent::TextDelta {
                    text: "partial".into(),
                },
                StreamEvent::Error {
                    message: "connection reset".into(),
                },
            ],
            hang: false,
        };
        let board = Board::default();
        let outcome = render(&llm, &board, 100).await;
        assert!(matches!(
            outcome,
            RenderOutcome::Failed(StreamFailure::Provider(ProviderError::Unavailable(_)))
        ));
        assert_eq!(board.contents().len(), 1);
    }

    #[tokio::test]
    async fn silent_stream_times_out() {
        let llm = ScriptedStream {
            events: vec![],
            hang: true,
        };
        let board = Board::default();
        let mut cfg = config(100);
        cfg.idle_timeout = Duration::from_millis(30);
        let outcome = StreamRenderer::new(cfg)
            .run(&llm, &request(), &board, &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            RenderOutcome::Failed(StreamFailure::Provider(ProviderError::Timeout { ms: 30 }))
        ));
        assert_eq!(board.contents(), vec![PLACEHOLDER.to_string()]);
    }

    #[tokio::test]
    async fn cancellation_stops_the_render() {
        let llm = ScriptedStream {
            events: vec![StreamEvent::TextDelta {
                text: "half an ans".into(),
            }],
            hang: true,
        };
        let board = Board::default();
        let cancel = CancellationToken::new();
        let renderer = StreamRenderer::new(config(100));
        let req = request();
        let (outcome, _) = tokio::join!(renderer.run(&llm, &req, &board, &cancel), async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            cancel.cancel();
        });
        assert!(matches!(outcome, RenderOutcome::Failed(StreamFailure::Cancelled)));
    }

    #[tokio::test]
    async fn empty_reply_replaces_placeholder() {
        let llm = ScriptedStream::text(&["  "]);
        let board = Board::default();
        let RenderOutcome::Done(reply) = render(&llm, &board, 100).await else {
            panic!("render failed");
        };
        assert_eq!(board.contents(), vec![EMPTY_REPLY.to_string()]);
        assert!(reply.final_text.is_empty());
    }

    #[test]
    fn quote_tracks_line_starts_across_calls() {
        let mut at_start = true;
        assert_eq!(quote_lines("a\nb", &mut at_start), "> a\n> b");
        assert!(!at_start);
        assert_eq!(quote_lines("c\n", &mut at_start), "c\n");
        assert!(at_start);
    }
}
