//! Turn pipeline: shared by every channel adapter.
//!
//! `handle_turn` runs one exchange:
//! load log → system prompt → compact or append → augment → stream render →
//! persist → follow-ups. The caller only supplies a [`ChatDelivery`] and a
//! cancellation token.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use kestrel_core::config::PipelineConfig;
use kestrel_core::{ConversationLog, SessionId, SessionSettings, Turn};
use kestrel_sessions::SessionStore;

use crate::image::{HttpProbe, ImageProvider, UrlProbe};
use crate::provider::{ChatRequest, LlmProvider};
use crate::search::SearchProvider;

use super::augment::{AugmentationReport, AugmentationRouter, ImageOutcome};
use super::budget::{would_exceed, TokenBudget};
use super::classify::{classify_failure, ErrorKind};
use super::compact::{CompactionOutcome, HistoryCompactor};
use super::delivery::ChatDelivery;
use super::followup::{FollowUpPredictor, FOLLOW_UP_COUNT};
use super::render::{RenderConfig, RenderOutcome, RenderedReply, StreamFailure, StreamRenderer};
use super::slash::handle_text_command;

/// A completed exchange.
#[derive(Debug)]
pub struct TurnSummary {
    pub reply: RenderedReply,
    pub augmentation: AugmentationReport,
    /// Set when the log had to be compacted before the completion call.
    pub compaction: Option<CompactionOutcome>,
    pub follow_ups: [String; FOLLOW_UP_COUNT],
}

/// A failed exchange. Nothing partial was persisted.
#[derive(Debug)]
pub struct TurnFailure {
    pub kind: ErrorKind,
    /// Completion model in use, shown to operators next to the message.
    pub model: String,
    pub failure: StreamFailure,
}

#[derive(Debug)]
pub enum TurnOutcome {
    Done(TurnSummary),
    Failed(TurnFailure),
}

/// One async lock per active session. Entries are dropped once nobody
/// holds or waits on them.
#[derive(Default)]
struct SessionLocks {
    inner: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl SessionLocks {
    async fn acquire(&self, session: &SessionId) -> OwnedMutexGuard<()> {
        let lock = self.inner.entry(session.clone()).or_default().clone();
        lock.lock_owned().await
    }

    fn release(&self, session: &SessionId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.inner
            .remove_if(session, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct TurnPipeline {
    config: PipelineConfig,
    llm: Arc<dyn LlmProvider>,
    search: Option<Arc<dyn SearchProvider>>,
    search_max_results: usize,
    images: Option<Arc<dyn ImageProvider>>,
    probe: Arc<dyn UrlProbe>,
    store: Arc<dyn SessionStore>,
    renderer: StreamRenderer,
    locks: SessionLocks,
}

impl TurnPipeline {
    pub fn new(
        config: PipelineConfig,
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let renderer = StreamRenderer::new(RenderConfig::from_pipeline(&config));
        Self {
            config,
            llm,
            search: None,
            search_max_results: 5,
            images: None,
            probe: Arc::new(HttpProbe::new()),
            store,
            renderer,
            locks: SessionLocks::default(),
        }
    }

    pub fn with_search(mut self, search: Arc<dyn SearchProvider>, max_results: usize) -> Self {
        self.search = Some(search);
        self.search_max_results = max_results;
        self
    }

    pub fn with_images(mut self, images: Arc<dyn ImageProvider>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn UrlProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replace the render settings (placeholder text, intervals).
    pub fn with_render_config(mut self, render: RenderConfig) -> Self {
        self.renderer = StreamRenderer::new(render);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run a text command against `session`, serialized with its turns.
    ///
    /// Returns `None` when `message` is not a recognized command.
    pub async fn handle_command(&self, session: &SessionId, message: &str) -> Option<String> {
        let guard = self.locks.acquire(session).await;
        let reply = handle_text_command(message, session, self.store.as_ref(), &self.config);
        self.locks.release(session, guard);
        reply
    }

    /// Handle one inbound turn for `session`, publishing through `delivery`.
    ///
    /// Turns for the same session run one at a time, from log load to save.
    /// The caller must not invoke this twice for the same inbound event.
    pub async fn handle_turn(
        &self,
        session: &SessionId,
        inbound: Turn,
        delivery: &dyn ChatDelivery,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let turn_id = Uuid::now_v7();
        let span = info_span!("turn", %turn_id, session = %session);
        self.run_turn(session, inbound, delivery, &cancel)
            .instrument(span)
            .await
    }

    async fn run_turn(
        &self,
        session: &SessionId,
        inbound: Turn,
        delivery: &dyn ChatDelivery,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let guard = self.locks.acquire(session).await;
        let mut log = self.load_log(session);
        let settings = self.store.load_settings(session).unwrap_or_else(|e| {
            warn!(error = %e, "settings load failed, using defaults");
            SessionSettings::default()
        });
        log.set_system(self.config.system_prompt.clone());

        let user_text = inbound.content.plain_text();

        let compaction = if would_exceed(&log, &inbound, self.config.max_context_tokens) {
            let compactor = HistoryCompactor::new(self.llm.as_ref(), &self.config);
            let (compacted, outcome) = compactor.compact(&log, inbound).await;
            log = compacted;
            Some(outcome)
        } else {
            log.push(inbound);
            None
        };

        let augmentation = self.router().augment(&mut log).await;
        match &augmentation.image {
            ImageOutcome::Generated { url, .. } => {
                if let Err(e) = delivery.send(url).await {
                    warn!(error = %e, "failed to deliver generated image");
                }
            }
            ImageOutcome::Failed { .. } => {
                if let Err(e) = delivery
                    .send("⚠️ Image generation failed, answering without it.")
                    .await
                {
                    warn!(error = %e, "failed to deliver image failure notice");
                }
            }
            ImageOutcome::NotNeeded => {}
        }

        let model = self
            .config
            .completion_model(settings.reasoning_mode)
            .to_string();
        let req = ChatRequest::new(model.clone(), log.turns().to_vec())
            .with_max_tokens(self.config.completion_max_tokens);

        let budget = TokenBudget::measure(&log, self.config.max_context_tokens);
        info!(
            model = %model,
            turns = log.len(),
            tokens = budget.current_tokens,
            tokens_remaining = budget.remaining(),
            compacted = compaction.is_some(),
            search_results = augmentation.search_results,
            "turn: starting completion"
        );

        match self.renderer.run(self.llm.as_ref(), &req, delivery, cancel).await {
            RenderOutcome::Done(reply) => {
                if !reply.final_text.is_empty() {
                    log.push(Turn::assistant(reply.final_text.clone()));
                }
                self.save_log(session, &log);
                self.locks.release(session, guard);

                let follow_ups = self.follow_ups(&user_text, &reply, delivery).await;

                TurnOutcome::Done(TurnSummary {
                    reply,
                    augmentation,
                    compaction,
                    follow_ups,
                })
            }
            RenderOutcome::Failed(failure) => {
                let kind = classify_failure(&failure);
                if matches!(failure, StreamFailure::Cancelled) {
                    info!("turn cancelled, discarding");
                } else {
                    warn!(error = %failure, kind = %kind, model = %model, "turn failed");
                    let notice = format!("⚠️ {} (`{}`)", kind.user_message(), model);
                    if let Err(e) = delivery.send(&notice).await {
                        warn!(error = %e, "failed to deliver error notice");
                    }
                    self.save_log(session, &log);
                }
                self.locks.release(session, guard);
                TurnOutcome::Failed(TurnFailure {
                    kind,
                    model,
                    failure,
                })
            }
        }
    }

    fn router(&self) -> AugmentationRouter<'_> {
        let mut router =
            AugmentationRouter::new(self.llm.as_ref(), self.probe.as_ref(), &self.config);
        if let Some(search) = &self.search {
            router = router.with_search(search.as_ref(), self.search_max_results);
        }
        if let Some(images) = &self.images {
            router = router.with_images(images.as_ref());
        }
        router
    }

    fn load_log(&self, session: &SessionId) -> ConversationLog {
        match self.store.load(session) {
            Ok(Some(log)) => log,
            Ok(None) => ConversationLog::new(),
            Err(e) => {
                warn!(error = %e, "conversation load failed, starting fresh");
                ConversationLog::new()
            }
        }
    }

    fn save_log(&self, session: &SessionId, log: &ConversationLog) {
        if let Err(e) = self.store.save(session, log) {
            warn!(error = %e, "conversation save failed");
        }
    }

    async fn follow_ups(
        &self,
        user_text: &str,
        reply: &RenderedReply,
        delivery: &dyn ChatDelivery,
    ) -> [String; FOLLOW_UP_COUNT] {
        if !self.config.follow_ups_enabled || reply.final_text.is_empty() {
            return Default::default();
        }

        let questions = FollowUpPredictor::new(self.llm.as_ref(), &self.config)
            .predict(user_text, &reply.final_text)
            .await;

        let offered: Vec<String> = questions.iter().filter(|q| !q.is_empty()).cloned().collect();
        if offered.is_empty() {
            return questions;
        }
        if let Some(last) = reply.messages.last() {
            if let Err(e) = delivery.attach_follow_ups(last, &offered).await {
                warn!(error = %e, "failed to attach follow-ups");
            }
        }
        questions
    }
}
