//! Conversational turn pipeline: one inbound message in, a rendered reply out.
//!
//! Channel adapters call [`TurnPipeline::handle_turn`] with a session id, the
//! inbound turn and a [`ChatDelivery`] for the channel. Everything between
//! (budgeting, compaction, augmentation, streaming render, follow-ups, error
//! mapping) lives here, once.

pub mod augment;
pub mod budget;
pub mod classify;
pub mod compact;
pub mod delivery;
pub mod followup;
pub mod process;
pub mod reasoning;
pub mod render;
pub mod slash;
pub mod split;
pub mod structured;

pub use augment::{AugmentationDecision, AugmentationReport, AugmentationRouter, ImageOutcome};
pub use budget::TokenBudget;
pub use classify::{classify, classify_failure, ErrorKind};
pub use compact::{CompactionOutcome, HistoryCompactor};
pub use delivery::{ChatDelivery, DeliveryError, MessageHandle};
pub use followup::FollowUpPredictor;
pub use process::{TurnFailure, TurnOutcome, TurnPipeline, TurnSummary};
pub use render::{RenderConfig, RenderOutcome, RenderedReply, StreamFailure, StreamRenderer};
pub use slash::handle_text_command;
pub use split::{smart_split, split_message};
