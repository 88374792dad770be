//! Text commands intercepted before the turn pipeline.
//!
//! `/help`, `/reset`, `/think [on|off]`. Anything else, including unknown
//! slash commands, goes to the model.

use tracing::{info, warn};

use kestrel_core::config::PipelineConfig;
use kestrel_core::SessionId;
use kestrel_sessions::SessionStore;

/// Handle a text command for `session`.
///
/// Returns `Some(reply)` if the message was a recognized command,
/// `None` if it should be forwarded to the pipeline.
pub fn handle_text_command(
    message: &str,
    session: &SessionId,
    store: &dyn SessionStore,
    config: &PipelineConfig,
) -> Option<String> {
    let trimmed = message.trim();
    let (command, arg) = match trimmed.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (trimmed, ""),
    };

    match command.to_ascii_lowercase().as_str() {
        "/help" => Some(help_text()),
        "/reset" => Some(reset(session, store)),
        "/think" => Some(think(arg, session, store, config)),
        _ => None,
    }
}

fn help_text() -> String {
    "**Commands**\n\
     - `/help`: show this help\n\
     - `/reset`: forget this conversation\n\
     - `/think`: show reasoning mode\n\
     - `/think on|off`: route replies to the deep-thinking model"
        .to_string()
}

fn reset(session: &SessionId, store: &dyn SessionStore) -> String {
    let cleared = match store.load(session) {
        Ok(Some(mut log)) => {
            log.clear_history();
            store.save(session, &log)
        }
        Ok(None) => Ok(()),
        Err(e) => Err(e),
    };
    match cleared {
        Ok(()) => {
            info!(session = %session, "conversation reset via /reset");
            "Conversation cleared. Starting fresh.".to_string()
        }
        Err(e) => {
            warn!(error = %e, session = %session, "reset failed");
            "Could not clear the conversation, please try again.".to_string()
        }
    }
}

fn think(arg: &str, session: &SessionId, store: &dyn SessionStore, config: &PipelineConfig) -> String {
    let mut settings = match store.load_settings(session) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, session = %session, "settings load failed");
            return "Could not read session settings, please try again.".to_string();
        }
    };

    let enable = match arg.to_ascii_lowercase().as_str() {
        "" => {
            let state = if settings.reasoning_mode { "on" } else { "off" };
            return format!(
                "Reasoning mode is **{state}** (model: `{}`). Use `/think on` or `/think off`.",
                config.completion_model(settings.reasoning_mode)
            );
        }
        "on" | "true" | "1" => true,
        "off" | "false" | "0" => false,
        other => return format!("Unknown option `{other}`. Use `/think on` or `/think off`."),
    };

    settings.reasoning_mode = enable;
    if let Err(e) = store.save_settings(session, &settings) {
        warn!(error = %e, session = %session, "settings save failed");
        return "Could not update session settings, please try again.".to_string();
    }
    info!(session = %session, reasoning_mode = enable, "reasoning mode changed");
    format!(
        "Reasoning mode **{}**. Replies now use `{}`.",
        if enable { "on" } else { "off" },
        config.completion_model(enable)
    )
}
