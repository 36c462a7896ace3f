//! Text protocol used when native tool calling is unavailable.
//!
//! The model is asked for `{"actions": [...]}` JSON, the reply is parsed with the
//! [`parse`](super::parse) strategy chain and the actions are executed like native
//! calls. When the task needs file changes but an attempt produced none, the
//! model gets a bounded number of repair prompts carrying the task, its previous
//! actions, tool errors and clipped observations.

use super::events::LoopEvent;
use super::parse::parse_actions;
use super::prompts;
use super::{AgentRuntime, TaskContext, TaskState, ToolResult};
use crate::error::AgentError;
use tracing::{debug, info};

/// Results kept across repair attempts.
const MAX_KEPT_RESULTS: usize = 48;

pub(super) struct FallbackOutcome {
    pub text: String,
    /// Whether any tool ran or any file change was made or prepared.
    pub has_effect: bool,
}

impl AgentRuntime {
    pub(super) async fn run_fallback(
        &self,
        task: &mut TaskState,
        ctx: &TaskContext,
    ) -> Result<FallbackOutcome, AgentError> {
        let definitions = self.tools.definitions();
        let attempts = self.settings.repair_attempts;
        let mut prompt = prompts::fallback_prompt(&task.message, &task.history, &definitions);
        let mut results: Vec<ToolResult> = Vec::new();
        let mut assistant_text = String::new();

        for attempt in 0..=attempts {
            ctx.check_cancelled()?;
            let chat_id = task.chat_id.clone();
            let sent = self
                .with_login(|| self.llm.send_message(&task.model, &prompt, chat_id.as_deref()))
                .await?;
            if task.chat_id.is_none() {
                task.chat_id = sent.chat_id.clone();
            }
            assistant_text = sent.text;

            let actions = parse_actions(&prompts::strip_reasoning(&assistant_text));
            debug!(attempt, actions = actions.len(), "text protocol reply parsed");
            let mut effect = false;
            for action in &actions {
                ctx.check_cancelled()?;
                let result = self.execute_tool(task, ctx, attempt + 1, &action.tool, Ok(action.args.clone()));
                effect |= result.changed_path().is_some() || result.pending_change().is_some();
                results.push(result);
            }
            let overflow = results.len().saturating_sub(MAX_KEPT_RESULTS);
            results.drain(..overflow);

            if effect || attempt >= attempts || !task.requires_changes {
                break;
            }

            let mut repair = prompts::repair_prompt(&task.message, &task.history, &actions, &results, &definitions);
            let proposed_mutation = actions.iter().any(|a| self.tools.is_mutating(&a.tool));
            if !actions.is_empty() && !proposed_mutation {
                repair.push_str("\n\n");
                repair.push_str(prompts::REPAIR_NUDGE);
            }
            prompt = repair;
            info!(attempt = attempt + 1, "text protocol produced no file changes, sending repair prompt");
            ctx.emit(LoopEvent::status(format!("Fallback repair attempt {}", attempt + 1)));
        }

        let tracker = &task.tracker;
        let mut text = if !tracker.applied_files.is_empty() {
            prompts::file_list("Changes applied (fallback mode):", &tracker.applied_files)
        } else if !results.is_empty() {
            prompts::summarize_tool_results(&results)
        } else {
            let reply = prompts::strip_reasoning(&assistant_text);
            format!("{reply}\n\n{}", prompts::FALLBACK_NOTE)
        };
        if task.requires_changes && !tracker.has_changes() {
            text.push_str("\n\n");
            text.push_str(prompts::FALLBACK_UNMET_CHANGES_WARNING);
        }
        if !tracker.pending.is_empty() {
            text.push_str("\n\n");
            text.push_str(&prompts::summarize_pending(&tracker.pending));
        }

        Ok(FallbackOutcome {
            text,
            has_effect: !results.is_empty() || tracker.has_changes(),
        })
    }
}
