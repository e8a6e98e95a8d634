//! Node runner: the per-node state machine that owns a provider session,
//! drives a single turn to completion, parses tool calls, and suspends for
//! approvals.
//!
//! - [`session`]: session cache, signal queue, prompt-kind state machine.
//! - [`prompt`]: system/role/mode/task composition and the header hash.
//! - [`extract`]: fenced tool-call extraction for stream-json transports.
//! - [`turn`]: the turn loop and tool-queue processing.

mod extract;
mod prompt;
mod session;
mod turn;

pub use extract::{extract_tool_calls, merge_tool_calls};
pub use prompt::{compose, ComposedPrompt, PromptInput, SYSTEM_BLOCK};
pub use session::{NodeSession, PendingTurn, SessionManager, SessionState, SessionStateManager};
pub use turn::{run_turn, summarize, TurnContext, TurnInput, TurnOutcome};
