//! Context Management Module
//!
//! Turns retrieved chunks into the context block and messages sent to the
//! chat model, within chunk and token budgets.

pub mod assembler;
pub mod tokens;

pub use assembler::{
    build_prompt, AssembledContext, ChatMessage, ChatRole, ContextAssembler, PromptPlan, Source,
    NO_CONTEXT_MESSAGE,
};
pub use tokens::{count_tokens, estimate_tokens_quick};
