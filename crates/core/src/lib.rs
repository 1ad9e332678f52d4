//! Domain types for the chess voice tutor: the conversation context, game
//! events and their prompts, and the external evaluation and text-completion
//! collaborators.

pub mod context;
pub mod evaluation;
pub mod event;
pub mod llm_client;

pub use context::{ContextSnapshot, ConversationContext, Side};
pub use evaluation::{Evaluation, HttpEvaluator, PositionEvaluator};
pub use event::GameEvent;
pub use llm_client::{OpenAICompatibleClient, TextCompleter};
