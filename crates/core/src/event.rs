//! Game events and the prompt each one turns into.

use crate::context::ContextSnapshot;
use crate::evaluation::{Evaluation, PositionEvaluator};

/// Something that happened in the game that the tutor should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    SessionStart,
    /// The participant moved. `evaluation` describes the position after the move.
    ParticipantMove {
        mv: String,
        evaluation: Option<Evaluation>,
    },
    /// The opponent replied.
    RemoteMove { mv: String },
    /// The participant's king is in check.
    Check,
    SessionEnd,
}

impl GameEvent {
    /// Builds a participant move event, asking `evaluator` about the resulting position.
    pub async fn evaluated_move(
        evaluator: &dyn PositionEvaluator,
        position_after: &str,
        mv: impl Into<String>,
    ) -> Self {
        let evaluation = evaluator.evaluate(position_after).await;
        GameEvent::ParticipantMove {
            mv: mv.into(),
            evaluation: (!evaluation.is_empty()).then_some(evaluation),
        }
    }

    /// Short stable name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GameEvent::SessionStart => "session_start",
            GameEvent::ParticipantMove { .. } => "participant_move",
            GameEvent::RemoteMove { .. } => "remote_move",
            GameEvent::Check => "check",
            GameEvent::SessionEnd => "session_end",
        }
    }

    /// Renders the prompt for this event against `ctx`.
    pub fn prompt(&self, ctx: &ContextSnapshot) -> String {
        let name = &ctx.participant_name;
        let side = ctx.side;
        let position = position_clause(ctx);
        match self {
            GameEvent::SessionStart => format!(
                "A new game is starting. {name} plays {side}.{position} \
                 Greet {name} warmly in one or two sentences and wish them luck."
            ),
            GameEvent::ParticipantMove { mv, evaluation } => {
                let verdict = evaluation
                    .as_ref()
                    .and_then(Evaluation::describe)
                    .map(|d| format!(" {d}"))
                    .unwrap_or_default();
                format!(
                    "{name} ({side}) just played {mv}.{position}{verdict} \
                     Comment on the move in one or two short spoken sentences."
                )
            }
            GameEvent::RemoteMove { mv } => format!(
                "The opponent replied with {mv}.{position} \
                 Briefly tell {name} what the move threatens or aims for."
            ),
            GameEvent::Check => format!(
                "{name}'s king is in check.{position} \
                 Alert {name} calmly and hint at the ways out of check."
            ),
            GameEvent::SessionEnd => format!(
                "The game is over.{position} \
                 Give {name} a short, encouraging summary of the game."
            ),
        }
    }
}

fn position_clause(ctx: &ContextSnapshot) -> String {
    if ctx.position.is_empty() {
        String::new()
    } else {
        format!(" Current position (FEN): {}.", ctx.position)
    }
}
