//! Position evaluation lookups.
//!
//! The evaluator is an external service. Callers only ever see an
//! [`Evaluation`]; any failure (timeout, HTTP error, bad body) degrades to
//! the empty evaluation so a tutoring turn never waits on it.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Engine verdict on one position. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Score in pawns from White's point of view.
    pub score: Option<f64>,
    /// Engine's preferred move in the evaluated position.
    pub best_move: Option<String>,
    /// Moves to mate; positive when White mates.
    pub mate: Option<i32>,
}

impl Evaluation {
    pub fn is_empty(&self) -> bool {
        self.score.is_none() && self.best_move.is_none() && self.mate.is_none()
    }

    /// A one-sentence summary for prompts, or `None` when there is nothing to say.
    pub fn describe(&self) -> Option<String> {
        let mut sentences = Vec::new();
        if let Some(mate) = self.mate {
            let winner = if mate > 0 { "White" } else { "Black" };
            sentences.push(format!(
                "The engine sees mate in {} for {winner}.",
                mate.unsigned_abs()
            ));
        } else if let Some(score) = self.score {
            sentences.push(format!(
                "The engine evaluation is {score:+.2} pawns from White's point of view."
            ));
        }
        if let Some(best) = &self.best_move {
            sentences.push(format!("The engine's preferred move is {best}."));
        }
        (!sentences.is_empty()).then(|| sentences.join(" "))
    }
}

/// Looks up an evaluation for a position.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositionEvaluator: Send + Sync {
    /// Evaluates `position` (FEN). Never fails; errors yield the empty evaluation.
    async fn evaluate(&self, position: &str) -> Evaluation;
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EvaluationResponse {
    #[serde(default, alias = "score")]
    eval: Option<f64>,
    #[serde(default, rename = "move", alias = "bestMove", alias = "best_move")]
    best_move: Option<String>,
    #[serde(default)]
    mate: Option<i32>,
}

/// An evaluator backed by a JSON-over-HTTP engine service.
///
/// Posts `{"fen": ..., "depth": ...}` and reads `eval`, `move` and `mate`
/// from the response body.
pub struct HttpEvaluator {
    client: reqwest::Client,
    url: String,
    depth: u8,
}

impl HttpEvaluator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
            depth: 12,
        })
    }

    async fn lookup(&self, position: &str) -> Result<Evaluation> {
        let response: EvaluationResponse = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "fen": position, "depth": self.depth }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(Evaluation {
            score: response.eval,
            best_move: response.best_move.filter(|m| !m.is_empty()),
            mate: response.mate,
        })
    }
}

#[async_trait]
impl PositionEvaluator for HttpEvaluator {
    async fn evaluate(&self, position: &str) -> Evaluation {
        match self.lookup(position).await {
            Ok(evaluation) => {
                debug!(?evaluation, "Position evaluated");
                evaluation
            }
            Err(e) => {
                warn!(error = %e, "Position evaluation failed; continuing without it");
                Evaluation::default()
            }
        }
    }
}
