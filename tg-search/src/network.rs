//! The evaluator interface the search consumes.
//!
//! The forward pass itself lives elsewhere (GPU batching, weights,
//! symmetry sampling); the search only needs a thread-safe callable
//! producing move priors and a value, optionally with a score head.

use thiserror::Error;

use tg_core::Position;

/// Number of board symmetries an evaluator may sample from.
pub const NUM_SYMMETRIES: u8 = 8;

/// Which symmetry the evaluator should apply before the forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symmetry {
    Fixed(u8),
    Random,
}

/// Score head readout: the board-score margin is modelled as a logistic
/// with location `alpha` and sharpness `beta`.
#[derive(Debug, Clone, Copy)]
pub struct ScoreHead {
    pub alpha: f32,
    pub beta: f32,
}

/// Raw evaluator output for one position.
///
/// `policy[i]` is the prior for the board point with dense index `i`
/// (row-major from the lower-left corner); entries are non-negative but
/// need not sum to one, the search renormalizes over legal moves.
/// `value` is the win probability for the side to move.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub policy: Vec<f32>,
    pub policy_pass: f32,
    pub value: f32,
    pub score_head: Option<ScoreHead>,
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("evaluator unavailable: {0}")]
    Unavailable(String),
    #[error("evaluator returned malformed output: {0}")]
    Malformed(&'static str),
}

/// A policy/value evaluator. Implementations must be thread-safe: every
/// search worker calls `evaluate` concurrently.
pub trait Network: Send + Sync {
    fn evaluate(&self, position: &Position, symmetry: Symmetry)
        -> Result<Evaluation, NetworkError>;

    /// Whether `evaluate` fills in a score head. Searches blend score
    /// evaluations only when this is true.
    fn has_score_head(&self) -> bool;
}

/// Uniform policy, even value, no score head. Baseline for tests and
/// for running the engine without weights.
pub struct UniformNetwork;

impl Network for UniformNetwork {
    fn evaluate(
        &self,
        position: &Position,
        _symmetry: Symmetry,
    ) -> Result<Evaluation, NetworkError> {
        let squares = position.board.num_squares();
        Ok(Evaluation {
            policy: vec![1.0; squares],
            policy_pass: 1.0,
            value: 0.5,
            score_head: None,
        })
    }

    fn has_score_head(&self) -> bool {
        false
    }
}
