//! Value carried back up the tree by one simulation.

use crate::blend::{log_sigmoid, sigmoid};

/// Sharpness assigned to exact terminal scores so the bonus formula
/// saturates consistently with the plain win/loss value.
const TERMINAL_BETA: f32 = 10.0;

/// Outcome of one descent: a terminal board score, a network
/// evaluation, or nothing (the descent was aborted).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimResult {
    /// Aborted (superko hit, expansion race, tree full). Not backed up.
    Invalid,
    /// Terminal position reached by two passes; exact area score.
    Score(f32),
    /// Network evaluation, value and score head in Black's perspective.
    Eval { value: f32, alpkt: f32, beta: f32 },
}

impl SimResult {
    pub fn from_score(score: f32) -> SimResult {
        SimResult::Score(score)
    }

    pub fn from_eval(value: f32, alpkt: f32, beta: f32) -> SimResult {
        SimResult::Eval { value, alpkt, beta }
    }

    #[inline]
    pub fn valid(&self) -> bool {
        !matches!(self, SimResult::Invalid)
    }

    /// Plain value in [0,1] from Black's perspective.
    pub fn eval(&self) -> f32 {
        match *self {
            SimResult::Invalid => 0.5,
            SimResult::Score(s) => {
                if s > 0.0 {
                    1.0
                } else if s < 0.0 {
                    0.0
                } else {
                    0.5
                }
            }
            SimResult::Eval { value, .. } => value,
        }
    }

    /// Value re-read at the parent's exploration offset `xbar`: the mean
    /// of `sigmoid(alpkt, beta, x)` for `x` between 0 and `xbar`,
    /// expressed through the log-ratio identity. Saturates once the
    /// logistic is flat across the whole interval.
    pub fn eval_with_bonus(&self, xbar: f32) -> f32 {
        match *self {
            SimResult::Invalid => self.eval(),
            SimResult::Score(s) => eval_with_bonus_at(s, TERMINAL_BETA, xbar),
            SimResult::Eval { alpkt, beta, .. } => eval_with_bonus_at(alpkt, beta, xbar),
        }
    }
}

fn eval_with_bonus_at(alpkt: f32, beta: f32, xbar: f32) -> f32 {
    if xbar.abs() < 0.001 {
        sigmoid(alpkt, beta, 0.0)
    } else if (alpkt.abs() + xbar.abs()) * beta < 10.0 {
        let log_ratio = log_sigmoid(beta * (alpkt + xbar)) - log_sigmoid(beta * alpkt);
        1.0 - log_ratio / beta / xbar
    } else if alpkt > 0.0 {
        1.0
    } else {
        0.0
    }
}
