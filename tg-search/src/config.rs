//! Search configuration.
//!
//! The options are immutable for the lifetime of a search; `Search`
//! takes them by value at construction and validates once.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::search::SearchError;

/// Playout/visit budgets are capped at half the counter range so
/// concurrent increments cannot overflow.
pub const UNLIMITED_PLAYOUTS: u32 = u32::MAX / 2;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("failed to read options file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Time-management policy for early termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeManagement {
    Off,
    #[default]
    On,
    /// Also stop early on forced moves even under fixed playout budgets.
    Fast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    /// PUCT exploration constant.
    #[serde(default = "default_c_puct")]
    pub c_puct: f32,
    /// First-play-urgency reduction coefficient.
    #[serde(default = "default_fpu_reduction")]
    pub fpu_reduction: f32,
    /// Use 0.5 instead of the parent eval as the FPU base.
    #[serde(default)]
    pub fpu_zero: bool,
    /// Mix Dirichlet noise into the root priors.
    #[serde(default)]
    pub noise: bool,
    #[serde(default = "default_dirichlet_alpha")]
    pub dirichlet_alpha: f32,
    #[serde(default = "default_dirichlet_epsilon")]
    pub dirichlet_epsilon: f32,
    /// Score-head temperature for the exploration bonus offset.
    #[serde(default)]
    pub lambda: f32,
    /// Score-head temperature for the value anchor offset.
    #[serde(default)]
    pub mu: f32,
    #[serde(default = "default_max_playouts")]
    pub max_playouts: u32,
    #[serde(default = "default_max_visits")]
    pub max_visits: u32,
    /// Wall-clock budget per `think` call.
    #[serde(default = "default_max_time_ms")]
    pub max_time_ms: u64,
    /// Worker count, including the calling thread.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    /// Pick early moves proportionally to visit counts while the move
    /// number is below this.
    #[serde(default)]
    pub random_cnt: u32,
    /// Resignation threshold in percent; negative selects the default
    /// of 10, zero disables resignation.
    #[serde(default = "default_resignpct")]
    pub resignpct: i32,
    #[serde(default)]
    pub timemanage: TimeManagement,
    /// Disable the pass-safety corrections applied to the best move.
    #[serde(default)]
    pub dumbpass: bool,
    /// Suppress periodic progress events.
    #[serde(default)]
    pub quiet: bool,
    /// Seed for all in-search randomness (noise, opening sampling).
    #[serde(default)]
    pub seed: u64,
    /// Upper bound on tree nodes before expansions are refused.
    #[serde(default = "default_max_tree_size")]
    pub max_tree_size: usize,
}

fn default_c_puct() -> f32 {
    0.5
}

fn default_fpu_reduction() -> f32 {
    0.25
}

fn default_dirichlet_alpha() -> f32 {
    0.03
}

fn default_dirichlet_epsilon() -> f32 {
    0.25
}

fn default_max_playouts() -> u32 {
    UNLIMITED_PLAYOUTS
}

fn default_max_visits() -> u32 {
    UNLIMITED_PLAYOUTS
}

fn default_max_time_ms() -> u64 {
    // An hour: effectively "until the budget says stop".
    3_600_000
}

fn default_num_threads() -> usize {
    1
}

fn default_resignpct() -> i32 {
    -1
}

fn default_max_tree_size() -> usize {
    5_000_000
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            c_puct: default_c_puct(),
            fpu_reduction: default_fpu_reduction(),
            fpu_zero: false,
            noise: false,
            dirichlet_alpha: default_dirichlet_alpha(),
            dirichlet_epsilon: default_dirichlet_epsilon(),
            lambda: 0.0,
            mu: 0.0,
            max_playouts: default_max_playouts(),
            max_visits: default_max_visits(),
            max_time_ms: default_max_time_ms(),
            num_threads: default_num_threads(),
            random_cnt: 0,
            resignpct: default_resignpct(),
            timemanage: TimeManagement::default(),
            dumbpass: false,
            quiet: false,
            seed: 0,
            max_tree_size: default_max_tree_size(),
        }
    }
}

impl SearchOptions {
    /// Load options from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, OptionsError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Load options from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, OptionsError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub(crate) fn validate(&self) -> Result<(), SearchError> {
        if !(self.c_puct.is_finite() && self.c_puct > 0.0) {
            return Err(SearchError::InvalidOptions {
                msg: "c_puct must be finite and > 0",
            });
        }
        if !self.fpu_reduction.is_finite() {
            return Err(SearchError::InvalidOptions {
                msg: "fpu_reduction must be finite",
            });
        }
        for (name, t) in [("lambda", self.lambda), ("mu", self.mu)] {
            if !(t.is_finite() && (0.0..=1.0).contains(&t)) {
                return Err(SearchError::InvalidOptions {
                    msg: match name {
                        "lambda" => "lambda must be in [0,1]",
                        _ => "mu must be in [0,1]",
                    },
                });
            }
        }
        if self.num_threads == 0 {
            return Err(SearchError::InvalidOptions {
                msg: "num_threads must be > 0",
            });
        }
        if self.max_tree_size == 0 {
            return Err(SearchError::InvalidOptions {
                msg: "max_tree_size must be > 0",
            });
        }
        if self.noise
            && !(self.dirichlet_alpha.is_finite()
                && self.dirichlet_alpha > 0.0
                && (0.0..=1.0).contains(&self.dirichlet_epsilon))
        {
            return Err(SearchError::InvalidOptions {
                msg: "dirichlet noise parameters out of range",
            });
        }
        Ok(())
    }

    /// Effective playout budget, clamped to the overflow-safe limit.
    pub(crate) fn playout_limit(&self) -> u32 {
        self.max_playouts.min(UNLIMITED_PLAYOUTS)
    }

    /// Effective visit budget, clamped to the overflow-safe limit.
    pub(crate) fn visit_limit(&self) -> u32 {
        self.max_visits.min(UNLIMITED_PLAYOUTS)
    }
}
