//! tg-search: parallel PUCT tree search for Go, guided by a
//! policy/value network with an optional score head.
//!
//! The tree lives behind atomics and per-node mutexes so a fixed pool
//! of OS threads can run simulations concurrently; parallelism is
//! mediated by virtual losses rather than exclusive paths.

pub mod blend;
pub mod config;
#[cfg(test)]
mod mcts_tests;
pub mod network;
pub mod node;
pub mod result;
pub mod search;

pub use config::{OptionsError, SearchOptions, TimeManagement, UNLIMITED_PLAYOUTS};
pub use network::{Evaluation, Network, NetworkError, ScoreHead, Symmetry, UniformNetwork};
pub use node::{NetEval, Node, NodePointer, NodeStatus, TreeStats, VIRTUAL_LOSS_COUNT};
pub use result::SimResult;
pub use search::{PassFlags, Search, SearchError};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
