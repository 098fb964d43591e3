//! Zobrist hashing keys for positions.
//!
//! The hash of a position depends only on (stones, side to move, ko
//! point). Keys are generated once from a fixed seed so hashes are
//! stable across runs and processes.

use std::sync::OnceLock;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::types::{Color, NUM_VERTICES};

const ZOBRIST_SEED: u64 = 0x5A0B_4157_C0DE_D00D;

pub struct ZobristKeys {
    /// One key per (color, vertex).
    stones: [[u64; NUM_VERTICES]; 2],
    /// One key per possible ko vertex.
    ko: [u64; NUM_VERTICES],
    /// Mixed in when White is to move.
    white_to_move: u64,
    /// Baseline hash of an empty board.
    empty: u64,
}

static KEYS: OnceLock<ZobristKeys> = OnceLock::new();

/// The process-wide key tables.
pub fn keys() -> &'static ZobristKeys {
    KEYS.get_or_init(|| {
        let mut rng = ChaCha8Rng::seed_from_u64(ZOBRIST_SEED);
        let mut stones = [[0u64; NUM_VERTICES]; 2];
        for table in stones.iter_mut() {
            for key in table.iter_mut() {
                *key = rng.next_u64();
            }
        }
        let mut ko = [0u64; NUM_VERTICES];
        for key in ko.iter_mut() {
            *key = rng.next_u64();
        }
        ZobristKeys {
            stones,
            ko,
            white_to_move: rng.next_u64(),
            empty: rng.next_u64(),
        }
    })
}

impl ZobristKeys {
    #[inline]
    pub fn stone(&self, color: Color, vertex: u16) -> u64 {
        self.stones[color.index()][vertex as usize]
    }

    #[inline]
    pub fn empty_board(&self) -> u64 {
        self.empty
    }

    /// Combine the stone hash with side-to-move and ko state.
    pub fn position_hash(&self, stone_hash: u64, to_move: Color, ko: Option<u16>) -> u64 {
        let mut h = stone_hash;
        if to_move == Color::White {
            h ^= self.white_to_move;
        }
        if let Some(v) = ko {
            h ^= self.ko[v as usize];
        }
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_and_distinct() {
        let k = keys();
        assert_eq!(k.stone(Color::Black, 22), keys().stone(Color::Black, 22));
        assert_ne!(k.stone(Color::Black, 22), k.stone(Color::White, 22));
        assert_ne!(k.stone(Color::Black, 22), k.stone(Color::Black, 23));
    }

    #[test]
    fn position_hash_mixes_side_and_ko() {
        let k = keys();
        let base = k.empty_board();
        assert_ne!(
            k.position_hash(base, Color::Black, None),
            k.position_hash(base, Color::White, None)
        );
        assert_ne!(
            k.position_hash(base, Color::Black, None),
            k.position_hash(base, Color::Black, Some(45))
        );
    }
}
