//! A full game position: board, side to move, ko, passes, komi and the
//! snapshot history used for superko detection and undo/redo.
//!
//! The original layered this as board / ko state / game state; here it
//! is one record. Snapshots are reference-counted so cloning a position
//! for a simulation does not copy the history.

use std::sync::Arc;

use crate::board::Board;
use crate::types::{Cell, Color, Move};
use crate::zobrist;

#[derive(Clone)]
struct Snapshot {
    board: Board,
    ko: Option<u16>,
    passes: u32,
    last_move: Option<Move>,
    hash: u64,
}

#[derive(Clone)]
pub struct Position {
    pub board: Board,
    ko: Option<u16>,
    passes: u32,
    komi: f32,
    handicap: u32,
    last_move: Option<Move>,
    /// Number of moves played; also the index of the current snapshot.
    movenum: u32,
    history: Vec<Arc<Snapshot>>,
}

impl Position {
    pub fn new(size: usize, komi: f32) -> Position {
        let mut pos = Position {
            board: Board::new(size),
            ko: None,
            passes: 0,
            komi,
            handicap: 0,
            last_move: None,
            movenum: 0,
            history: Vec::new(),
        };
        pos.push_snapshot();
        pos
    }

    #[inline]
    pub fn to_move(&self) -> Color {
        self.board.to_move()
    }

    pub fn set_to_move(&mut self, color: Color) {
        self.board.set_to_move(color);
    }

    #[inline]
    pub fn passes(&self) -> u32 {
        self.passes
    }

    #[inline]
    pub fn movenum(&self) -> u32 {
        self.movenum
    }

    #[inline]
    pub fn komi(&self) -> f32 {
        self.komi
    }

    pub fn set_komi(&mut self, komi: f32) {
        self.komi = komi;
    }

    #[inline]
    pub fn handicap(&self) -> u32 {
        self.handicap
    }

    pub fn set_handicap(&mut self, handicap: u32) {
        self.handicap = handicap;
    }

    #[inline]
    pub fn last_move(&self) -> Option<Move> {
        self.last_move
    }

    #[inline]
    pub fn ko(&self) -> Option<u16> {
        self.ko
    }

    /// Hash over (stones, side to move, ko).
    pub fn hash(&self) -> u64 {
        zobrist::keys().position_hash(self.board.hash(), self.board.to_move(), self.ko)
    }

    /// Legality without superko: empty, not the ko point, not suicide.
    /// Superko is checked after the move is played, during descent.
    pub fn is_move_legal(&self, color: Color, mv: Move) -> bool {
        match mv {
            Move::Pass | Move::Resign => true,
            Move::Vertex(v) => {
                self.ko != Some(v)
                    && self.board.cell(v as usize) == Cell::Empty
                    && !self.board.is_suicide(color, v as usize)
            }
        }
    }

    /// Play a move for the side to move.
    pub fn play_move(&mut self, mv: Move) {
        let color = self.board.to_move();
        self.play_move_as(color, mv);
    }

    pub fn play_move_as(&mut self, color: Color, mv: Move) {
        debug_assert_ne!(mv, Move::Resign);
        match mv {
            Move::Vertex(v) => {
                let played = self.board.play_move(color, v as usize);
                self.ko = played.ko;
                self.passes = 0;
            }
            Move::Pass => {
                self.passes += 1;
                self.ko = None;
            }
            Move::Resign => {}
        }
        self.board.set_to_move(color.opponent());
        self.last_move = Some(mv);
        self.movenum += 1;
        // Playing a move drops any redo tail.
        self.history.truncate(self.movenum as usize);
        self.push_snapshot();
    }

    /// Step one move back in the history. Returns false at the start.
    pub fn undo_move(&mut self) -> bool {
        if self.movenum == 0 {
            return false;
        }
        self.movenum -= 1;
        self.restore(self.movenum as usize);
        true
    }

    /// Step one move forward again after an undo.
    pub fn forward_move(&mut self) -> bool {
        if self.movenum as usize + 1 >= self.history.len() {
            return false;
        }
        self.movenum += 1;
        self.restore(self.movenum as usize);
        true
    }

    /// True iff the current whole-board position already occurred.
    pub fn superko(&self) -> bool {
        let h = self.hash();
        self.history[..self.movenum as usize]
            .iter()
            .any(|s| s.hash == h)
    }

    /// Area score including komi and handicap compensation.
    pub fn final_score(&self) -> f32 {
        self.board.area_score(self.komi + self.handicap as f32)
    }

    fn push_snapshot(&mut self) {
        let snap = Snapshot {
            board: self.board.clone(),
            ko: self.ko,
            passes: self.passes,
            last_move: self.last_move,
            hash: self.hash(),
        };
        self.history.push(Arc::new(snap));
    }

    fn restore(&mut self, idx: usize) {
        let snap = Arc::clone(&self.history[idx]);
        self.board = snap.board.clone();
        self.ko = snap.ko;
        self.passes = snap.passes;
        self.last_move = snap.last_move;
    }
}
