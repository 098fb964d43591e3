//! Board scoring: area counting and territory counting with seki
//! detection.
//!
//! Area scoring uses the two-pass reach flood: each color claims its
//! stones plus every empty point from which only that color's stones
//! can be reached. Territory scoring refines this by marking dame and
//! by excluding the eyes of strings that only live in common.

use std::collections::VecDeque;

use crate::board::Board;
use crate::types::{Cell, Color, NUM_VERTICES};

/// Classification of a cell after the territory passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerritoryCell {
    BlackStone,
    WhiteStone,
    Empty,
    Invalid,
    Dame,
    Seki,
    SekiEye,
    WhiteTerritory,
    BlackTerritory,
}

/// Result of the territory computation.
pub struct TerritoryMap {
    cells: Box<[TerritoryCell; NUM_VERTICES]>,
    pub black_territory: usize,
    pub white_territory: usize,
    pub dame: usize,
    pub seki_strings: usize,
}

impl TerritoryMap {
    #[inline]
    pub fn cell(&self, vertex: usize) -> TerritoryCell {
        self.cells[vertex]
    }
}

impl Board {
    /// Count of vertices reachable by `color`: its stones plus every
    /// empty point connected to them through empty cells.
    fn calc_reach_color(&self, color: Color, reached: &mut [bool; NUM_VERTICES]) -> usize {
        let mut count = 0usize;
        let mut open = VecDeque::new();
        for y in 0..self.size() {
            for x in 0..self.size() {
                let v = self.vertex(x, y);
                if self.cell(v).is_color(color) {
                    reached[v] = true;
                    count += 1;
                    open.push_back(v);
                }
            }
        }
        while let Some(v) = open.pop_front() {
            for k in 0..4 {
                let n = self.neighbour(v, k);
                if !reached[n] && self.cell(n) == Cell::Empty {
                    reached[n] = true;
                    count += 1;
                    open.push_back(n);
                }
            }
        }
        count
    }

    /// Area score from Black's perspective: reach counts plus prisoners,
    /// minus komi. Points reached by both colors cancel.
    pub fn area_score(&self, komi: f32) -> f32 {
        let mut scratch = Box::new([false; NUM_VERTICES]);
        let black = self.calc_reach_color(Color::Black, &mut scratch);
        *scratch = [false; NUM_VERTICES];
        let white = self.calc_reach_color(Color::White, &mut scratch);
        (black as f32 + self.prisoners(Color::Black) as f32)
            - (white as f32 + self.prisoners(Color::White) as f32)
            - komi
    }

    /// Classify every cell as stone, dame, seki eye or territory.
    pub fn compute_territory(&self) -> TerritoryMap {
        let mut cells = Box::new([TerritoryCell::Invalid; NUM_VERTICES]);
        for y in 0..self.size() {
            for x in 0..self.size() {
                let v = self.vertex(x, y);
                cells[v] = match self.cell(v) {
                    Cell::Black => TerritoryCell::BlackStone,
                    Cell::White => TerritoryCell::WhiteStone,
                    Cell::Empty => TerritoryCell::Empty,
                    Cell::Invalid => TerritoryCell::Invalid,
                };
            }
        }

        let mut reach_black = Box::new([false; NUM_VERTICES]);
        let mut reach_white = Box::new([false; NUM_VERTICES]);
        self.calc_reach_color(Color::Black, &mut reach_black);
        self.calc_reach_color(Color::White, &mut reach_white);

        // Dame: empty points both colors reach.
        let mut dame = 0usize;
        for v in 0..NUM_VERTICES {
            if cells[v] == TerritoryCell::Empty && reach_black[v] && reach_white[v] {
                cells[v] = TerritoryCell::Dame;
                dame += 1;
            }
        }

        let seki_strings = self.find_seki(&mut cells);

        let (black_territory, white_territory) = self.fill_territory(&mut cells);

        TerritoryMap {
            cells,
            black_territory,
            white_territory,
            dame,
            seki_strings,
        }
    }

    /// Mark strings that live in common: every liberty is dame or a
    /// single eye. Their eyes do not score for either side.
    fn find_seki(&self, cells: &mut [TerritoryCell; NUM_VERTICES]) -> usize {
        let mut visited = [false; NUM_VERTICES];
        let mut found = 0usize;
        for y in 0..self.size() {
            for x in 0..self.size() {
                let v = self.vertex(x, y);
                let color = match self.cell(v) {
                    Cell::Black => Color::Black,
                    Cell::White => Color::White,
                    _ => continue,
                };
                let rep = self.string_rep(v);
                if visited[rep] {
                    continue;
                }
                visited[rep] = true;

                let mut lib_seen = [false; NUM_VERTICES];
                let mut dame_libs = 0usize;
                let mut eyes = [0usize; 2];
                let mut eye_cnt = 0usize;
                let mut other_libs = 0usize;
                let mut pos = rep;
                loop {
                    for k in 0..4 {
                        let n = self.neighbour(pos, k);
                        if self.cell(n) != Cell::Empty || lib_seen[n] {
                            continue;
                        }
                        lib_seen[n] = true;
                        if cells[n] == TerritoryCell::Dame {
                            dame_libs += 1;
                        } else if self.is_eye(color, n) && eye_cnt < 2 {
                            eyes[eye_cnt] = n;
                            eye_cnt += 1;
                        } else {
                            other_libs += 1;
                        }
                    }
                    pos = self.next_in_string(pos);
                    if pos == rep {
                        break;
                    }
                }

                if dame_libs > 0 && other_libs == 0 && eye_cnt <= 1 {
                    found += 1;
                    let mut pos = rep;
                    loop {
                        cells[pos] = TerritoryCell::Seki;
                        pos = self.next_in_string(pos);
                        if pos == rep {
                            break;
                        }
                    }
                    for &eye in &eyes[..eye_cnt] {
                        cells[eye] = TerritoryCell::SekiEye;
                    }
                }
            }
        }
        found
    }

    /// Flood the remaining empty regions; a region touching exactly one
    /// color becomes that color's territory, anything else is dame.
    fn fill_territory(&self, cells: &mut [TerritoryCell; NUM_VERTICES]) -> (usize, usize) {
        let mut black = 0usize;
        let mut white = 0usize;
        let mut region = Vec::new();
        for y in 0..self.size() {
            for x in 0..self.size() {
                let start = self.vertex(x, y);
                if cells[start] != TerritoryCell::Empty {
                    continue;
                }
                region.clear();
                let mut touches = [false; 2];
                let mut open = VecDeque::new();
                cells[start] = TerritoryCell::Dame;
                open.push_back(start);
                while let Some(v) = open.pop_front() {
                    region.push(v);
                    for k in 0..4 {
                        let n = self.neighbour(v, k);
                        match self.cell(n) {
                            Cell::Black => touches[Color::Black.index()] = true,
                            Cell::White => touches[Color::White.index()] = true,
                            Cell::Empty => {
                                if cells[n] == TerritoryCell::Empty {
                                    cells[n] = TerritoryCell::Dame;
                                    open.push_back(n);
                                }
                            }
                            Cell::Invalid => {}
                        }
                    }
                }
                let owner = match (touches[0], touches[1]) {
                    (true, false) => Some(TerritoryCell::BlackTerritory),
                    (false, true) => Some(TerritoryCell::WhiteTerritory),
                    _ => None,
                };
                if let Some(mark) = owner {
                    for &v in &region {
                        cells[v] = mark;
                    }
                    match mark {
                        TerritoryCell::BlackTerritory => black += region.len(),
                        _ => white += region.len(),
                    }
                }
            }
        }
        (black, white)
    }

    /// Territory score from Black's perspective: stones plus owned
    /// territory plus prisoners, minus komi. Seki eyes and dame score
    /// for neither side.
    pub fn territory_score(&self, komi: f32) -> f32 {
        let map = self.compute_territory();
        let mut stones = [0usize; 2];
        for y in 0..self.size() {
            for x in 0..self.size() {
                match self.cell(self.vertex(x, y)) {
                    Cell::Black => stones[Color::Black.index()] += 1,
                    Cell::White => stones[Color::White.index()] += 1,
                    _ => {}
                }
            }
        }
        let black = stones[Color::Black.index()] as f32
            + map.black_territory as f32
            + self.prisoners(Color::Black) as f32;
        let white = stones[Color::White.index()] as f32
            + map.white_territory as f32
            + self.prisoners(Color::White) as f32;
        black - white - komi
    }
}
