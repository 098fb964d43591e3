use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use tg_core::{Board, Cell, Color};

fn random_playout(size: usize, moves: usize, rng: &mut ChaCha8Rng) -> u32 {
    let mut board = Board::new(size);
    let mut color = Color::Black;
    let mut candidates = Vec::with_capacity(size * size);
    for _ in 0..moves {
        candidates.clear();
        for i in 0..board.num_squares() {
            let v = board.vertex_from_index(i);
            if board.cell(v) == Cell::Empty
                && !board.is_suicide(color, v)
                && !board.is_eye(color, v)
            {
                candidates.push(v);
            }
        }
        if candidates.is_empty() {
            break;
        }
        board.play_move(color, candidates[rng.gen_range(0..candidates.len())]);
        color = color.opponent();
    }
    board.prisoners(Color::Black) + board.prisoners(Color::White)
}

/// A half-filled board for the scoring benchmarks.
fn mid_game_board(size: usize, rng: &mut ChaCha8Rng) -> Board {
    let mut board = Board::new(size);
    let mut color = Color::Black;
    for _ in 0..size * size {
        let i = rng.gen_range(0..size * size);
        let v = board.vertex_from_index(i);
        if board.cell(v) == Cell::Empty && !board.is_suicide(color, v) {
            board.play_move(color, v);
            color = color.opponent();
        }
    }
    board
}

fn bench_playouts(c: &mut Criterion) {
    let mut g = c.benchmark_group("tg_core_playout");
    for &size in &[9usize, 19usize] {
        let moves = size * size * 2;
        g.bench_with_input(BenchmarkId::new("random_game", size), &size, |b, &s| {
            let mut rng = ChaCha8Rng::seed_from_u64(s as u64);
            b.iter(|| black_box(random_playout(s, moves, &mut rng)))
        });
    }
    g.finish();
}

fn bench_scoring(c: &mut Criterion) {
    let mut g = c.benchmark_group("tg_core_scoring");
    for &size in &[9usize, 19usize] {
        let mut rng = ChaCha8Rng::seed_from_u64(0x60);
        let board = mid_game_board(size, &mut rng);
        g.bench_with_input(BenchmarkId::new("area_score", size), &board, |b, bd| {
            b.iter(|| black_box(bd.area_score(black_box(7.5))))
        });
        g.bench_with_input(BenchmarkId::new("territory_score", size), &board, |b, bd| {
            b.iter(|| black_box(bd.territory_score(black_box(7.5))))
        });
    }
    g.finish();
}

criterion_group!(benches, bench_playouts, bench_scoring);
criterion_main!(benches);
