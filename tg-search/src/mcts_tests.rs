use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tg_core::{Cell, Color, Move, Position};

use crate::config::SearchOptions;
use crate::network::{Evaluation, Network, NetworkError, ScoreHead, Symmetry, UniformNetwork};
use crate::node::{Node, VIRTUAL_LOSS_COUNT};
use crate::search::{PassFlags, Search, SearchError};

/// All prior mass on a single point.
struct SpikeNetwork {
    index: usize,
}

impl Network for SpikeNetwork {
    fn evaluate(
        &self,
        position: &Position,
        _symmetry: Symmetry,
    ) -> Result<Evaluation, NetworkError> {
        let squares = position.board.num_squares();
        let mut policy = vec![0.0f32; squares];
        policy[self.index] = 1.0;
        Ok(Evaluation {
            policy,
            policy_pass: 0.0,
            value: 0.5,
            score_head: None,
        })
    }

    fn has_score_head(&self) -> bool {
        false
    }
}

/// Prefers passing on priors, but its value head knows that capturing
/// the marked stone wins.
struct CaptureNetwork {
    target: usize,
    capture_index: usize,
}

impl Network for CaptureNetwork {
    fn evaluate(
        &self,
        position: &Position,
        _symmetry: Symmetry,
    ) -> Result<Evaluation, NetworkError> {
        let squares = position.board.num_squares();
        let mut policy = vec![0.3f32 / squares as f32; squares];
        policy[self.capture_index] = 0.2;
        let captured = position.board.cell(self.target) != Cell::White;
        let value = if captured {
            // Good for Black, so bad for the side to move when that is
            // White (which it is right after the capture).
            match position.to_move() {
                Color::White => 0.05,
                Color::Black => 0.95,
            }
        } else {
            0.5
        };
        Ok(Evaluation {
            policy,
            policy_pass: 0.5,
            value,
            score_head: None,
        })
    }

    fn has_score_head(&self) -> bool {
        false
    }
}

/// Fixed score head; value consistent with a Black lead.
struct ScoreHeadNetwork {
    alpha: f32,
    beta: f32,
}

impl Network for ScoreHeadNetwork {
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
            score_head: Some(ScoreHead {
                alpha: self.alpha,
                beta: self.beta,
            }),
        })
    }

    fn has_score_head(&self) -> bool {
        true
    }
}

struct FailingNetwork;

impl Network for FailingNetwork {
    fn evaluate(
        &self,
        _position: &Position,
        _symmetry: Symmetry,
    ) -> Result<Evaluation, NetworkError> {
        Err(NetworkError::Unavailable("evaluator offline".to_string()))
    }

    fn has_score_head(&self) -> bool {
        false
    }
}

fn options(max_visits: u32, num_threads: usize, seed: u64) -> SearchOptions {
    let mut opts = SearchOptions::default();
    opts.max_visits = max_visits;
    opts.num_threads = num_threads;
    opts.seed = seed;
    opts.quiet = true;
    // Fixed-visit expectations below; early termination is exercised
    // separately.
    opts.timemanage = crate::config::TimeManagement::Off;
    opts
}

fn child_visits(root: &Arc<Node>, mv: Move) -> Option<u32> {
    root.with_children(|children| {
        children
            .iter()
            .find(|c| c.mv() == mv)
            .map(|c| c.visits())
    })
}

fn check_visit_invariants(node: &Arc<Node>) {
    let visits = node.visits() as u64;
    let evals = node.black_evals();
    assert!(evals >= 0.0);
    assert!(evals <= visits as f64);
    node.with_children(|children| {
        let sum: u64 = children.iter().map(|c| c.visits() as u64).sum();
        assert!(visits >= sum, "node visits {} < child sum {}", visits, sum);
        for c in children {
            if let Some(n) = c.node() {
                check_visit_invariants(n);
            }
        }
    });
}

#[test]
fn single_visit_uniform_search_plays_a_stone() {
    let pos = Position::new(19, 7.5);
    let mut search =
        Search::new(Arc::new(UniformNetwork), options(1, 1, 1), pos).expect("search");

    let mv = search.think(Color::Black, PassFlags::NONE).expect("think");
    assert!(matches!(mv, Move::Vertex(_)), "expected a stone, got {:?}", mv);
    // 361 points plus pass, evaluated exactly once.
    assert_eq!(search.root_node().children_len(), 362);
    assert_eq!(search.root_visits(), 1);
    assert_eq!(search.playouts(), 0);
}

#[test]
fn concentrated_prior_drives_the_search_to_tengen() {
    let pos = Position::new(19, 7.5);
    let tengen_index = 9 * 19 + 9;
    let tengen = Move::Vertex(pos.board.vertex(9, 9) as u16);
    let net = Arc::new(SpikeNetwork {
        index: tengen_index,
    });
    let mut search = Search::new(net, options(100, 1, 1), pos).expect("search");

    let mv = search.think(Color::Black, PassFlags::NONE).expect("think");
    assert_eq!(mv, tengen);
    let visits = child_visits(search.root_node(), tengen).expect("tengen child");
    assert!(visits >= 90, "tengen only got {} visits", visits);
    check_visit_invariants(search.root_node());
}

#[test]
fn terminal_root_passes_without_expanding() {
    let mut pos = Position::new(9, 7.5);
    pos.play_move(Move::Pass);
    pos.play_move(Move::Pass);
    let mut search =
        Search::new(Arc::new(UniformNetwork), options(100, 1, 1), pos).expect("search");

    let mv = search.think(Color::Black, PassFlags::NONE).expect("think");
    assert_eq!(mv, Move::Pass);
    assert_eq!(search.root_node().children_len(), 0);
    assert_eq!(search.node_count(), 0);
}

#[test]
fn value_head_overrides_a_pass_heavy_prior() {
    let mut pos = Position::new(9, 7.5);
    // White stone in atari in the corner; Black kills at (0,1).
    pos.play_move_as(Color::Black, Move::Vertex(pos.board.vertex(1, 0) as u16));
    pos.play_move_as(Color::White, Move::Vertex(pos.board.vertex(0, 0) as u16));
    let target = pos.board.vertex(0, 0);
    let capture_vertex = pos.board.vertex(0, 1);
    let capture = Move::Vertex(capture_vertex as u16);
    let net = Arc::new(CaptureNetwork {
        target,
        capture_index: pos.board.index(capture_vertex),
    });
    let mut search = Search::new(net, options(800, 1, 3), pos).expect("search");

    let mv = search.think(Color::Black, PassFlags::NONE).expect("think");
    assert_eq!(mv, capture, "search failed to find the winning capture");
    let capture_visits = child_visits(search.root_node(), capture).expect("capture child");
    let pass_visits = child_visits(search.root_node(), Move::Pass).expect("pass child");
    assert!(
        capture_visits > pass_visits,
        "capture {} vs pass {}",
        capture_visits,
        pass_visits
    );
}

#[test]
fn ko_recapture_is_not_among_root_children() {
    let mut pos = Position::new(9, 7.5);
    for (color, x, y) in [
        (Color::Black, 0, 0),
        (Color::White, 3, 0),
        (Color::Black, 1, 1),
        (Color::White, 2, 1),
    ] {
        pos.play_move_as(color, Move::Vertex(pos.board.vertex(x, y) as u16));
    }
    let ko_vertex = pos.board.vertex(1, 0) as u16;
    pos.play_move_as(Color::White, Move::Vertex(ko_vertex));
    pos.play_move_as(Color::Black, Move::Vertex(pos.board.vertex(2, 0) as u16));
    assert_eq!(pos.ko(), Some(ko_vertex));

    let mut search =
        Search::new(Arc::new(UniformNetwork), options(1, 1, 1), pos).expect("search");
    search.think(Color::White, PassFlags::NONE).expect("think");

    search.root_node().with_children(|children| {
        assert!(
            !children.iter().any(|c| c.mv() == Move::Vertex(ko_vertex)),
            "illegal ko recapture offered as a child"
        );
        assert!(!children.is_empty());
    });
}

#[test]
fn identical_seeds_give_identical_trees() {
    let collect = |seed: u64| -> Vec<(Move, u32, f32)> {
        let pos = Position::new(9, 7.5);
        let mut search =
            Search::new(Arc::new(UniformNetwork), options(64, 1, seed), pos).expect("search");
        search.think(Color::Black, PassFlags::NONE).expect("think");
        search.root_node().with_children(|children| {
            children
                .iter()
                .map(|c| (c.mv(), c.visits(), c.prior()))
                .collect()
        })
    };

    let a = collect(42);
    let b = collect(42);
    assert_eq!(a, b);
}

#[test]
fn parallel_search_keeps_the_visit_ledger_consistent() {
    let pos = Position::new(9, 7.5);
    let mut search =
        Search::new(Arc::new(UniformNetwork), options(50, 4, 9), pos).expect("search");
    search.think(Color::Black, PassFlags::NONE).expect("think");

    let root = search.root_node();
    let root_visits = root.visits();
    // All virtual losses resolved; overshoot is bounded by the workers.
    assert!(root_visits >= 50);
    assert!(root_visits <= 50 + 4 * VIRTUAL_LOSS_COUNT);

    let child_sum: u64 =
        root.with_children(|children| children.iter().map(|c| c.visits() as u64).sum());
    // Every root visit except the evaluation visit went through a child.
    assert_eq!(child_sum, root_visits as u64 - 1);
    check_visit_invariants(root);
}

#[test]
fn tree_is_reused_when_the_root_advances() {
    let pos = Position::new(9, 7.5);
    let mut search =
        Search::new(Arc::new(UniformNetwork), options(200, 1, 7), pos).expect("search");

    let mv = search.think(Color::Black, PassFlags::NONE).expect("think");
    let preserved = child_visits(search.root_node(), mv).expect("best child");
    assert!(preserved >= 2, "best child too thin: {}", preserved);

    search.position_mut().play_move(mv);
    search.think(Color::White, PassFlags::NONE).expect("think");

    // The promoted subtree kept its visits: the second search only had
    // to add the difference.
    let playouts = search.playouts();
    assert_eq!(search.root_visits(), preserved + playouts);
    assert!(
        playouts < 200 - preserved / 2,
        "tree was rebuilt: {} playouts after preserving {}",
        playouts,
        preserved
    );
}

#[test]
fn network_failure_aborts_the_search() {
    let pos = Position::new(9, 7.5);
    let mut search =
        Search::new(Arc::new(FailingNetwork), options(10, 1, 1), pos).expect("search");
    let err = search.think(Color::Black, PassFlags::NONE);
    assert!(matches!(err, Err(SearchError::Network(_))), "{:?}", err);
}

#[test]
fn root_noise_perturbs_uniform_priors() {
    let pos = Position::new(9, 7.5);
    let mut opts = options(1, 1, 5);
    opts.noise = true;
    let mut search = Search::new(Arc::new(UniformNetwork), opts, pos).expect("search");
    search.think(Color::Black, PassFlags::NONE).expect("think");

    let (lo, hi) = search.root_node().with_children(|children| {
        let mut lo = f32::MAX;
        let mut hi = f32::MIN;
        for c in children {
            lo = lo.min(c.prior());
            hi = hi.max(c.prior());
        }
        (lo, hi)
    });
    assert!(hi - lo > 1e-4, "noise left priors uniform: [{}, {}]", lo, hi);
}

#[test]
fn score_head_is_folded_to_black_perspective_and_komi() {
    let mut opts = options(10, 1, 1);
    opts.lambda = 0.5;
    opts.mu = 0.1;

    // Black to move: alpha counts for Black, komi against.
    let pos = Position::new(9, 0.5);
    let net = Arc::new(ScoreHeadNetwork {
        alpha: 2.0,
        beta: 1.0,
    });
    let mut search = Search::new(net.clone(), opts.clone(), pos).expect("search");
    search.think(Color::Black, PassFlags::NONE).expect("think");
    let root = search.root_node();
    assert!((root.net_alpkt() - 1.5).abs() < 1e-5);
    assert!((root.net_beta() - 1.0).abs() < 1e-5);
    // Black is ahead, so both tempered offsets hand points away.
    assert!(root.eval_bonus() < 0.0);
    assert!(root.eval_base() < 0.0);
    assert!(root.eval_bonus() < root.eval_base());

    // White to move: the head flips sign before komi is applied.
    let mut pos = Position::new(9, 0.5);
    pos.play_move(Move::Vertex(pos.board.vertex(4, 4) as u16));
    let mut search = Search::new(net, opts, pos).expect("search");
    search.think(Color::White, PassFlags::NONE).expect("think");
    assert!((search.root_node().net_alpkt() - (-2.5)).abs() < 1e-5);
}

#[test]
fn nopass_flag_substitutes_a_board_move() {
    // A network that wants to pass everywhere.
    struct PassHappyNetwork;
    impl Network for PassHappyNetwork {
        fn evaluate(
            &self,
            position: &Position,
            _symmetry: Symmetry,
        ) -> Result<Evaluation, NetworkError> {
            let squares = position.board.num_squares();
            Ok(Evaluation {
                policy: vec![1e-6; squares],
                policy_pass: 1.0,
                value: 0.5,
                score_head: None,
            })
        }
        fn has_score_head(&self) -> bool {
            false
        }
    }

    let pos = Position::new(9, 7.5);
    let mut opts = options(40, 1, 2);
    opts.dumbpass = true;
    let mut search = Search::new(Arc::new(PassHappyNetwork), opts, pos).expect("search");

    let flags = PassFlags {
        no_pass: true,
        no_resign: true,
    };
    let mv = search.think(Color::Black, flags).expect("think");
    assert!(
        matches!(mv, Move::Vertex(_)),
        "NOPASS must pick a board move, got {:?}",
        mv
    );
}

#[test]
fn time_management_stops_searches_with_one_contender() {
    let pos = Position::new(19, 7.5);
    let tengen = Move::Vertex(pos.board.vertex(9, 9) as u16);
    let net = Arc::new(SpikeNetwork { index: 9 * 19 + 9 });
    let mut opts = options(100, 1, 1);
    opts.timemanage = crate::config::TimeManagement::On;
    let mut search = Search::new(net, opts, pos).expect("search");

    let mv = search.think(Color::Black, PassFlags::NONE).expect("think");
    assert_eq!(mv, tengen);
    // Once no other child can catch up, the budget is not exhausted.
    assert!(search.root_visits() >= 10);
    assert!(
        search.root_visits() < 80,
        "expected an early stop, got {} visits",
        search.root_visits()
    );
}

#[test]
fn a_summary_event_is_written_per_think() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("search.ndjson");

    let pos = Position::new(9, 7.5);
    let mut opts = options(10, 1, 1);
    opts.quiet = false;
    let mut search = Search::new(Arc::new(UniformNetwork), opts, pos).expect("search");
    let writer = tg_logging::EventWriter::open(&path, tg_logging::WriterLimits::default())
        .expect("open log");
    search.set_event_writer(writer);
    search.think(Color::Black, PassFlags::NONE).expect("think");
    drop(search);

    let text = std::fs::read_to_string(&path).expect("read log");
    assert!(text.contains("\"event\":\"search_summary_v1\""));
    assert!(text.contains("\"chosen\""));
}

#[test]
fn ponder_grows_the_tree_and_keeps_it() {
    let pos = Position::new(9, 7.5);
    let mut search =
        Search::new(Arc::new(UniformNetwork), options(30, 2, 4), pos).expect("search");

    let halt = AtomicBool::new(false);
    search.ponder(&halt).expect("ponder");
    assert!(search.root_visits() >= 30);
    check_visit_invariants(search.root_node());
}
