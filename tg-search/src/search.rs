//! The root search: simulation workers, tree reuse across root
//! advances, stopping rules and best-move selection.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering as MemOrder};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use tg_core::{Color, Move, Position};
use tg_logging::{now_ms, EventWriter, SearchProgressV1, SearchSummaryV1};

use crate::config::{SearchOptions, TimeManagement, UNLIMITED_PLAYOUTS};
use crate::network::{Network, NetworkError};
use crate::node::Node;
use crate::result::SimResult;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(2500);

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid search options: {msg}")]
    InvalidOptions { msg: &'static str },
    #[error("network evaluation failed: {0}")]
    Network(#[from] NetworkError),
}

/// Caller restrictions on the returned move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassFlags {
    pub no_pass: bool,
    pub no_resign: bool,
}

impl PassFlags {
    pub const NONE: PassFlags = PassFlags {
        no_pass: false,
        no_resign: false,
    };
}

/// State the simulation workers share with the main thread.
struct SearchShared {
    network: Arc<dyn Network>,
    score_head: bool,
    node_count: AtomicUsize,
    playouts: AtomicU32,
    run: AtomicBool,
    failure: Mutex<Option<SearchError>>,
}

impl SearchShared {
    fn is_running(&self, max_tree_size: usize) -> bool {
        self.run.load(MemOrder::Relaxed) && self.node_count.load(MemOrder::Relaxed) < max_tree_size
    }

    /// Prior cutoff for new children, tightening as the tree grows.
    fn min_psa_ratio(&self, opts: &SearchOptions) -> f32 {
        let mem_full = self.node_count.load(MemOrder::Relaxed) as f32 / opts.max_tree_size as f32;
        if mem_full > 0.95 {
            0.01
        } else if mem_full > 0.5 {
            0.001
        } else {
            0.0
        }
    }

    fn increment_playouts(&self) {
        self.playouts.fetch_add(1, MemOrder::Relaxed);
    }

    fn record_failure(&self, e: SearchError) {
        let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(e);
        }
        self.run.store(false, MemOrder::Relaxed);
    }

    fn take_failure(&self) -> Option<SearchError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// One full simulation: descend by PUCT under virtual loss, expand
    /// or score the leaf, back the value up the unwind path.
    fn play_simulation(
        &self,
        pos: &mut Position,
        node: &Arc<Node>,
        root: &Arc<Node>,
        opts: &SearchOptions,
    ) -> Result<SimResult, SearchError> {
        let color = pos.to_move();
        let mut result = SimResult::Invalid;
        node.virtual_loss();

        let descend = (|| -> Result<(), SearchError> {
            if node.expandable(0.0) {
                if pos.passes() >= 2 {
                    result = SimResult::from_score(pos.final_score());
                } else if self.node_count.load(MemOrder::Relaxed) < opts.max_tree_size {
                    let had_children = node.has_children();
                    let created = node.create_children(
                        &self.node_count,
                        pos,
                        self.network.as_ref(),
                        opts,
                        self.min_psa_ratio(opts),
                    )?;
                    if let Some(r) = created {
                        if !had_children {
                            result = r;
                        }
                    }
                }
            }

            if node.has_children() && !result.valid() {
                if let Some(next) = node.uct_select_child(color, Arc::ptr_eq(node, root), opts) {
                    let mv = next.mv();
                    pos.play_move(mv);
                    if mv != Move::Pass && pos.superko() {
                        // Unreachable by the rules; never descend here again.
                        next.invalidate();
                    } else {
                        result = self.play_simulation(pos, &next, root, opts)?;
                    }
                }
            }
            Ok(())
        })();

        if let Err(e) = descend {
            node.virtual_loss_undo();
            return Err(e);
        }

        if result.valid() {
            let eval = if self.score_head {
                result.eval_with_bonus(node.eval_bonus())
            } else {
                result.eval()
            };
            node.update(eval);
        }
        node.virtual_loss_undo();
        Ok(result)
    }
}

/// Background destruction of discarded subtrees, so a root advance does
/// not stall on freeing millions of nodes.
struct LazyReaper {
    tasks: Vec<thread::JoinHandle<()>>,
}

impl LazyReaper {
    fn new() -> LazyReaper {
        LazyReaper { tasks: Vec::new() }
    }

    fn retire(&mut self, subtree: Arc<Node>) {
        match thread::Builder::new()
            .name("tg-reaper".into())
            .spawn(move || drop(subtree))
        {
            Ok(handle) => self.tasks.push(handle),
            // Spawn failure drops the subtree inline instead.
            Err(_) => {}
        }
    }

    fn wait_all(&mut self) {
        for handle in self.tasks.drain(..) {
            let _ = handle.join();
        }
    }
}

pub struct Search {
    opts: SearchOptions,
    shared: SearchShared,
    root_position: Position,
    last_root_position: Option<Position>,
    root: Arc<Node>,
    reaper: LazyReaper,
    rng: ChaCha8Rng,
    events: Option<EventWriter>,
    max_playouts: u32,
    max_visits: u32,
}

impl Search {
    pub fn new(
        network: Arc<dyn Network>,
        opts: SearchOptions,
        position: Position,
    ) -> Result<Search, SearchError> {
        opts.validate()?;
        let score_head = network.has_score_head();
        let max_playouts = opts.playout_limit();
        let max_visits = opts.visit_limit();
        Ok(Search {
            rng: ChaCha8Rng::seed_from_u64(opts.seed),
            shared: SearchShared {
                network,
                score_head,
                node_count: AtomicUsize::new(0),
                playouts: AtomicU32::new(0),
                run: AtomicBool::new(false),
                failure: Mutex::new(None),
            },
            opts,
            root_position: position,
            last_root_position: None,
            root: Arc::new(Node::new(Move::Pass)),
            reaper: LazyReaper::new(),
            events: None,
            max_playouts,
            max_visits,
        })
    }

    /// Route progress and summary events to an NDJSON sink.
    pub fn set_event_writer(&mut self, writer: EventWriter) {
        self.events = Some(writer);
    }

    pub fn position(&self) -> &Position {
        &self.root_position
    }

    /// The game state the next `think` starts from. Playing moves here
    /// keeps the matching subtree alive across searches.
    pub fn position_mut(&mut self) -> &mut Position {
        &mut self.root_position
    }

    pub fn playouts(&self) -> u32 {
        self.shared.playouts.load(MemOrder::Relaxed)
    }

    pub fn node_count(&self) -> usize {
        self.shared.node_count.load(MemOrder::Relaxed)
    }

    pub fn root_visits(&self) -> u32 {
        self.root.visits()
    }

    pub(crate) fn root_node(&self) -> &Arc<Node> {
        &self.root
    }

    /// Search the current position for `color` and return the move to
    /// play. `passflag` restricts passing/resigning for cleanup modes.
    pub fn think(&mut self, color: Color, passflag: PassFlags) -> Result<Move, SearchError> {
        let start = Instant::now();
        self.update_root();
        self.root_position.set_to_move(color);
        let time_for_move = Duration::from_millis(self.opts.max_time_ms);

        self.prepare_root_node()?;
        if !self.root.has_children() {
            // Terminal root: the game is over, nothing to search.
            return Ok(Move::Pass);
        }

        let _ = self.shared.take_failure();
        self.shared.run.store(true, MemOrder::Relaxed);

        let root = Arc::clone(&self.root);
        let root_position = self.root_position.clone();
        let shared = &self.shared;
        let opts = &self.opts;
        let events = &mut self.events;
        let (max_playouts, max_visits) = (self.max_playouts, self.max_visits);

        thread::scope(|scope| {
            for _ in 1..opts.num_threads {
                let worker_root = Arc::clone(&root);
                let worker_position = &root_position;
                scope.spawn(move || {
                    while shared.is_running(opts.max_tree_size)
                        && !stop_thinking(
                            shared,
                            &worker_root,
                            max_playouts,
                            max_visits,
                            start.elapsed(),
                            time_for_move,
                        )
                    {
                        let mut sim_position = worker_position.clone();
                        match shared.play_simulation(
                            &mut sim_position,
                            &worker_root,
                            &worker_root,
                            opts,
                        ) {
                            Ok(r) => {
                                if r.valid() {
                                    shared.increment_playouts();
                                }
                            }
                            Err(e) => {
                                shared.record_failure(e);
                                break;
                            }
                        }
                    }
                });
            }

            let mut last_update = Duration::ZERO;
            loop {
                let elapsed = start.elapsed();
                if !shared.is_running(opts.max_tree_size)
                    || stop_thinking(shared, &root, max_playouts, max_visits, elapsed, time_for_move)
                    || !have_alternate_moves(
                        shared,
                        &root,
                        opts,
                        max_playouts,
                        max_visits,
                        elapsed,
                        time_for_move,
                    )
                {
                    break;
                }

                let mut sim_position = root_position.clone();
                match shared.play_simulation(&mut sim_position, &root, &root, opts) {
                    Ok(r) => {
                        if r.valid() {
                            shared.increment_playouts();
                        }
                    }
                    Err(e) => {
                        shared.record_failure(e);
                        break;
                    }
                }

                if !opts.quiet && elapsed.saturating_sub(last_update) > PROGRESS_INTERVAL {
                    last_update = elapsed;
                    emit_progress(events, shared, &root, &root_position);
                }
            }
            shared.run.store(false, MemOrder::Relaxed);
        });

        if let Some(e) = self.shared.take_failure() {
            return Err(e);
        }

        // Give pruned candidates their statistics back before choosing.
        self.root.with_children(|children| {
            for child in children {
                child.set_active(true);
            }
        });

        let best = self.get_best_move(passflag);
        self.emit_summary(start.elapsed(), best);
        self.last_root_position = Some(self.root_position.clone());
        Ok(best)
    }

    /// Keep searching on the opponent's time. Stops when `halt` is set
    /// or a budget is exhausted; the tree stays for the next `think`.
    pub fn ponder(&mut self, halt: &AtomicBool) -> Result<(), SearchError> {
        self.update_root();
        self.prepare_root_node()?;
        if !self.root.has_children() {
            return Ok(());
        }

        let _ = self.shared.take_failure();
        self.shared.run.store(true, MemOrder::Relaxed);

        let root = Arc::clone(&self.root);
        let root_position = self.root_position.clone();
        let shared = &self.shared;
        let opts = &self.opts;
        let (max_playouts, max_visits) = (self.max_playouts, self.max_visits);

        thread::scope(|scope| {
            for _ in 1..opts.num_threads {
                let worker_root = Arc::clone(&root);
                let worker_position = &root_position;
                scope.spawn(move || {
                    while shared.is_running(opts.max_tree_size) {
                        let mut sim_position = worker_position.clone();
                        match shared.play_simulation(
                            &mut sim_position,
                            &worker_root,
                            &worker_root,
                            opts,
                        ) {
                            Ok(r) => {
                                if r.valid() {
                                    shared.increment_playouts();
                                }
                            }
                            Err(e) => {
                                shared.record_failure(e);
                                break;
                            }
                        }
                    }
                });
            }

            while !halt.load(MemOrder::Relaxed)
                && shared.is_running(opts.max_tree_size)
                && shared.playouts.load(MemOrder::Relaxed) < max_playouts
                && root.visits() < max_visits
            {
                let mut sim_position = root_position.clone();
                match shared.play_simulation(&mut sim_position, &root, &root, opts) {
                    Ok(r) => {
                        if r.valid() {
                            shared.increment_playouts();
                        }
                    }
                    Err(e) => {
                        shared.record_failure(e);
                        break;
                    }
                }
            }
            shared.run.store(false, MemOrder::Relaxed);
        });

        if let Some(e) = self.shared.take_failure() {
            return Err(e);
        }
        self.last_root_position = Some(self.root_position.clone());
        Ok(())
    }

    /// Move the tree to the current position, or start a fresh root.
    fn update_root(&mut self) {
        self.shared.playouts.store(0, MemOrder::Relaxed);
        if !self.advance_to_new_rootstate() {
            self.root = Arc::new(Node::new(Move::Pass));
        }
        self.last_root_position = None;
        let nodes = self.root.count_nodes();
        self.shared.node_count.store(nodes, MemOrder::Relaxed);
    }

    /// Replay the moves between the previous root and the current one,
    /// promoting the matching child each time. Any mismatch discards
    /// the tree.
    fn advance_to_new_rootstate(&mut self) -> bool {
        let Some(last) = self.last_root_position.clone() else {
            return false;
        };
        if last.komi() != self.root_position.komi() {
            return false;
        }
        let depth = self.root_position.movenum() as i64 - last.movenum() as i64;
        if depth < 0 {
            return false;
        }

        let mut test = self.root_position.clone();
        for _ in 0..depth {
            if !test.undo_move() {
                return false;
            }
        }
        if last.hash() != test.hash() {
            return false;
        }

        // The node counter is only consistent once earlier teardown
        // tasks have finished.
        self.reaper.wait_all();

        let mut replay = last;
        for _ in 0..depth {
            if !test.forward_move() {
                return false;
            }
            let Some(mv) = test.last_move() else {
                return false;
            };
            let old_root = Arc::clone(&self.root);
            match old_root.take_child(mv) {
                Some(child) => {
                    self.root = child;
                    self.reaper.retire(old_root);
                }
                None => {
                    // Tree was never expanded this far.
                    self.root = Arc::new(Node::new(Move::Pass));
                    self.reaper.retire(old_root);
                    return false;
                }
            }
            replay.play_move(mv);
        }

        // Can still differ when one side played twice in a row.
        replay.hash() == test.hash()
    }

    fn prepare_root_node(&mut self) -> Result<(), SearchError> {
        let had_children = self.root.has_children();
        if self.root.expandable(0.0) {
            let created = self.root.create_children(
                &self.shared.node_count,
                &self.root_position,
                self.shared.network.as_ref(),
                &self.opts,
                0.0,
            )?;
            if let Some(result) = created {
                if !had_children {
                    let eval = if self.shared.score_head {
                        result.eval_with_bonus(self.root.eval_bonus())
                    } else {
                        result.eval()
                    };
                    self.root.update(eval);
                }
            }
        }
        if self.opts.noise && self.root.has_children() {
            self.root.apply_dirichlet_noise(
                self.opts.dirichlet_epsilon,
                self.opts.dirichlet_alpha,
                &mut self.rng,
            );
        }
        Ok(())
    }

    fn get_best_move(&mut self, passflag: PassFlags) -> Move {
        let color = self.root_position.to_move();
        self.root.sort_children(color);

        // Early-game randomization, but never into a resignation.
        if self.root_position.movenum() < self.opts.random_cnt
            && self.root.randomize_first_proportionally(&mut self.rng)
        {
            let first_eval = self
                .root
                .first_child_summary(color, 0.5)
                .map_or(0.5, |(_, _, e)| e);
            if self.should_resign(passflag, first_eval) {
                self.root.sort_children(color);
            }
        }

        let Some((mut best_move, _, mut best_score)) = self.root.first_child_summary(color, 0.5)
        else {
            return Move::Pass;
        };

        if passflag.no_pass {
            if best_move == Move::Pass {
                match self.root.nopass_child(&self.root_position) {
                    Some((mv, _, score)) => {
                        best_move = mv;
                        best_score = score;
                    }
                    // Pass is the only acceptable move.
                    None => {}
                }
            }
        } else if !self.opts.dumbpass {
            if best_move == Move::Pass {
                // Passing ends the game on the current count; never
                // pass out of a position the count says we lose.
                let score = self.root_position.final_score();
                if loses_on_count(color, score) {
                    if let Some((mv, _, s)) = self.root.nopass_child(&self.root_position) {
                        best_move = mv;
                        best_score = s;
                    }
                }
            } else if self.root_position.last_move() == Some(Move::Pass) {
                // The opponent passed; pass out ourselves when the
                // count already favors us.
                let score = self.root_position.final_score();
                if !loses_on_count(color, score) {
                    best_move = Move::Pass;
                }
            }
        }

        if best_move != Move::Pass && self.should_resign(passflag, best_score) {
            best_move = Move::Resign;
        }
        best_move
    }

    fn should_resign(&self, passflag: PassFlags, bestscore: f32) -> bool {
        if passflag.no_resign || self.opts.resignpct == 0 {
            return false;
        }

        let board_squares = self.root_position.board.num_squares();
        let movenum = self.root_position.movenum() as usize;
        if movenum <= board_squares / 4 {
            // Too early in the game to give up.
            return false;
        }

        let is_default = self.opts.resignpct < 0;
        let resign_threshold = 0.01 * if is_default { 10.0 } else { self.opts.resignpct as f32 };
        if bestscore > resign_threshold {
            return false;
        }

        let handicap = self.root_position.handicap();
        let color = self.root_position.to_move();
        if handicap > 0 && color == Color::White && is_default {
            let handicap_threshold = resign_threshold / (1.0 + handicap as f32);
            let blend_ratio = (movenum as f32 / (0.6 * board_squares as f32)).min(1.0);
            let blended =
                blend_ratio * resign_threshold + (1.0 - blend_ratio) * handicap_threshold;
            if bestscore > blended {
                // Let White fight on longer in handicap games.
                return false;
            }
        }
        true
    }

    fn emit_summary(&mut self, elapsed: Duration, chosen: Move) {
        if self.opts.quiet {
            return;
        }
        let Some(writer) = self.events.as_mut() else {
            return;
        };
        let playouts = self.shared.playouts.load(MemOrder::Relaxed);
        let seconds = elapsed.as_secs_f32().max(1e-3);
        let tree = self.root.tree_stats();
        let event = SearchSummaryV1 {
            event: SearchSummaryV1::EVENT,
            ts_ms: now_ms(),
            movenum: self.root_position.movenum(),
            chosen: self.root_position.board.move_to_text(chosen),
            visits: self.root.visits(),
            nodes: self.shared.node_count.load(MemOrder::Relaxed),
            playouts,
            playouts_per_s: playouts as f32 / seconds,
            black_winrate: self.root.eval(Color::Black),
            alpkt: self.root.net_alpkt(),
            beta: self.root.net_beta(),
            x_bar: self.root.eval_bonus(),
            avg_depth: tree.average_depth(),
            max_depth: tree.max_depth,
        };
        let _ = writer.append(&event);
    }
}

impl Drop for Search {
    fn drop(&mut self) {
        self.reaper.wait_all();
    }
}

fn loses_on_count(color: Color, score: f32) -> bool {
    (score > 0.0 && color == Color::White) || (score < 0.0 && color == Color::Black)
}

fn stop_thinking(
    shared: &SearchShared,
    root: &Arc<Node>,
    max_playouts: u32,
    max_visits: u32,
    elapsed: Duration,
    time_for_move: Duration,
) -> bool {
    shared.playouts.load(MemOrder::Relaxed) >= max_playouts
        || root.visits() >= max_visits
        || elapsed >= time_for_move
}

fn est_playouts_left(
    shared: &SearchShared,
    root: &Arc<Node>,
    max_playouts: u32,
    max_visits: u32,
    elapsed_centis: u32,
    time_centis: u32,
) -> u32 {
    let playouts = shared.playouts.load(MemOrder::Relaxed);
    let playouts_left = max_playouts
        .saturating_sub(playouts)
        .min(max_visits.saturating_sub(root.visits()));

    // Need a second and a hundred playouts for a reliable rate.
    if elapsed_centis < 100 || playouts < 100 {
        return playouts_left;
    }
    let playout_rate = playouts as f32 / elapsed_centis as f32;
    let time_left = time_centis.saturating_sub(elapsed_centis);
    playouts_left.min((playout_rate * time_left as f32).ceil() as u32)
}

/// Deactivate root children that can no longer catch up to the visit
/// leader within the remaining budget. Returns how many were pruned.
fn prune_noncontenders(
    shared: &SearchShared,
    root: &Arc<Node>,
    max_playouts: u32,
    max_visits: u32,
    elapsed_centis: u32,
    time_centis: u32,
) -> usize {
    let est_left = est_playouts_left(
        shared,
        root,
        max_playouts,
        max_visits,
        elapsed_centis,
        time_centis,
    );
    root.with_children(|children| {
        let mut leader = 0u32;
        for child in children {
            if child.valid() {
                leader = leader.max(child.visits());
            }
        }
        let min_required = leader.saturating_sub(est_left);
        let mut pruned = 0usize;
        for child in children {
            if child.valid() {
                let contender = child.visits() >= min_required;
                child.set_active(contender);
                if !contender {
                    pruned += 1;
                }
            }
        }
        pruned
    })
}

fn have_alternate_moves(
    shared: &SearchShared,
    root: &Arc<Node>,
    opts: &SearchOptions,
    max_playouts: u32,
    max_visits: u32,
    elapsed: Duration,
    time_for_move: Duration,
) -> bool {
    if opts.timemanage == TimeManagement::Off {
        return true;
    }
    let elapsed_centis = (elapsed.as_millis() / 10) as u32;
    let time_centis = (time_for_move.as_millis() / 10) as u32;
    let pruned = prune_noncontenders(
        shared,
        root,
        max_playouts,
        max_visits,
        elapsed_centis,
        time_centis,
    );
    if pruned < root.children_len().saturating_sub(1) {
        return true;
    }
    // Under a fixed playout budget there is no time to save up; only
    // fast management cuts forced moves short then.
    if max_playouts < UNLIMITED_PLAYOUTS && opts.timemanage != TimeManagement::Fast {
        return true;
    }
    false
}

fn emit_progress(
    events: &mut Option<EventWriter>,
    shared: &SearchShared,
    root: &Arc<Node>,
    pos: &Position,
) {
    let Some(writer) = events.as_mut() else {
        return;
    };
    let color = pos.to_move();
    let event = SearchProgressV1 {
        event: SearchProgressV1::EVENT,
        ts_ms: now_ms(),
        movenum: pos.movenum(),
        playouts: shared.playouts.load(MemOrder::Relaxed),
        visits: root.visits(),
        nodes: shared.node_count.load(MemOrder::Relaxed),
        winrate: root.eval(color),
        pv: principal_variation(root, pos),
    };
    let _ = writer.append(&event);
}

/// Follow most-visited children downwards and render the move line.
fn principal_variation(root: &Arc<Node>, pos: &Position) -> String {
    let mut line: Vec<String> = Vec::new();
    let mut color = pos.to_move();
    let mut node = Arc::clone(root);
    while let Some((mv, child)) = node.best_child_for_pv(color) {
        line.push(pos.board.move_to_text(mv));
        color = color.opponent();
        node = child;
        if line.len() >= 16 {
            break;
        }
    }
    line.join(" ")
}

