//! Search-tree nodes.
//!
//! Statistics are atomics so simulations never lock to read or update
//! them; the per-node mutex guards only the children vector and the
//! expansion handshake. Children start deflated (move, prior, status in
//! a couple of words) and are inflated to full nodes the first time
//! selection walks through them.

use std::cmp::Ordering;
use std::sync::atomic::{
    AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering as MemOrder,
};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use rand::Rng;
use rand_distr::{Distribution, Gamma};

use tg_core::{Color, Move, Position};

use crate::blend;
use crate::config::SearchOptions;
use crate::network::{Network, NetworkError, Symmetry};
use crate::result::SimResult;

/// Pending-visit units added to a node while a simulation is in flight
/// below it, steering concurrent workers onto other paths.
pub const VIRTUAL_LOSS_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeStatus {
    Active = 0,
    Pruned = 1,
    Invalid = 2,
}

impl NodeStatus {
    fn from_u8(v: u8) -> NodeStatus {
        match v {
            0 => NodeStatus::Active,
            1 => NodeStatus::Pruned,
            _ => NodeStatus::Invalid,
        }
    }
}

/// Cached network readout for one node, Black's perspective throughout.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetEval {
    /// Win probability; the score-head logistic at zero offset when a
    /// score head is present, the raw value otherwise.
    pub net_value: f32,
    /// Score estimate with komi already subtracted.
    pub net_alpkt: f32,
    pub net_beta: f32,
    /// Mean winrate over the tempered offset interval.
    pub agent_eval: f32,
    /// Exploration offset handed to children during backup.
    pub eval_bonus: f32,
    /// Anchor offset for the stored value.
    pub eval_base: f32,
}

pub struct Node {
    mv: Move,
    visits: AtomicU32,
    /// f64 bit pattern; updated by a CAS loop.
    black_evals: AtomicU64,
    virtual_loss: AtomicU32,
    evals: OnceLock<NetEval>,
    /// f32 bit pattern. 2.0 until expanded; the ratio used for the
    /// children cutoff afterwards (0.0 when nothing was skipped).
    min_psa_ratio_children: AtomicU32,
    is_expanding: AtomicBool,
    status: AtomicU8,
    children: Mutex<Vec<NodePointer>>,
}

impl Node {
    pub fn new(mv: Move) -> Node {
        Node {
            mv,
            visits: AtomicU32::new(0),
            black_evals: AtomicU64::new(0f64.to_bits()),
            virtual_loss: AtomicU32::new(0),
            evals: OnceLock::new(),
            min_psa_ratio_children: AtomicU32::new(2.0f32.to_bits()),
            is_expanding: AtomicBool::new(false),
            status: AtomicU8::new(NodeStatus::Active as u8),
            children: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn mv(&self) -> Move {
        self.mv
    }

    #[inline]
    pub fn visits(&self) -> u32 {
        self.visits.load(MemOrder::Relaxed)
    }

    #[inline]
    pub fn first_visit(&self) -> bool {
        self.visits() == 0
    }

    fn lock_children(&self) -> MutexGuard<'_, Vec<NodePointer>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn min_psa_ratio(&self) -> f32 {
        f32::from_bits(self.min_psa_ratio_children.load(MemOrder::Acquire))
    }

    fn set_min_psa_ratio(&self, ratio: f32) {
        self.min_psa_ratio_children
            .store(ratio.to_bits(), MemOrder::Release);
    }

    /// Expanded iff the children cutoff has been established.
    #[inline]
    pub fn has_children(&self) -> bool {
        self.min_psa_ratio() <= 1.0
    }

    /// A call with a lower ratio than the stored one may still grow the
    /// children set.
    #[inline]
    pub fn expandable(&self, min_psa_ratio: f32) -> bool {
        min_psa_ratio < self.min_psa_ratio()
    }

    pub fn virtual_loss(&self) {
        self.virtual_loss
            .fetch_add(VIRTUAL_LOSS_COUNT, MemOrder::Relaxed);
    }

    pub fn virtual_loss_undo(&self) {
        self.virtual_loss
            .fetch_sub(VIRTUAL_LOSS_COUNT, MemOrder::Relaxed);
    }

    /// Record one completed simulation through this node.
    pub fn update(&self, eval: f32) {
        self.visits.fetch_add(1, MemOrder::Relaxed);
        self.accumulate_eval(eval);
    }

    fn accumulate_eval(&self, eval: f32) {
        let mut current = self.black_evals.load(MemOrder::Relaxed);
        loop {
            let next = (f64::from_bits(current) + eval as f64).to_bits();
            match self.black_evals.compare_exchange_weak(
                current,
                next,
                MemOrder::Relaxed,
                MemOrder::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
    }

    pub fn black_evals(&self) -> f64 {
        f64::from_bits(self.black_evals.load(MemOrder::Relaxed))
    }

    /// Mean simulation value seen from `color`. Virtual losses count as
    /// losses for the side on move, so in-flight paths look worse.
    pub fn eval(&self, color: Color) -> f32 {
        let virtual_loss = self.virtual_loss.load(MemOrder::Relaxed);
        let visits = self.visits() + virtual_loss;
        if visits == 0 {
            return 0.5;
        }
        let mut black_evals = self.black_evals();
        if color == Color::White {
            black_evals += virtual_loss as f64;
        }
        let mean = (black_evals / visits as f64) as f32;
        match color {
            Color::Black => mean,
            Color::White => 1.0 - mean,
        }
    }

    pub fn net_eval(&self, color: Color) -> f32 {
        let v = self.evals.get().map_or(0.5, |e| e.net_value);
        flip_for(color, v)
    }

    pub fn agent_eval(&self, color: Color) -> f32 {
        let v = self.evals.get().map_or(0.5, |e| e.agent_eval);
        flip_for(color, v)
    }

    pub fn eval_bonus(&self) -> f32 {
        self.evals.get().map_or(0.0, |e| e.eval_bonus)
    }

    pub fn eval_base(&self) -> f32 {
        self.evals.get().map_or(0.0, |e| e.eval_base)
    }

    pub fn net_alpkt(&self) -> f32 {
        self.evals.get().map_or(0.0, |e| e.net_alpkt)
    }

    pub fn net_beta(&self) -> f32 {
        self.evals.get().map_or(1.0, |e| e.net_beta)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(MemOrder::Relaxed))
    }

    pub fn valid(&self) -> bool {
        self.status() != NodeStatus::Invalid
    }

    pub fn active(&self) -> bool {
        self.status() == NodeStatus::Active
    }

    /// Mark unreachable (superko descendant). Irreversible.
    pub fn invalidate(&self) {
        self.status.store(NodeStatus::Invalid as u8, MemOrder::Relaxed);
    }

    /// Toggle between active and pruned; invalid nodes stay invalid.
    pub fn set_active(&self, active: bool) {
        let next = if active {
            NodeStatus::Active
        } else {
            NodeStatus::Pruned
        };
        if self.valid() {
            self.status.store(next as u8, MemOrder::Relaxed);
        }
    }

    /// Evaluate this node with the network and attach children for the
    /// legal moves whose prior clears `min_psa_ratio`.
    ///
    /// Returns the evaluation wrapped as a simulation result when this
    /// call performed the expansion, `None` when someone else did (or
    /// the position is terminal). The network runs outside the lock;
    /// concurrent descents stall on this node's virtual loss meanwhile.
    pub fn create_children(
        &self,
        node_count: &AtomicUsize,
        pos: &Position,
        network: &dyn Network,
        opts: &SearchOptions,
        min_psa_ratio: f32,
    ) -> Result<Option<SimResult>, NetworkError> {
        if !self.expandable(min_psa_ratio) {
            return Ok(None);
        }
        {
            let _children = self.lock_children();
            if pos.passes() >= 2 {
                return Ok(None);
            }
            if !self.expandable(min_psa_ratio) {
                return Ok(None);
            }
            if self.is_expanding.load(MemOrder::Acquire) {
                return Ok(None);
            }
            self.is_expanding.store(true, MemOrder::Release);
        }

        let raw = match network.evaluate(pos, Symmetry::Random) {
            Ok(r) => r,
            Err(e) => {
                self.is_expanding.store(false, MemOrder::Release);
                return Err(e);
            }
        };
        let squares = pos.board.num_squares();
        if raw.policy.len() != squares {
            self.is_expanding.store(false, MemOrder::Release);
            return Err(NetworkError::Malformed("policy length does not match board"));
        }

        let to_move = pos.to_move();
        let black_to_move = to_move == Color::Black;
        // The network evaluates for the side to move; the tree
        // accumulates everything from Black's perspective.
        let value = if black_to_move {
            raw.value
        } else {
            1.0 - raw.value
        };

        let (net, result) = match raw.score_head {
            Some(head) => {
                let alpkt = if black_to_move { head.alpha } else { -head.alpha } - pos.komi();
                let b = blend::blend(alpkt, head.beta, opts.lambda, opts.mu);
                (
                    NetEval {
                        net_value: b.pi,
                        net_alpkt: alpkt,
                        net_beta: head.beta,
                        agent_eval: b.agent_eval,
                        eval_bonus: b.bonus,
                        eval_base: b.base,
                    },
                    SimResult::from_eval(value, alpkt, head.beta),
                )
            }
            None => (
                NetEval {
                    net_value: value,
                    net_alpkt: 0.0,
                    net_beta: 1.0,
                    agent_eval: value,
                    eval_bonus: 0.0,
                    eval_base: 0.0,
                },
                SimResult::from_eval(value, 0.0, 1.0),
            ),
        };
        // Re-expansions keep the first readout.
        let _ = self.evals.set(net);

        let mut nodelist: Vec<(f32, Move)> = Vec::with_capacity(squares + 1);
        let mut legal_sum = 0.0f32;
        for i in 0..squares {
            let vertex = pos.board.vertex_from_index(i) as u16;
            if pos.is_move_legal(to_move, Move::Vertex(vertex)) {
                nodelist.push((raw.policy[i], Move::Vertex(vertex)));
                legal_sum += raw.policy[i];
            }
        }
        nodelist.push((raw.policy_pass, Move::Pass));
        legal_sum += raw.policy_pass;

        if legal_sum > f32::MIN_POSITIVE {
            for entry in &mut nodelist {
                entry.0 /= legal_sum;
            }
        } else {
            // Freshly initialized nets can zero out every legal move.
            let uniform = 1.0 / nodelist.len() as f32;
            for entry in &mut nodelist {
                entry.0 = uniform;
            }
        }

        self.link_nodelist(node_count, nodelist, min_psa_ratio);
        Ok(Some(result))
    }

    fn link_nodelist(
        &self,
        node_count: &AtomicUsize,
        mut nodelist: Vec<(f32, Move)>,
        min_psa_ratio: f32,
    ) {
        // Best first; the sort is stable so equal priors keep the
        // enumeration order with pass at the end.
        nodelist.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut children = self.lock_children();
        let old_ratio = self.min_psa_ratio();
        debug_assert!(min_psa_ratio < old_ratio);
        let max_psa = nodelist[0].0;
        let old_min_psa = max_psa * old_ratio;
        let new_min_psa = max_psa * min_psa_ratio;
        if new_min_psa > 0.0 {
            let keep = nodelist.iter().filter(|n| n.0 >= new_min_psa).count();
            children.reserve(keep);
        } else {
            children.reserve(nodelist.len());
        }

        let mut skipped = false;
        for (prior, mv) in nodelist {
            if prior < new_min_psa {
                skipped = true;
            } else if prior < old_min_psa {
                // Children at or above the old cutoff are already here.
                children.push(NodePointer::new(mv, prior));
                node_count.fetch_add(1, MemOrder::Relaxed);
            }
        }

        self.set_min_psa_ratio(if skipped { min_psa_ratio } else { 0.0 });
        self.is_expanding.store(false, MemOrder::Release);
    }

    /// PUCT child selection; inflates and returns the winner.
    ///
    /// Returns `None` when every child is pruned or invalid.
    pub fn uct_select_child(
        &self,
        color: Color,
        is_root: bool,
        opts: &SearchOptions,
    ) -> Option<Arc<Node>> {
        let children = self.lock_children();

        let mut parent_visits = 0u64;
        let mut total_visited_policy = 0.0f32;
        for child in children.iter() {
            if child.valid() {
                let v = child.visits();
                parent_visits += v as u64;
                if v > 0 {
                    total_visited_policy += child.prior();
                }
            }
        }
        let numerator = (parent_visits as f64).sqrt();

        let fpu_eval = if opts.fpu_zero || (is_root && opts.noise) {
            0.5
        } else {
            let reduction = opts.fpu_reduction * total_visited_policy.sqrt();
            (self.agent_eval(color) - reduction).clamp(0.0, 1.0)
        };

        let mut best: Option<&NodePointer> = None;
        let mut best_value = f64::MIN;
        for child in children.iter() {
            if !child.active() {
                continue;
            }
            let winrate = if child.visits() > 0 {
                child.eval_or(fpu_eval, color)
            } else {
                fpu_eval
            };
            let denom = 1.0 + child.visits() as f64;
            let puct = opts.c_puct as f64 * child.prior() as f64 * (numerator / denom);
            let value = winrate as f64 + puct;
            if value > best_value {
                best_value = value;
                best = Some(child);
            }
        }

        best.map(|b| Arc::clone(b.inflate()))
    }

    /// Mix root Dirichlet noise into the children priors.
    pub(crate) fn apply_dirichlet_noise(&self, epsilon: f32, alpha: f32, rng: &mut impl Rng) {
        let mut children = self.lock_children();
        if children.is_empty() {
            return;
        }
        let gamma = match Gamma::new(alpha as f64, 1.0) {
            Ok(g) => g,
            Err(_) => return,
        };
        let noise: Vec<f64> = children.iter().map(|_| gamma.sample(rng)).collect();
        let total: f64 = noise.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return;
        }
        for (child, eta) in children.iter_mut().zip(noise.iter()) {
            let p = child.prior() * (1.0 - epsilon) + epsilon * (*eta / total) as f32;
            child.set_prior(p);
        }
    }

    /// Move a child to the front with probability proportional to its
    /// visits. Returns true when that changed the best move.
    pub(crate) fn randomize_first_proportionally(&self, rng: &mut impl Rng) -> bool {
        let mut children = self.lock_children();
        let mut accum = 0f64;
        let cumulative: Vec<f64> = children
            .iter()
            .map(|c| {
                accum += c.visits() as f64;
                accum
            })
            .collect();
        if accum <= 0.0 {
            return false;
        }
        let pick = rng.gen_range(0.0..accum);
        let index = cumulative
            .iter()
            .position(|&edge| pick < edge)
            .unwrap_or(0);
        if index == 0 {
            return false;
        }
        let chosen = children.remove(index);
        children.insert(0, chosen);
        true
    }

    /// Stable descending sort by (visits, prior, eval).
    pub(crate) fn sort_children(&self, color: Color) {
        let mut children = self.lock_children();
        children.sort_by(|a, b| node_cmp(b, a, color));
    }

    pub fn with_children<R>(&self, f: impl FnOnce(&[NodePointer]) -> R) -> R {
        let children = self.lock_children();
        f(&children)
    }

    pub fn children_len(&self) -> usize {
        self.lock_children().len()
    }

    /// Detach the child that answers `mv`, inflating it if needed.
    pub(crate) fn take_child(&self, mv: Move) -> Option<Arc<Node>> {
        let mut children = self.lock_children();
        let index = children.iter().position(|c| c.mv() == mv)?;
        let pointer = children.swap_remove(index);
        Some(Arc::clone(pointer.inflate()))
    }

    /// Best-sorted first child stats: (move, visits, eval-or-default).
    pub(crate) fn first_child_summary(&self, color: Color, default_eval: f32) -> Option<(Move, u32, f32)> {
        let children = self.lock_children();
        children
            .first()
            .map(|c| (c.mv(), c.visits(), c.eval_or(default_eval, color)))
    }

    /// First non-pass child that would not fill one of our own eyes.
    /// Callers sort by visits beforehand. Unvisited children report an
    /// optimistic eval of 1.0.
    pub(crate) fn nopass_child(&self, pos: &Position) -> Option<(Move, u32, f32)> {
        let color = pos.to_move();
        let children = self.lock_children();
        for c in children.iter() {
            if let Move::Vertex(v) = c.mv() {
                if !pos.board.is_eye(color, v as usize) {
                    return Some((c.mv(), c.visits(), c.eval_or(1.0, color)));
                }
            }
        }
        None
    }

    /// Most-visited child for principal-variation walks.
    pub(crate) fn best_child_for_pv(&self, color: Color) -> Option<(Move, Arc<Node>)> {
        let children = self.lock_children();
        let best = children.iter().max_by(|a, b| node_cmp(a, b, color))?;
        if best.visits() == 0 {
            return None;
        }
        let node = Arc::clone(best.node()?);
        Some((best.mv(), node))
    }

    /// Depth and branching summary of the visited part of the subtree.
    pub fn tree_stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        self.tree_stats_at(0, &mut stats);
        stats
    }

    fn tree_stats_at(&self, depth: usize, stats: &mut TreeStats) {
        stats.nodes += 1;
        stats.non_leaf_nodes += usize::from(self.visits() > 1);
        stats.depth_sum += depth;
        stats.max_depth = stats.max_depth.max(depth);

        let children = self.lock_children();
        for child in children.iter() {
            if child.visits() > 0 {
                if let Some(node) = child.node() {
                    stats.children_count += 1;
                    node.tree_stats_at(depth + 1, stats);
                    continue;
                }
            }
            stats.nodes += 1;
            stats.depth_sum += depth + 1;
            stats.max_depth = stats.max_depth.max(depth + 1);
        }
    }

    /// Size of the subtree: every child pointer counts as a node, and
    /// visited children are descended into.
    pub fn count_nodes(&self) -> usize {
        let children = self.lock_children();
        let mut count = children.len();
        for child in children.iter() {
            if child.visits() > 0 {
                if let Some(node) = child.node() {
                    count += node.count_nodes();
                }
            }
        }
        count
    }
}

/// Aggregates collected by [`Node::tree_stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeStats {
    pub nodes: usize,
    pub non_leaf_nodes: usize,
    pub depth_sum: usize,
    pub max_depth: usize,
    pub children_count: usize,
}

impl TreeStats {
    pub fn average_depth(&self) -> f32 {
        if self.nodes == 0 {
            0.0
        } else {
            self.depth_sum as f32 / self.nodes as f32
        }
    }

    pub fn average_branching(&self) -> f32 {
        if self.non_leaf_nodes == 0 {
            0.0
        } else {
            self.children_count as f32 / self.non_leaf_nodes as f32
        }
    }
}

/// "Less-than" ordering on (visits, prior-if-unvisited, eval).
pub(crate) fn node_cmp(a: &NodePointer, b: &NodePointer, color: Color) -> Ordering {
    let (va, vb) = (a.visits(), b.visits());
    if va != vb {
        return va.cmp(&vb);
    }
    if va == 0 {
        return a
            .prior()
            .partial_cmp(&b.prior())
            .unwrap_or(Ordering::Equal);
    }
    a.eval_or(0.5, color)
        .partial_cmp(&b.eval_or(0.5, color))
        .unwrap_or(Ordering::Equal)
}

fn flip_for(color: Color, black_value: f32) -> f32 {
    match color {
        Color::Black => black_value,
        Color::White => 1.0 - black_value,
    }
}

/// Owning handle to a child.
///
/// Deflated, it records only the move, the prior and a status byte;
/// most children are never visited and stay this small. `inflate`
/// allocates the real node exactly once.
pub struct NodePointer {
    mv: Move,
    prior: f32,
    status: AtomicU8,
    inner: OnceLock<Arc<Node>>,
}

impl NodePointer {
    pub fn new(mv: Move, prior: f32) -> NodePointer {
        NodePointer {
            mv,
            prior,
            status: AtomicU8::new(NodeStatus::Active as u8),
            inner: OnceLock::new(),
        }
    }

    #[inline]
    pub fn mv(&self) -> Move {
        self.mv
    }

    #[inline]
    pub fn prior(&self) -> f32 {
        self.prior
    }

    /// Priors change only under the parent lock (root noise).
    pub fn set_prior(&mut self, prior: f32) {
        self.prior = prior;
    }

    /// Idempotent; the status accumulated while deflated carries over.
    pub fn inflate(&self) -> &Arc<Node> {
        self.inner.get_or_init(|| {
            let node = Node::new(self.mv);
            node.status
                .store(self.status.load(MemOrder::Relaxed), MemOrder::Relaxed);
            Arc::new(node)
        })
    }

    #[inline]
    pub fn node(&self) -> Option<&Arc<Node>> {
        self.inner.get()
    }

    pub fn visits(&self) -> u32 {
        self.node().map_or(0, |n| n.visits())
    }

    /// Mean eval from `color`'s view, or `default` while unvisited.
    pub fn eval_or(&self, default: f32, color: Color) -> f32 {
        match self.node() {
            Some(n) if n.visits() > 0 => n.eval(color),
            _ => default,
        }
    }

    pub fn status(&self) -> NodeStatus {
        match self.node() {
            Some(n) => n.status(),
            None => NodeStatus::from_u8(self.status.load(MemOrder::Relaxed)),
        }
    }

    pub fn valid(&self) -> bool {
        self.status() != NodeStatus::Invalid
    }

    pub fn active(&self) -> bool {
        self.status() == NodeStatus::Active
    }

    pub fn set_active(&self, active: bool) {
        match self.node() {
            Some(n) => n.set_active(active),
            None => {
                if NodeStatus::from_u8(self.status.load(MemOrder::Relaxed)) != NodeStatus::Invalid
                {
                    let next = if active {
                        NodeStatus::Active
                    } else {
                        NodeStatus::Pruned
                    };
                    self.status.store(next as u8, MemOrder::Relaxed);
                }
            }
        }
    }

    pub fn invalidate(&self) {
        match self.node() {
            Some(n) => n.invalidate(),
            None => self
                .status
                .store(NodeStatus::Invalid as u8, MemOrder::Relaxed),
        }
    }
}
