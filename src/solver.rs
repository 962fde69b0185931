//! Stochastic event selection.
//!
//! A solver owns the propensity of every reaction slot and answers one
//! question: which reaction fires next, and after how long? Models never see
//! the solver directly; they push [`Update`]s through a callback supplied by
//! the simulation driver, so a model compiles independently of the solver
//! driving it.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;

/// A reaction picked to fire, together with the waiting time before it does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub index: usize,
    pub dt: f64,
}

/// A propensity change pushed from a model into a solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Update {
    pub index: usize,
    pub propensity: f64,
}

/// The contract between the simulation driver and a concrete event picker.
///
/// `event` draws the waiting time first and the reaction second, so two
/// solvers seeded identically walk through identical event sequences. A
/// solver is owned by exactly one trajectory and is not thread-safe.
pub trait Solver {
    fn new(seed: u64, initial_propensities: &[f64]) -> Self;

    /// Draws the next event, or `None` when the total propensity is zero.
    ///
    /// `dt` is exponentially distributed with rate equal to the total
    /// propensity; the index is picked with probability proportional to its
    /// propensity.
    fn event(&mut self) -> Option<Event>;

    /// Sets the propensity of one reaction slot, growing the slot range when
    /// the index points past the end.
    fn update(&mut self, update: Update);
}

/// Direct-method solver with a flat propensity vector.
///
/// Selection walks the whole vector, so both `event` and the total propensity
/// are O(n). Fine for small models and the reference to check the tree
/// solver against.
pub struct LinearSolver {
    rng: ChaChaRng,
    propensities: Vec<f64>,
}

impl Solver for LinearSolver {
    fn new(seed: u64, initial_propensities: &[f64]) -> Self {
        Self {
            rng: ChaChaRng::seed_from_u64(seed),
            propensities: initial_propensities.to_vec(),
        }
    }

    fn event(&mut self) -> Option<Event> {
        let total: f64 = self.propensities.iter().sum();
        if total <= 0.0 {
            return None;
        }

        let dt = (1.0 / self.rng.gen::<f64>()).ln() / total;

        let target = self.rng.gen::<f64>() * total;
        let mut index = self.propensities.len() - 1;
        let mut cumulative = 0.0;
        for (i, propensity) in self.propensities.iter().enumerate() {
            cumulative += propensity;
            if target < cumulative {
                index = i;
                break;
            }
        }

        Some(Event { index, dt })
    }

    fn update(&mut self, update: Update) {
        if update.index >= self.propensities.len() {
            self.propensities.resize(update.index + 1, 0.0);
        }
        self.propensities[update.index] = update.propensity;
    }
}

/// Solver backed by a binary sum tree over the propensities.
///
/// The root caches the total, so selection descends in O(log n) and an update
/// rewrites one leaf-to-root path. Leaves are padded to a power of two;
/// updates past the leaf range trigger a rebuild at the next size up.
pub struct TreeSolver {
    rng: ChaChaRng,
    number_of_leaves: usize,
    number_of_reactions: usize,
    /// 1-based heap layout: `tree[1]` is the root, leaves start at
    /// `tree[number_of_leaves]`.
    tree: Vec<f64>,
}

impl TreeSolver {
    fn build(propensities: &[f64]) -> (usize, Vec<f64>) {
        let number_of_leaves = propensities.len().next_power_of_two().max(1);
        let mut tree = vec![0.0; 2 * number_of_leaves];
        tree[number_of_leaves..number_of_leaves + propensities.len()]
            .copy_from_slice(propensities);
        for node in (1..number_of_leaves).rev() {
            tree[node] = tree[2 * node] + tree[2 * node + 1];
        }
        (number_of_leaves, tree)
    }
}

impl Solver for TreeSolver {
    fn new(seed: u64, initial_propensities: &[f64]) -> Self {
        let (number_of_leaves, tree) = Self::build(initial_propensities);
        Self {
            rng: ChaChaRng::seed_from_u64(seed),
            number_of_leaves,
            number_of_reactions: initial_propensities.len(),
            tree,
        }
    }

    fn event(&mut self) -> Option<Event> {
        let total = self.tree[1];
        if total <= 0.0 {
            return None;
        }

        let dt = (1.0 / self.rng.gen::<f64>()).ln() / total;

        let mut target = self.rng.gen::<f64>() * total;
        let mut node = 1;
        while node < self.number_of_leaves {
            let left = 2 * node;
            if target < self.tree[left] {
                node = left;
            } else {
                target -= self.tree[left];
                node = left + 1;
            }
        }

        // Rounding in the descent can spill into the zero-padded tail; clamp
        // back onto a real slot.
        let index = (node - self.number_of_leaves).min(self.number_of_reactions - 1);
        Some(Event { index, dt })
    }

    fn update(&mut self, update: Update) {
        if update.index >= self.number_of_leaves {
            let mut propensities = self.tree
                [self.number_of_leaves..self.number_of_leaves + self.number_of_reactions]
                .to_vec();
            propensities.resize(update.index + 1, 0.0);
            let (number_of_leaves, tree) = Self::build(&propensities);
            self.number_of_leaves = number_of_leaves;
            self.tree = tree;
        }
        self.number_of_reactions = self.number_of_reactions.max(update.index + 1);

        let mut node = self.number_of_leaves + update.index;
        self.tree[node] = update.propensity;
        while node > 1 {
            node /= 2;
            self.tree[node] = self.tree[2 * node] + self.tree[2 * node + 1];
        }
    }
}
