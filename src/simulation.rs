//! The step loop driving one trajectory.
//!
//! A [`Simulation`] owns everything a single seed needs: its state vector,
//! its solver, its per-trajectory scratch data and its history. The model is
//! shared read-only between trajectories; anything a firing mutates lives
//! here.

use crate::input::ToRow;
use crate::solver::{Solver, Update};

/// What the driver needs from a model engine.
///
/// `Scratch` is the per-trajectory mutable data beyond the state vector
/// itself (the nanoparticle model keeps its live reaction set there; the
/// reaction network needs none). Models never talk to the solver directly:
/// `update_propensities` hands every change to a caller-supplied callback, so
/// the model stays independent of the solver type.
pub trait Model {
    type State: Clone;
    type Scratch;
    type HistoryElement;
    type TrajectoryRow: ToRow;

    fn initial_state(&self) -> Self::State;

    fn new_scratch(&self) -> Self::Scratch;

    fn initial_propensities(&self, scratch: &Self::Scratch) -> Vec<f64>;

    /// Applies the firing of one reaction to the state vector.
    fn update_state(
        &self,
        state: &mut Self::State,
        scratch: &mut Self::Scratch,
        reaction_index: usize,
    );

    /// Delivers zero or more propensity [`Update`]s reflecting the firing of
    /// `next_reaction`, synchronously, before returning.
    fn update_propensities<F: FnMut(Update)>(
        &self,
        update_function: F,
        state: &Self::State,
        scratch: &mut Self::Scratch,
        next_reaction: usize,
    );

    /// Snapshot of one firing for the history, taken before the state and
    /// the reaction set are touched.
    fn history_element(
        &self,
        scratch: &Self::Scratch,
        reaction_index: usize,
        step: usize,
        time: f64,
    ) -> Self::HistoryElement;

    fn trajectory_row(
        &self,
        seed: u64,
        step: usize,
        element: &Self::HistoryElement,
    ) -> Self::TrajectoryRow;
}

/// One trajectory: a model coupled to a solver by the update callback.
pub struct Simulation<'a, M: Model, S: Solver> {
    pub model: &'a M,
    pub seed: u64,
    pub state: M::State,
    pub time: f64,
    pub time_cutoff: f64,
    /// Number of reactions that have fired so far.
    pub step: usize,
    pub solver: S,
    pub scratch: M::Scratch,
    pub history: Vec<M::HistoryElement>,
}

impl<'a, M: Model, S: Solver> Simulation<'a, M, S> {
    pub fn new(model: &'a M, seed: u64, step_cutoff: usize, time_cutoff: f64) -> Self {
        let scratch = model.new_scratch();
        let initial_propensities = model.initial_propensities(&scratch);

        Self {
            model,
            seed,
            state: model.initial_state(),
            time: 0.0,
            time_cutoff,
            step: 0,
            solver: S::new(seed, &initial_propensities),
            scratch,
            // One slack slot so the terminating step always records without
            // reallocating.
            history: Vec::with_capacity(step_cutoff + 1),
        }
    }

    /// Fires one reaction. Returns false when the trajectory is over: the
    /// solver has no event left, or the time cutoff has been crossed.
    pub fn execute_step(&mut self) -> bool {
        let Some(event) = self.solver.event() else {
            return false;
        };
        let model = self.model;

        self.time += event.dt;
        self.history
            .push(model.history_element(&self.scratch, event.index, self.step, self.time));
        self.step += 1;

        model.update_state(&mut self.state, &mut self.scratch, event.index);

        let solver = &mut self.solver;
        model.update_propensities(
            |update| solver.update(update),
            &self.state,
            &mut self.scratch,
            event.index,
        );

        self.time < self.time_cutoff
    }

    pub fn execute_steps(&mut self, step_cutoff: usize) {
        while self.execute_step() {
            if self.step > step_cutoff {
                break;
            }
        }
    }
}
