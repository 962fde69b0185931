//! Well-mixed reaction network with mass-action kinetics.
//!
//! State is a vector of integer species populations. Each reaction consumes
//! up to two reactants and produces up to two products; its propensity is a
//! function of the reactant populations only. Firing a reaction therefore
//! invalidates the propensities of a usually-small dependent set, which is
//! computed lazily per reaction and cached forever.

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, Row, Statement};
use tracing::info;

use crate::error::Error;
use crate::input::{read_rows, read_single_row, FromRow, ToRow};
use crate::simulation::Model;
use crate::solver::Update;

/// A mass-action reaction with up to two reactants and up to two products.
///
/// Only the first `number_of_reactants` entries of `reactants` (and likewise
/// for products) are meaningful; the tail carries whatever the input had.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reaction {
    pub number_of_reactants: u8,
    pub number_of_products: u8,
    pub reactants: [i32; 2],
    pub products: [i32; 2],
    pub rate: f64,
}

/// Reactions whose propensity may change when the owning reaction fires.
///
/// `dependents` stays empty until the reaction has fired `dependency_threshold`
/// times; reactions that rarely fire never pay for their dependent set.
#[derive(Debug, Default)]
struct DependentsNode {
    dependents: Option<Arc<Vec<usize>>>,
    number_of_occurrences: u64,
}

/// Model-specific knobs passed through from the command line.
#[derive(Debug, Clone, Copy)]
pub struct ReactionNetworkParameters {
    pub dependency_threshold: u64,
}

pub struct ReactionNetwork {
    pub reactions: Vec<Reaction>,
    pub initial_state: Vec<i64>,
    pub initial_propensities: Vec<f64>,
    /// Rate modifier for reactions with zero reactants.
    pub factor_zero: f64,
    /// Rate modifier for reactions with two reactants.
    pub factor_two: f64,
    /// Rate modifier for reactions of the form A + A -> ...
    pub factor_duplicate: f64,
    dependency_threshold: u64,
    /// One node per reaction, each behind its own lock so trajectories on
    /// different threads only contend when they fire the same reaction.
    dependency_graph: Vec<Mutex<DependentsNode>>,
}

impl ReactionNetwork {
    pub fn new(
        reactions: Vec<Reaction>,
        initial_state: Vec<i64>,
        factors: FactorsRow,
        dependency_threshold: u64,
    ) -> Self {
        let dependency_graph = (0..reactions.len())
            .map(|_| Mutex::new(DependentsNode::default()))
            .collect();

        let mut network = Self {
            reactions,
            initial_state,
            initial_propensities: Vec::new(),
            factor_zero: factors.factor_zero,
            factor_two: factors.factor_two,
            factor_duplicate: factors.factor_duplicate,
            dependency_threshold,
            dependency_graph,
        };

        let initial_propensities = (0..network.reactions.len())
            .map(|reaction_index| {
                network.compute_propensity(&network.initial_state, reaction_index)
            })
            .collect();
        network.initial_propensities = initial_propensities;

        network
    }

    pub fn from_database(
        reaction_database: &Connection,
        initial_state_database: &Connection,
        parameters: ReactionNetworkParameters,
    ) -> Result<Self, Error> {
        let metadata = read_single_row::<MetadataRow>(reaction_database, "metadata")?;
        let factors = read_single_row::<FactorsRow>(initial_state_database, "factors")?;

        let number_of_species = metadata.number_of_species as usize;
        let number_of_reactions = metadata.number_of_reactions as usize;

        let mut initial_state = vec![0i64; number_of_species];
        for row in read_rows::<InitialStateRow>(initial_state_database)? {
            initial_state[row.species_id as usize] = row.count;
        }

        let rows = read_rows::<ReactionRow>(reaction_database)?;
        let loaded = rows.len();
        let placeholder = Reaction {
            number_of_reactants: 0,
            number_of_products: 0,
            reactants: [0; 2],
            products: [0; 2],
            rate: 0.0,
        };
        let mut reactions = vec![placeholder; number_of_reactions];
        let mut last_reaction_id = 0;

        for row in rows {
            let reaction_id = row.reaction_id as usize;
            if reaction_id >= number_of_reactions {
                return Err(Error::ReactionCountMismatch {
                    expected: number_of_reactions,
                    last_id: reaction_id,
                    loaded,
                });
            }
            last_reaction_id = reaction_id;
            reactions[reaction_id] = Reaction {
                number_of_reactants: row.number_of_reactants as u8,
                number_of_products: row.number_of_products as u8,
                reactants: [row.reactant_1 as i32, row.reactant_2 as i32],
                products: [row.product_1 as i32, row.product_2 as i32],
                rate: row.rate,
            };
        }

        // The reactions table must be dense over 0..number_of_reactions.
        if loaded != number_of_reactions || last_reaction_id + 1 != number_of_reactions {
            return Err(Error::ReactionCountMismatch {
                expected: number_of_reactions,
                last_id: last_reaction_id,
                loaded,
            });
        }

        info!(
            reactions = number_of_reactions,
            species = number_of_species,
            "reaction network loaded"
        );

        Ok(Self::new(
            reactions,
            initial_state,
            factors,
            parameters.dependency_threshold,
        ))
    }

    /// Mass-action propensity of one reaction in the given state.
    ///
    /// Populations are widened to `f64` before multiplying, so two large
    /// populations cannot overflow on the way into the rate product. A pair
    /// of identical reactants contributes `n * (n - 1)` ordered pairs, scaled
    /// by `factor_duplicate` to let inputs correct for double counting.
    pub fn compute_propensity(&self, state: &[i64], reaction_index: usize) -> f64 {
        let reaction = &self.reactions[reaction_index];

        match reaction.number_of_reactants {
            0 => self.factor_zero * reaction.rate,
            1 => state[reaction.reactants[0] as usize] as f64 * reaction.rate,
            _ => {
                if reaction.reactants[0] == reaction.reactants[1] {
                    let population = state[reaction.reactants[0] as usize] as f64;
                    self.factor_duplicate
                        * self.factor_two
                        * population
                        * (population - 1.0)
                        * reaction.rate
                } else {
                    self.factor_two
                        * state[reaction.reactants[0] as usize] as f64
                        * state[reaction.reactants[1] as usize] as f64
                        * reaction.rate
                }
            }
        }
    }

    /// Consumes the reactants and produces the products of one firing,
    /// with multiplicity when a species appears in both slots.
    pub fn update_state(&self, state: &mut [i64], reaction_index: usize) {
        let reaction = &self.reactions[reaction_index];

        for species in &reaction.reactants[..reaction.number_of_reactants as usize] {
            state[*species as usize] -= 1;
        }
        for species in &reaction.products[..reaction.number_of_products as usize] {
            state[*species as usize] += 1;
        }
    }

    /// Returns the dependent set of a reaction, or `None` while it has not
    /// fired often enough to be worth computing.
    ///
    /// The node's counter is bumped on every call; the set is computed under
    /// the node's lock exactly once, on the first call at or past the
    /// threshold. Callers get a cheap `Arc` snapshot so the lock is never
    /// held while propensities are recomputed.
    pub fn get_dependency_node(&self, reaction_index: usize) -> Option<Arc<Vec<usize>>> {
        let mut node = self.dependency_graph[reaction_index]
            .lock()
            .expect("dependency node lock poisoned");

        if node.dependents.is_none() && node.number_of_occurrences >= self.dependency_threshold {
            node.dependents = Some(Arc::new(self.compute_dependents(reaction_index)));
        }
        node.number_of_occurrences += 1;

        node.dependents.clone()
    }

    /// Reactions whose propensity can move when `reaction_index` fires: those
    /// with a reactant among the fired reaction's reactants or products.
    fn compute_dependents(&self, reaction_index: usize) -> Vec<usize> {
        let fired = &self.reactions[reaction_index];

        self.reactions
            .iter()
            .enumerate()
            .filter(|(_, candidate)| Self::shares_species(candidate, fired))
            .map(|(dependent, _)| dependent)
            .collect()
    }

    fn shares_species(candidate: &Reaction, fired: &Reaction) -> bool {
        candidate.reactants[..candidate.number_of_reactants as usize]
            .iter()
            .any(|species| {
                fired.reactants[..fired.number_of_reactants as usize].contains(species)
                    || fired.products[..fired.number_of_products as usize].contains(species)
            })
    }

    /// Pushes fresh propensities for everything the firing of `next_reaction`
    /// may have touched. With a computed dependent set that is just the set;
    /// without one, every reaction is recomputed. Either way the updates are
    /// a superset of the propensities that actually changed.
    pub fn update_propensities(
        &self,
        mut update_function: impl FnMut(Update),
        state: &[i64],
        next_reaction: usize,
    ) {
        match self.get_dependency_node(next_reaction) {
            Some(dependents) => {
                for &reaction_index in dependents.iter() {
                    update_function(Update {
                        index: reaction_index,
                        propensity: self.compute_propensity(state, reaction_index),
                    });
                }
            }
            None => {
                for reaction_index in 0..self.reactions.len() {
                    update_function(Update {
                        index: reaction_index,
                        propensity: self.compute_propensity(state, reaction_index),
                    });
                }
            }
        }
    }
}

/// One firing as it lands in a trajectory's history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryElement {
    pub reaction_id: usize,
    pub time: f64,
}

impl Model for ReactionNetwork {
    type State = Vec<i64>;
    type Scratch = ();
    type HistoryElement = HistoryElement;
    type TrajectoryRow = TrajectoryRow;

    fn initial_state(&self) -> Vec<i64> {
        self.initial_state.clone()
    }

    fn new_scratch(&self) {}

    fn initial_propensities(&self, _scratch: &()) -> Vec<f64> {
        self.initial_propensities.clone()
    }

    fn update_state(&self, state: &mut Vec<i64>, _scratch: &mut (), reaction_index: usize) {
        self.update_state(state, reaction_index);
    }

    fn update_propensities<F: FnMut(Update)>(
        &self,
        update_function: F,
        state: &Vec<i64>,
        _scratch: &mut (),
        next_reaction: usize,
    ) {
        self.update_propensities(update_function, state, next_reaction);
    }

    fn history_element(
        &self,
        _scratch: &(),
        reaction_index: usize,
        _step: usize,
        time: f64,
    ) -> HistoryElement {
        HistoryElement {
            reaction_id: reaction_index,
            time,
        }
    }

    fn trajectory_row(&self, seed: u64, step: usize, element: &HistoryElement) -> TrajectoryRow {
        TrajectoryRow {
            seed: seed as i64,
            step: step as i64,
            reaction_id: element.reaction_id as i64,
            time: element.time,
        }
    }
}

// Row structs mirror the table columns one to one; the loader owns all
// narrowing casts.

#[derive(Debug, Clone, Copy)]
pub struct MetadataRow {
    pub number_of_species: i64,
    pub number_of_reactions: i64,
}

impl FromRow for MetadataRow {
    const SELECT: &'static str = "SELECT number_of_species, number_of_reactions FROM metadata;";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            number_of_species: row.get(0)?,
            number_of_reactions: row.get(1)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FactorsRow {
    pub factor_zero: f64,
    pub factor_two: f64,
    pub factor_duplicate: f64,
}

impl FromRow for FactorsRow {
    const SELECT: &'static str = "SELECT factor_zero, factor_two, factor_duplicate FROM factors;";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            factor_zero: row.get(0)?,
            factor_two: row.get(1)?,
            factor_duplicate: row.get(2)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InitialStateRow {
    pub species_id: i64,
    pub count: i64,
}

impl FromRow for InitialStateRow {
    const SELECT: &'static str = "SELECT species_id, count FROM initial_state;";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            species_id: row.get(0)?,
            count: row.get(1)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReactionRow {
    pub reaction_id: i64,
    pub number_of_reactants: i64,
    pub number_of_products: i64,
    pub reactant_1: i64,
    pub reactant_2: i64,
    pub product_1: i64,
    pub product_2: i64,
    pub rate: f64,
}

impl FromRow for ReactionRow {
    const SELECT: &'static str = "SELECT reaction_id, number_of_reactants, number_of_products, \
         reactant_1, reactant_2, product_1, product_2, rate FROM reactions;";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            reaction_id: row.get(0)?,
            number_of_reactants: row.get(1)?,
            number_of_products: row.get(2)?,
            reactant_1: row.get(3)?,
            reactant_2: row.get(4)?,
            product_1: row.get(5)?,
            product_2: row.get(6)?,
            rate: row.get(7)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrajectoryRow {
    pub seed: i64,
    pub step: i64,
    pub reaction_id: i64,
    pub time: f64,
}

impl ToRow for TrajectoryRow {
    const CREATE_TABLE: &'static str = "CREATE TABLE IF NOT EXISTS trajectories (\
         seed INTEGER NOT NULL, step INTEGER NOT NULL, \
         reaction_id INTEGER NOT NULL, time REAL NOT NULL);";

    const INSERT: &'static str =
        "INSERT INTO trajectories (seed, step, reaction_id, time) VALUES (?1, ?2, ?3, ?4);";

    fn insert(&self, statement: &mut Statement<'_>) -> rusqlite::Result<usize> {
        statement.execute(params![self.seed, self.step, self.reaction_id, self.time])
    }
}
