//! Spatial nanoparticle model.
//!
//! Sites sit at fixed positions in space and carry a discrete local state.
//! Interactions are abstract rules over one or two species; a reaction is an
//! interaction grounded on concrete sites, with two-site rates scaled by a
//! factor of the pairwise distance. Because a firing only touches one or two
//! sites, the model maintains a dense vector of live reactions plus a
//! per-site index into it, and regenerates just the neighborhood of the
//! affected sites after every step.

use std::collections::{BTreeSet, HashSet};
use std::ops::Range;

use itertools::iproduct;
use rusqlite::{params, Connection, Row, Statement};
use tracing::{error, info};

use crate::error::Error;
use crate::input::{read_rows, read_single_row, FromRow, ToRow};
use crate::simulation::Model;
use crate::solver::Update;

/// A point site with an immutable species assignment.
#[derive(Debug, Clone, Copy)]
pub struct Site {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub species_id: usize,
}

pub fn site_distance(a: Site, b: Site) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    let dz = a.z - b.z;
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// An abstract rule mapping the local states of one or two sites to new
/// states. For one-site interactions only the first entry of each array is
/// meaningful.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interaction {
    pub interaction_id: usize,
    pub number_of_sites: u8,
    pub species_id: [usize; 2],
    pub left_state: [usize; 2],
    pub right_state: [usize; 2],
    pub rate: f64,
}

/// An interaction grounded on concrete sites. The rate already folds in the
/// distance and interaction factors, so it is the propensity the solver sees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reaction {
    /// `site_id[1]` is -1 for one-site reactions.
    pub site_id: [i32; 2],
    pub interaction: Interaction,
    pub rate: f64,
}

/// How a two-site rate decays with the distance between its sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceFactor {
    /// `1 - d / radius_bound`, vanishing at the interaction radius.
    Linear,
    /// `1 / d^6`. The tag predates the move to a sixth-power falloff and is
    /// kept for input compatibility.
    InverseCubic,
}

impl DistanceFactor {
    pub fn parse(tag: &str) -> Result<Self, Error> {
        match tag {
            "linear" => Ok(Self::Linear),
            "inverse_cubic" => Ok(Self::InverseCubic),
            _ => Err(Error::UnknownDistanceFactor(tag.to_string())),
        }
    }

    pub fn evaluate(self, distance: f64, radius_bound: f64) -> f64 {
        match self {
            Self::Linear => 1.0 - distance / radius_bound,
            Self::InverseCubic => 1.0 / distance.powi(6),
        }
    }
}

/// Pairwise Euclidean distances, computed once at load.
#[derive(Debug, Clone)]
pub struct DistanceMatrix {
    number_of_sites: usize,
    distances: Vec<f64>,
}

impl DistanceMatrix {
    pub fn new(sites: &[Site]) -> Self {
        let number_of_sites = sites.len();
        let distances = iproduct!(0..number_of_sites, 0..number_of_sites)
            .map(|(i, j)| site_distance(sites[i], sites[j]))
            .collect();
        Self {
            number_of_sites,
            distances,
        }
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.distances[i * self.number_of_sites + j]
    }
}

/// One-site interactions bucketed by (species, state).
#[derive(Debug, Clone)]
struct OneSiteMap {
    number_of_states: usize,
    bins: Vec<Vec<Interaction>>,
}

impl OneSiteMap {
    fn new(number_of_species: usize, number_of_states: usize) -> Self {
        Self {
            number_of_states,
            bins: vec![Vec::new(); number_of_species * number_of_states],
        }
    }

    fn insert(&mut self, interaction: Interaction) {
        let bin = interaction.species_id[0] * self.number_of_states + interaction.left_state[0];
        self.bins[bin].push(interaction);
    }

    fn get(&self, species: usize, state: usize) -> &[Interaction] {
        &self.bins[species * self.number_of_states + state]
    }
}

/// Two-site interactions bucketed by (donor species, acceptor species,
/// donor state, acceptor state).
#[derive(Debug, Clone)]
struct TwoSiteMap {
    number_of_species: usize,
    number_of_states: usize,
    bins: Vec<Vec<Interaction>>,
}

impl TwoSiteMap {
    fn new(number_of_species: usize, number_of_states: usize) -> Self {
        let bin_count = number_of_species * number_of_species * number_of_states * number_of_states;
        Self {
            number_of_species,
            number_of_states,
            bins: vec![Vec::new(); bin_count],
        }
    }

    fn bin(&self, species_0: usize, species_1: usize, state_0: usize, state_1: usize) -> usize {
        ((species_0 * self.number_of_species + species_1) * self.number_of_states + state_0)
            * self.number_of_states
            + state_1
    }

    fn insert(&mut self, interaction: Interaction) {
        let bin = self.bin(
            interaction.species_id[0],
            interaction.species_id[1],
            interaction.left_state[0],
            interaction.left_state[1],
        );
        self.bins[bin].push(interaction);
    }

    fn get(&self, species_0: usize, species_1: usize, state_0: usize, state_1: usize) -> &[Interaction] {
        &self.bins[self.bin(species_0, species_1, state_0, state_1)]
    }
}

/// The live reaction set a single trajectory owns and rewrites as it runs.
///
/// Invariant between steps: `current_reactions` has no holes, and
/// `site_reaction_dependency[s]` holds exactly the slots of live reactions
/// that mention site `s`.
#[derive(Debug, Clone)]
pub struct LiveReactions {
    /// Slot-indexed; slot ids are what the solver sees as reaction indices.
    pub current_reactions: Vec<Reaction>,
    pub site_reaction_dependency: Vec<HashSet<usize>>,
}

/// Which slots changed during one regeneration pass, so the solver can be
/// resynced without a full rebuild.
#[derive(Debug, Default)]
pub struct SlotChanges {
    /// Slots now holding a live reaction (overwritten, appended or moved).
    pub rewritten: Vec<usize>,
    /// Former tail slots that fell off the end of the live vector.
    pub cleared: Range<usize>,
}

pub struct NanoParticle {
    /// Number of discrete local states per species.
    pub degrees_of_freedom: Vec<usize>,
    pub sites: Vec<Site>,
    pub distance_matrix: DistanceMatrix,
    one_site_map: OneSiteMap,
    two_site_map: TwoSiteMap,
    pub initial_state: Vec<usize>,
    pub initial_reactions: Vec<Reaction>,
    pub initial_site_reaction_dependency: Vec<HashSet<usize>>,
    pub one_site_interaction_factor: f64,
    pub two_site_interaction_factor: f64,
    pub interaction_radius_bound: f64,
    pub distance_factor: DistanceFactor,
}

impl NanoParticle {
    pub fn new(
        degrees_of_freedom: Vec<usize>,
        sites: Vec<Site>,
        interactions: Vec<Interaction>,
        initial_state: Vec<usize>,
        factors: FactorsRow,
    ) -> Result<Self, Error> {
        let distance_factor = DistanceFactor::parse(&factors.distance_factor_type)?;

        let number_of_species = degrees_of_freedom.len();
        let number_of_states = degrees_of_freedom.iter().copied().max().unwrap_or(0);

        let mut one_site_map = OneSiteMap::new(number_of_species, number_of_states);
        let mut two_site_map = TwoSiteMap::new(number_of_species, number_of_states);
        for interaction in &interactions {
            match interaction.number_of_sites {
                1 => one_site_map.insert(*interaction),
                _ => two_site_map.insert(*interaction),
            }
        }

        let distance_matrix = DistanceMatrix::new(&sites);
        let number_of_sites = sites.len();

        let mut particle = Self {
            degrees_of_freedom,
            sites,
            distance_matrix,
            one_site_map,
            two_site_map,
            initial_state,
            initial_reactions: Vec::new(),
            initial_site_reaction_dependency: vec![HashSet::new(); number_of_sites],
            one_site_interaction_factor: factors.one_site_interaction_factor,
            two_site_interaction_factor: factors.two_site_interaction_factor,
            interaction_radius_bound: factors.interaction_radius_bound,
            distance_factor,
        };
        particle.compute_initial_reactions();

        Ok(particle)
    }

    pub fn from_database(
        nano_particle_database: &Connection,
        initial_state_database: &Connection,
    ) -> Result<Self, Error> {
        let metadata = read_single_row::<MetadataRow>(nano_particle_database, "metadata")?;
        let factors = read_single_row::<FactorsRow>(initial_state_database, "factors")?;

        let number_of_sites = metadata.number_of_sites as usize;
        let number_of_species = metadata.number_of_species as usize;

        let mut degrees_of_freedom = vec![0; number_of_species];
        for row in read_rows::<SpeciesRow>(nano_particle_database)? {
            degrees_of_freedom[row.species_id as usize] = row.degrees_of_freedom as usize;
        }

        let placeholder = Site {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            species_id: 0,
        };
        let mut sites = vec![placeholder; number_of_sites];
        for row in read_rows::<SiteRow>(nano_particle_database)? {
            sites[row.site_id as usize] = Site {
                x: row.x,
                y: row.y,
                z: row.z,
                species_id: row.species_id as usize,
            };
        }

        // Interaction ids are dense in input order.
        let interaction_rows = read_rows::<InteractionRow>(nano_particle_database)?;
        let mut interactions = Vec::with_capacity(interaction_rows.len());
        for (interaction_id, row) in interaction_rows.iter().enumerate() {
            interactions.push(if row.number_of_sites == 1 {
                Interaction {
                    interaction_id,
                    number_of_sites: 1,
                    species_id: [row.species_id_1 as usize, 0],
                    left_state: [row.left_state_1 as usize, 0],
                    right_state: [row.right_state_1 as usize, 0],
                    rate: row.rate,
                }
            } else {
                Interaction {
                    interaction_id,
                    number_of_sites: 2,
                    species_id: [row.species_id_1 as usize, row.species_id_2 as usize],
                    left_state: [row.left_state_1 as usize, row.left_state_2 as usize],
                    right_state: [row.right_state_1 as usize, row.right_state_2 as usize],
                    rate: row.rate,
                }
            });
        }

        let mut initial_state = vec![0; number_of_sites];
        for row in read_rows::<InitialStateRow>(initial_state_database)? {
            initial_state[row.site_id as usize] = row.degree_of_freedom as usize;
        }

        info!(
            sites = number_of_sites,
            species = number_of_species,
            interactions = interactions.len(),
            "nanoparticle loaded"
        );

        Self::new(degrees_of_freedom, sites, interactions, initial_state, factors)
    }

    /// Grounds every interaction enabled by the initial state: one-site
    /// reactions per site, and both donor orientations for every pair of
    /// sites inside the interaction radius.
    fn compute_initial_reactions(&mut self) {
        let mut reactions = Vec::new();
        for site_id_0 in 0..self.sites.len() {
            self.one_site_reactions_at(&self.initial_state, site_id_0, &mut reactions);
            for site_id_1 in site_id_0 + 1..self.sites.len() {
                self.two_site_reactions_between(
                    &self.initial_state,
                    site_id_0,
                    site_id_1,
                    &mut reactions,
                );
                self.two_site_reactions_between(
                    &self.initial_state,
                    site_id_1,
                    site_id_0,
                    &mut reactions,
                );
            }
        }

        for (slot, reaction) in reactions.iter().enumerate() {
            for k in 0..reaction.interaction.number_of_sites as usize {
                self.initial_site_reaction_dependency[reaction.site_id[k] as usize].insert(slot);
            }
        }
        self.initial_reactions = reactions;
    }

    fn one_site_reactions_at(&self, state: &[usize], site_id: usize, out: &mut Vec<Reaction>) {
        let species_id = self.sites[site_id].species_id;
        for interaction in self.one_site_map.get(species_id, state[site_id]) {
            out.push(Reaction {
                site_id: [site_id as i32, -1],
                interaction: *interaction,
                rate: interaction.rate * self.one_site_interaction_factor,
            });
        }
    }

    /// Grounds the interactions with `donor` as the first site, gated on the
    /// pair sitting inside the interaction radius.
    fn two_site_reactions_between(
        &self,
        state: &[usize],
        donor: usize,
        acceptor: usize,
        out: &mut Vec<Reaction>,
    ) {
        let distance = self.distance_matrix.get(donor, acceptor);
        if distance >= self.interaction_radius_bound {
            return;
        }
        let factor = self.distance_factor.evaluate(distance, self.interaction_radius_bound);

        let interactions = self.two_site_map.get(
            self.sites[donor].species_id,
            self.sites[acceptor].species_id,
            state[donor],
            state[acceptor],
        );
        for interaction in interactions {
            out.push(Reaction {
                site_id: [donor as i32, acceptor as i32],
                interaction: *interaction,
                rate: factor * interaction.rate * self.two_site_interaction_factor,
            });
        }
    }

    /// Applies one firing to the state vector.
    ///
    /// The sites must still hold the interaction's left states; anything else
    /// means the solver and the live reaction set have desynced, which no
    /// amount of continuing can repair.
    pub fn update_state(&self, state: &mut [usize], reaction: &Reaction) {
        let interaction = &reaction.interaction;
        for k in 0..interaction.number_of_sites as usize {
            let site_id = reaction.site_id[k] as usize;
            if state[site_id] != interaction.left_state[k] {
                error!(
                    site_id,
                    expected = interaction.left_state[k],
                    found = state[site_id],
                    "state mismatch while applying a reaction"
                );
                panic!(
                    "state mismatch for site {site_id}: expected {}, found {}",
                    interaction.left_state[k], state[site_id]
                );
            }
            state[site_id] = interaction.right_state[k];
        }
    }

    /// Rebuilds the neighborhood of a fired reaction inside the live set.
    ///
    /// Every reaction mentioning an affected site is discarded and the
    /// enabled reactions around those sites are regenerated from the updated
    /// state. New reactions overwrite discarded slots where possible; any
    /// shortfall is filled by pulling live reactions down from the tail, so
    /// the vector stays dense and slot ids stay small.
    pub fn update_reactions(
        &self,
        state: &[usize],
        live: &mut LiveReactions,
        fired: &Reaction,
    ) -> SlotChanges {
        let mut new_reactions = Vec::new();
        for k in 0..fired.interaction.number_of_sites as usize {
            let site_id_0 = fired.site_id[k] as usize;
            let other_site_id = fired.site_id[1 - k];

            self.one_site_reactions_at(state, site_id_0, &mut new_reactions);

            for site_id_1 in 0..self.sites.len() {
                if site_id_1 == site_id_0 {
                    continue;
                }
                self.two_site_reactions_between(state, site_id_0, site_id_1, &mut new_reactions);
                // Each orientation of the pair made of the two affected sites
                // is emitted from exactly one of the two passes.
                if site_id_1 as i32 != other_site_id {
                    self.two_site_reactions_between(
                        state,
                        site_id_1,
                        site_id_0,
                        &mut new_reactions,
                    );
                }
            }
        }

        // Unhook every reaction that mentions an affected site from all of
        // its sites; the slots themselves are reused below.
        let mut reactions_to_remove = BTreeSet::new();
        for k in 0..fired.interaction.number_of_sites as usize {
            let site_id = fired.site_id[k] as usize;
            let dependent_slots: Vec<usize> =
                live.site_reaction_dependency[site_id].iter().copied().collect();
            for slot in dependent_slots {
                reactions_to_remove.insert(slot);
                let doomed = live.current_reactions[slot];
                live.site_reaction_dependency[doomed.site_id[0] as usize].remove(&slot);
                if doomed.interaction.number_of_sites == 2 {
                    live.site_reaction_dependency[doomed.site_id[1] as usize].remove(&slot);
                }
            }
        }

        let mut changes = SlotChanges::default();

        // Fill discarded slots, lowest first, with new reactions; append any
        // excess at the end.
        for new_reaction in new_reactions {
            let slot = match reactions_to_remove.pop_first() {
                Some(slot) => {
                    live.current_reactions[slot] = new_reaction;
                    slot
                }
                None => {
                    live.current_reactions.push(new_reaction);
                    live.current_reactions.len() - 1
                }
            };
            for k in 0..new_reaction.interaction.number_of_sites as usize {
                live.site_reaction_dependency[new_reaction.site_id[k] as usize].insert(slot);
            }
            changes.rewritten.push(slot);
        }

        // Any holes left over are filled from the high end of the vector,
        // then the stale tail is dropped.
        let length_before_truncate = live.current_reactions.len();
        let final_length = length_before_truncate - reactions_to_remove.len();
        if !reactions_to_remove.is_empty() {
            let mut source = length_before_truncate - 1;
            loop {
                let Some(&destination) = reactions_to_remove.first() else {
                    break;
                };
                if source <= destination {
                    // Everything from here up is stale and falls to truncate.
                    break;
                }
                if reactions_to_remove.remove(&source) {
                    source -= 1;
                    continue;
                }

                let moved = live.current_reactions[source];
                live.current_reactions[destination] = moved;
                reactions_to_remove.pop_first();
                for k in 0..moved.interaction.number_of_sites as usize {
                    let site_id = moved.site_id[k] as usize;
                    if !live.site_reaction_dependency[site_id].remove(&source) {
                        error!(
                            slot = source,
                            site_id, "live reaction missing from its site index during compaction"
                        );
                        panic!("reaction slot {source} missing from the index of site {site_id}");
                    }
                    live.site_reaction_dependency[site_id].insert(destination);
                }
                changes.rewritten.push(destination);
                source -= 1;
            }
            live.current_reactions.truncate(final_length);
        }
        changes.cleared = final_length..length_before_truncate;

        changes
    }
}

/// One firing as it lands in a trajectory's history. The grounded reaction
/// is copied out because its slot is recycled as soon as the step completes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryElement {
    pub reaction: Reaction,
    pub step: usize,
    pub time: f64,
}

impl Model for NanoParticle {
    type State = Vec<usize>;
    type Scratch = LiveReactions;
    type HistoryElement = HistoryElement;
    type TrajectoryRow = TrajectoryRow;

    fn initial_state(&self) -> Vec<usize> {
        self.initial_state.clone()
    }

    fn new_scratch(&self) -> LiveReactions {
        LiveReactions {
            current_reactions: self.initial_reactions.clone(),
            site_reaction_dependency: self.initial_site_reaction_dependency.clone(),
        }
    }

    fn initial_propensities(&self, scratch: &LiveReactions) -> Vec<f64> {
        scratch
            .current_reactions
            .iter()
            .map(|reaction| reaction.rate)
            .collect()
    }

    fn update_state(
        &self,
        state: &mut Vec<usize>,
        scratch: &mut LiveReactions,
        reaction_index: usize,
    ) {
        let reaction = scratch.current_reactions[reaction_index];
        self.update_state(state, &reaction);
    }

    fn update_propensities<F: FnMut(Update)>(
        &self,
        mut update_function: F,
        state: &Vec<usize>,
        scratch: &mut LiveReactions,
        next_reaction: usize,
    ) {
        let fired = scratch.current_reactions[next_reaction];
        let changes = self.update_reactions(state, scratch, &fired);

        for &slot in &changes.rewritten {
            update_function(Update {
                index: slot,
                propensity: scratch.current_reactions[slot].rate,
            });
        }
        for slot in changes.cleared {
            update_function(Update {
                index: slot,
                propensity: 0.0,
            });
        }
    }

    fn history_element(
        &self,
        scratch: &LiveReactions,
        reaction_index: usize,
        step: usize,
        time: f64,
    ) -> HistoryElement {
        HistoryElement {
            reaction: scratch.current_reactions[reaction_index],
            step,
            time,
        }
    }

    fn trajectory_row(&self, seed: u64, _step: usize, element: &HistoryElement) -> TrajectoryRow {
        TrajectoryRow {
            seed: seed as i64,
            step: element.step as i64,
            time: element.time,
            site_id_1: element.reaction.site_id[0],
            site_id_2: element.reaction.site_id[1],
            interaction_id: element.reaction.interaction.interaction_id as i64,
        }
    }
}

// Row structs mirror the table columns one to one; the loader owns all
// narrowing casts.

#[derive(Debug, Clone, Copy)]
pub struct MetadataRow {
    pub number_of_sites: i64,
    pub number_of_species: i64,
}

impl FromRow for MetadataRow {
    const SELECT: &'static str = "SELECT number_of_sites, number_of_species FROM metadata;";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            number_of_sites: row.get(0)?,
            number_of_species: row.get(1)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FactorsRow {
    pub one_site_interaction_factor: f64,
    pub two_site_interaction_factor: f64,
    pub interaction_radius_bound: f64,
    pub distance_factor_type: String,
}

impl FromRow for FactorsRow {
    const SELECT: &'static str = "SELECT one_site_interaction_factor, \
         two_site_interaction_factor, interaction_radius_bound, distance_factor_type \
         FROM factors;";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            one_site_interaction_factor: row.get(0)?,
            two_site_interaction_factor: row.get(1)?,
            interaction_radius_bound: row.get(2)?,
            distance_factor_type: row.get(3)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpeciesRow {
    pub species_id: i64,
    pub degrees_of_freedom: i64,
}

impl FromRow for SpeciesRow {
    const SELECT: &'static str = "SELECT species_id, degrees_of_freedom FROM species;";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            species_id: row.get(0)?,
            degrees_of_freedom: row.get(1)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SiteRow {
    pub site_id: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub species_id: i64,
}

impl FromRow for SiteRow {
    const SELECT: &'static str = "SELECT site_id, x, y, z, species_id FROM sites;";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            site_id: row.get(0)?,
            x: row.get(1)?,
            y: row.get(2)?,
            z: row.get(3)?,
            species_id: row.get(4)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InteractionRow {
    pub number_of_sites: i64,
    pub species_id_1: i64,
    pub species_id_2: i64,
    pub left_state_1: i64,
    pub left_state_2: i64,
    pub right_state_1: i64,
    pub right_state_2: i64,
    pub rate: f64,
}

impl FromRow for InteractionRow {
    const SELECT: &'static str = "SELECT number_of_sites, species_id_1, species_id_2, \
         left_state_1, left_state_2, right_state_1, right_state_2, rate FROM interactions;";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            number_of_sites: row.get(0)?,
            species_id_1: row.get(1)?,
            species_id_2: row.get(2)?,
            left_state_1: row.get(3)?,
            left_state_2: row.get(4)?,
            right_state_1: row.get(5)?,
            right_state_2: row.get(6)?,
            rate: row.get(7)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InitialStateRow {
    pub site_id: i64,
    pub degree_of_freedom: i64,
}

impl FromRow for InitialStateRow {
    const SELECT: &'static str = "SELECT site_id, degree_of_freedom FROM initial_state;";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            site_id: row.get(0)?,
            degree_of_freedom: row.get(1)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrajectoryRow {
    pub seed: i64,
    pub step: i64,
    pub time: f64,
    pub site_id_1: i32,
    pub site_id_2: i32,
    pub interaction_id: i64,
}

impl ToRow for TrajectoryRow {
    const CREATE_TABLE: &'static str = "CREATE TABLE IF NOT EXISTS trajectories (\
         seed INTEGER NOT NULL, step INTEGER NOT NULL, time REAL NOT NULL, \
         site_id_1 INTEGER NOT NULL, site_id_2 INTEGER NOT NULL, \
         interaction_id INTEGER NOT NULL);";

    const INSERT: &'static str = "INSERT INTO trajectories \
         (seed, step, time, site_id_1, site_id_2, interaction_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6);";

    fn insert(&self, statement: &mut Statement<'_>) -> rusqlite::Result<usize> {
        statement.execute(params![
            self.seed,
            self.step,
            self.time,
            self.site_id_1,
            self.site_id_2,
            self.interaction_id
        ])
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rusqlite::Connection;

    use super::*;

    fn linear_factors() -> FactorsRow {
        FactorsRow {
            one_site_interaction_factor: 1.0,
            two_site_interaction_factor: 1.0,
            interaction_radius_bound: 10.0,
            distance_factor_type: "linear".to_string(),
        }
    }

    fn site_at(x: f64, y: f64, z: f64) -> Site {
        Site {
            x,
            y,
            z,
            species_id: 0,
        }
    }

    fn one_site_interaction(interaction_id: usize, from: usize, to: usize, rate: f64) -> Interaction {
        Interaction {
            interaction_id,
            number_of_sites: 1,
            species_id: [0, 0],
            left_state: [from, 0],
            right_state: [to, 0],
            rate,
        }
    }

    fn two_site_interaction(
        interaction_id: usize,
        left: [usize; 2],
        right: [usize; 2],
        rate: f64,
    ) -> Interaction {
        Interaction {
            interaction_id,
            number_of_sites: 2,
            species_id: [0, 0],
            left_state: left,
            right_state: right,
            rate,
        }
    }

    /// Both directions of the per-site index invariant.
    fn assert_index_consistent(live: &LiveReactions) {
        for (slot, reaction) in live.current_reactions.iter().enumerate() {
            for k in 0..reaction.interaction.number_of_sites as usize {
                let site_id = reaction.site_id[k] as usize;
                assert!(
                    live.site_reaction_dependency[site_id].contains(&slot),
                    "slot {slot} missing from index of site {site_id}"
                );
            }
        }
        for (site_id, slots) in live.site_reaction_dependency.iter().enumerate() {
            for &slot in slots {
                assert!(slot < live.current_reactions.len(), "stale slot {slot}");
                let reaction = &live.current_reactions[slot];
                assert!(
                    (0..reaction.interaction.number_of_sites as usize)
                        .any(|k| reaction.site_id[k] as usize == site_id),
                    "slot {slot} indexed under site {site_id} it does not mention"
                );
            }
        }
    }

    #[test]
    fn test_distance_factor_parsing() {
        assert_eq!(DistanceFactor::parse("linear").unwrap(), DistanceFactor::Linear);
        assert_eq!(
            DistanceFactor::parse("inverse_cubic").unwrap(),
            DistanceFactor::InverseCubic
        );
        assert!(matches!(
            DistanceFactor::parse("quadratic"),
            Err(Error::UnknownDistanceFactor(_))
        ));
    }

    #[test]
    fn test_distance_factor_values() {
        assert_relative_eq!(DistanceFactor::Linear.evaluate(1.0, 10.0), 0.9);
        assert_relative_eq!(DistanceFactor::Linear.evaluate(10.0, 10.0), 0.0);
        assert_relative_eq!(DistanceFactor::InverseCubic.evaluate(2.0, 10.0), 1.0 / 64.0);
    }

    #[test]
    fn test_distance_matrix() {
        let matrix = DistanceMatrix::new(&[
            site_at(0.0, 0.0, 0.0),
            site_at(3.0, 4.0, 0.0),
        ]);
        assert_relative_eq!(matrix.get(0, 0), 0.0);
        assert_relative_eq!(matrix.get(0, 1), 5.0);
        assert_relative_eq!(matrix.get(1, 0), 5.0);
    }

    /// Two sites, one species with two states, a single 0 -> 1 flip.
    fn flip_model() -> NanoParticle {
        NanoParticle::new(
            vec![2],
            vec![site_at(0.0, 0.0, 0.0), site_at(1.0, 0.0, 0.0)],
            vec![one_site_interaction(0, 0, 1, 1.0)],
            vec![0, 0],
            linear_factors(),
        )
        .unwrap()
    }

    /// Two sites one unit apart sharing a (0,0) -> (1,1) pair interaction.
    fn pair_model() -> NanoParticle {
        NanoParticle::new(
            vec![2],
            vec![site_at(0.0, 0.0, 0.0), site_at(1.0, 0.0, 0.0)],
            vec![two_site_interaction(0, [0, 0], [1, 1], 1.0)],
            vec![0, 0],
            linear_factors(),
        )
        .unwrap()
    }

    #[test]
    fn test_one_site_firing_shrinks_live_set() {
        let particle = flip_model();
        assert_eq!(particle.initial_reactions.len(), 2);
        assert!(particle
            .initial_reactions
            .iter()
            .all(|reaction| reaction.site_id[1] == -1));

        let mut state = Model::initial_state(&particle);
        let mut live = particle.new_scratch();
        let fired_slot = 0;
        assert_eq!(live.current_reactions[fired_slot].site_id[0], 0);

        Model::update_state(&particle, &mut state, &mut live, fired_slot);
        assert_eq!(state, vec![1, 0]);

        let mut updates = Vec::new();
        Model::update_propensities(
            &particle,
            |update| updates.push(update),
            &state,
            &mut live,
            fired_slot,
        );

        // Site 0 has nothing left to do in state 1; site 1's flip moved down
        // into slot 0 and the old tail slot was cleared.
        assert_eq!(live.current_reactions.len(), 1);
        assert_eq!(live.current_reactions[0].site_id[0], 1);
        assert!(live.site_reaction_dependency[0].is_empty());
        assert_eq!(
            live.site_reaction_dependency[1],
            HashSet::from([0])
        );
        assert_index_consistent(&live);

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0], Update { index: 0, propensity: 1.0 });
        assert_eq!(updates[1], Update { index: 1, propensity: 0.0 });
    }

    #[test]
    fn test_pair_orientations_ground_once_each() {
        let particle = pair_model();

        assert_eq!(particle.initial_reactions.len(), 2);
        let pairs: Vec<[i32; 2]> = particle
            .initial_reactions
            .iter()
            .map(|reaction| reaction.site_id)
            .collect();
        assert!(pairs.contains(&[0, 1]));
        assert!(pairs.contains(&[1, 0]));
        for reaction in &particle.initial_reactions {
            assert_relative_eq!(reaction.rate, 0.9);
        }
        assert_eq!(
            particle.initial_site_reaction_dependency[0],
            HashSet::from([0, 1])
        );
    }

    #[test]
    fn test_pair_firing_empties_live_set() {
        let particle = pair_model();
        let mut state = Model::initial_state(&particle);
        let mut live = particle.new_scratch();

        Model::update_state(&particle, &mut state, &mut live, 0);
        assert_eq!(state, vec![1, 1]);

        let mut updates = Vec::new();
        Model::update_propensities(
            &particle,
            |update| updates.push(update),
            &state,
            &mut live,
            0,
        );

        assert!(live.current_reactions.is_empty());
        assert!(live.site_reaction_dependency[0].is_empty());
        assert!(live.site_reaction_dependency[1].is_empty());
        assert_eq!(
            updates,
            vec![
                Update { index: 0, propensity: 0.0 },
                Update { index: 1, propensity: 0.0 }
            ]
        );
    }

    #[test]
    fn test_sites_outside_radius_never_pair() {
        let particle = NanoParticle::new(
            vec![2],
            vec![
                site_at(0.0, 0.0, 0.0),
                site_at(1.0, 0.0, 0.0),
                site_at(100.0, 0.0, 0.0),
            ],
            vec![two_site_interaction(0, [0, 0], [1, 1], 1.0)],
            vec![0, 0, 0],
            linear_factors(),
        )
        .unwrap();

        let pairs: Vec<[i32; 2]> = particle
            .initial_reactions
            .iter()
            .map(|reaction| reaction.site_id)
            .collect();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&[0, 1]));
        assert!(pairs.contains(&[1, 0]));
        assert!(particle.initial_site_reaction_dependency[2].is_empty());
    }

    #[test]
    #[should_panic(expected = "state mismatch")]
    fn test_update_state_rejects_desynced_reaction() {
        let particle = flip_model();
        let reaction = particle.initial_reactions[0];
        let mut state = vec![1, 0];
        particle.update_state(&mut state, &reaction);
    }

    /// Four sites inside one radius, with flips in both directions plus pair
    /// interactions that fire forward, backward and sideways. Firing slots in
    /// a fixed pseudo-random order churns the live set through overwrites,
    /// appends, moves and truncations.
    #[test]
    fn test_regeneration_matches_rebuild_from_scratch() {
        let degrees_of_freedom = vec![2];
        let sites = vec![
            site_at(0.0, 0.0, 0.0),
            site_at(1.0, 0.0, 0.0),
            site_at(0.0, 1.0, 0.0),
            site_at(0.0, 0.0, 1.0),
        ];
        let interactions = vec![
            one_site_interaction(0, 0, 1, 1.0),
            one_site_interaction(1, 1, 0, 2.0),
            two_site_interaction(2, [0, 0], [1, 1], 1.0),
            two_site_interaction(3, [1, 1], [0, 0], 1.5),
            two_site_interaction(4, [0, 1], [1, 0], 3.0),
        ];
        let particle = NanoParticle::new(
            degrees_of_freedom.clone(),
            sites.clone(),
            interactions.clone(),
            vec![0, 0, 0, 0],
            linear_factors(),
        )
        .unwrap();

        let mut state = Model::initial_state(&particle);
        let mut live = particle.new_scratch();
        let mut shadow: Vec<f64> = Model::initial_propensities(&particle, &live);

        for step in 0..25 {
            assert!(!live.current_reactions.is_empty());
            let slot = (step * 7) % live.current_reactions.len();

            Model::update_state(&particle, &mut state, &mut live, slot);
            Model::update_propensities(
                &particle,
                |update: Update| {
                    if update.index >= shadow.len() {
                        shadow.resize(update.index + 1, 0.0);
                    }
                    shadow[update.index] = update.propensity;
                },
                &state,
                &mut live,
                slot,
            );

            assert_index_consistent(&live);

            // Exactly once per orientation: no duplicate groundings.
            let mut seen = HashSet::new();
            for reaction in &live.current_reactions {
                assert!(
                    seen.insert((reaction.site_id, reaction.interaction.interaction_id)),
                    "duplicate grounding of interaction {} on {:?}",
                    reaction.interaction.interaction_id,
                    reaction.site_id
                );
            }

            // The incrementally maintained set must equal a full rebuild
            // from the current state.
            let rebuilt = NanoParticle::new(
                degrees_of_freedom.clone(),
                sites.clone(),
                interactions.clone(),
                state.clone(),
                linear_factors(),
            )
            .unwrap();
            let key = |reaction: &Reaction| {
                (
                    reaction.site_id,
                    reaction.interaction.interaction_id,
                    reaction.rate.to_bits(),
                )
            };
            let mut live_keys: Vec<_> = live.current_reactions.iter().map(key).collect();
            let mut rebuilt_keys: Vec<_> = rebuilt.initial_reactions.iter().map(key).collect();
            live_keys.sort_unstable();
            rebuilt_keys.sort_unstable();
            assert_eq!(live_keys, rebuilt_keys, "divergence after step {step}");

            // The updates pushed so far must leave a solver holding exactly
            // the live rates, zero-padded past the end.
            for (slot, reaction) in live.current_reactions.iter().enumerate() {
                assert_eq!(shadow[slot], reaction.rate, "slot {slot} out of sync");
            }
            for &value in &shadow[live.current_reactions.len()..] {
                assert_eq!(value, 0.0);
            }
        }
    }

    fn nano_databases() -> (Connection, Connection) {
        let nano_particle_database = Connection::open_in_memory().unwrap();
        nano_particle_database
            .execute_batch(
                "CREATE TABLE metadata (number_of_sites INTEGER, number_of_species INTEGER);
                 CREATE TABLE species (species_id INTEGER, degrees_of_freedom INTEGER);
                 CREATE TABLE sites (site_id INTEGER, x REAL, y REAL, z REAL, species_id INTEGER);
                 CREATE TABLE interactions (number_of_sites INTEGER,
                     species_id_1 INTEGER, species_id_2 INTEGER,
                     left_state_1 INTEGER, left_state_2 INTEGER,
                     right_state_1 INTEGER, right_state_2 INTEGER, rate REAL);",
            )
            .unwrap();

        let initial_state_database = Connection::open_in_memory().unwrap();
        initial_state_database
            .execute_batch(
                "CREATE TABLE factors (one_site_interaction_factor REAL,
                     two_site_interaction_factor REAL, interaction_radius_bound REAL,
                     distance_factor_type TEXT);
                 CREATE TABLE initial_state (site_id INTEGER, degree_of_freedom INTEGER);",
            )
            .unwrap();

        (nano_particle_database, initial_state_database)
    }

    #[test]
    fn test_load_from_database() {
        let (nano_particle_database, initial_state_database) = nano_databases();
        nano_particle_database
            .execute_batch(
                "INSERT INTO metadata VALUES (2, 1);
                 INSERT INTO species VALUES (0, 2);
                 INSERT INTO sites VALUES (0, 0.0, 0.0, 0.0, 0);
                 INSERT INTO sites VALUES (1, 1.0, 0.0, 0.0, 0);
                 INSERT INTO interactions VALUES (2, 0, 0, 0, 0, 1, 1, 1.0);",
            )
            .unwrap();
        initial_state_database
            .execute_batch(
                "INSERT INTO factors VALUES (1.0, 1.0, 10.0, 'linear');
                 INSERT INTO initial_state VALUES (0, 0);
                 INSERT INTO initial_state VALUES (1, 0);",
            )
            .unwrap();

        let particle =
            NanoParticle::from_database(&nano_particle_database, &initial_state_database).unwrap();

        assert_eq!(particle.sites.len(), 2);
        assert_eq!(particle.degrees_of_freedom, vec![2]);
        assert_eq!(particle.initial_state, vec![0, 0]);
        assert_relative_eq!(particle.distance_matrix.get(0, 1), 1.0);
        assert_eq!(particle.initial_reactions.len(), 2);
        for reaction in &particle.initial_reactions {
            assert_relative_eq!(reaction.rate, 0.9);
        }
    }

    #[test]
    fn test_load_rejects_unknown_distance_factor() {
        let (nano_particle_database, initial_state_database) = nano_databases();
        nano_particle_database
            .execute("INSERT INTO metadata VALUES (0, 0);", [])
            .unwrap();
        initial_state_database
            .execute(
                "INSERT INTO factors VALUES (1.0, 1.0, 10.0, 'quadratic');",
                [],
            )
            .unwrap();

        let result =
            NanoParticle::from_database(&nano_particle_database, &initial_state_database);
        assert!(matches!(result, Err(Error::UnknownDistanceFactor(tag)) if tag == "quadratic"));
    }

    #[test]
    fn test_load_rejects_missing_factors() {
        let (nano_particle_database, initial_state_database) = nano_databases();
        nano_particle_database
            .execute("INSERT INTO metadata VALUES (0, 0);", [])
            .unwrap();

        let result =
            NanoParticle::from_database(&nano_particle_database, &initial_state_database);
        assert!(matches!(result, Err(Error::MissingRow("factors"))));
    }
}
