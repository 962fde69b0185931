//! Fans independent trajectories out over worker threads.
//!
//! Workers pull seeds from a shared queue and run one [`Simulation`] per
//! seed against the shared read-only model. Finished histories flow back
//! over a channel to the dispatcher, which is the only thing that touches
//! the database: it writes trajectory rows in batched transactions and
//! finally drops duplicate rows that interrupted earlier runs left behind.

use std::collections::VecDeque;
use std::sync::{mpsc, Mutex};
use std::thread;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::Error;
use crate::input::{RowWriter, ToRow};
use crate::simulation::{Model, Simulation};
use crate::solver::Solver;

/// One finished trajectory on its way to the database.
pub struct HistoryPacket<H> {
    pub seed: u64,
    pub history: Vec<H>,
}

/// Hands each trajectory seed to exactly one worker.
pub struct SeedQueue {
    seeds: Mutex<VecDeque<u64>>,
}

impl SeedQueue {
    pub fn new(number_of_simulations: u64, base_seed: u64) -> Self {
        Self {
            seeds: Mutex::new((base_seed..base_seed + number_of_simulations).collect()),
        }
    }

    pub fn next_seed(&self) -> Option<u64> {
        self.seeds
            .lock()
            .expect("seed queue lock poisoned")
            .pop_front()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherParameters {
    pub number_of_simulations: u64,
    pub base_seed: u64,
    pub thread_count: usize,
    pub step_cutoff: usize,
    pub time_cutoff: f64,
}

/// Runs every seed to completion and records the trajectories.
pub fn run_dispatcher<M, S>(
    model: &M,
    initial_state_database: &Connection,
    parameters: &DispatcherParameters,
) -> Result<(), Error>
where
    M: Model + Sync,
    S: Solver,
    M::HistoryElement: Send,
{
    initial_state_database.execute_batch(<M::TrajectoryRow as ToRow>::CREATE_TABLE)?;

    let seed_queue = SeedQueue::new(parameters.number_of_simulations, parameters.base_seed);
    let (sender, receiver) = mpsc::channel();

    thread::scope(|scope| {
        for _ in 0..parameters.thread_count {
            let sender = sender.clone();
            let seed_queue = &seed_queue;
            scope.spawn(move || {
                while let Some(seed) = seed_queue.next_seed() {
                    let mut simulation = Simulation::<M, S>::new(
                        model,
                        seed,
                        parameters.step_cutoff,
                        parameters.time_cutoff,
                    );
                    simulation.execute_steps(parameters.step_cutoff);
                    debug!(
                        seed,
                        steps = simulation.step,
                        time = simulation.time,
                        "trajectory finished"
                    );

                    let packet = HistoryPacket {
                        seed,
                        history: simulation.history,
                    };
                    if sender.send(packet).is_err() {
                        // The writer hung up; nothing left to record into.
                        break;
                    }
                }
            });
        }
        drop(sender);

        let mut writer = RowWriter::<M::TrajectoryRow>::new(initial_state_database)?;
        for packet in receiver {
            record_history(model, initial_state_database, &mut writer, &packet)?;
        }
        Ok::<(), Error>(())
    })?;

    // Interrupted or repeated runs can leave duplicate rows behind; keep the
    // first row per (seed, step).
    initial_state_database.execute_batch(
        "DELETE FROM trajectories WHERE rowid NOT IN \
         (SELECT MIN(rowid) FROM trajectories GROUP BY seed, step);",
    )?;

    Ok(())
}

fn record_history<M: Model>(
    model: &M,
    connection: &Connection,
    writer: &mut RowWriter<'_, M::TrajectoryRow>,
    packet: &HistoryPacket<M::HistoryElement>,
) -> Result<(), Error> {
    const TRANSACTION_SIZE: usize = 20_000;

    connection.execute_batch("BEGIN;")?;
    for (step, element) in packet.history.iter().enumerate() {
        writer.insert(&model.trajectory_row(packet.seed, step, element))?;
        if (step + 1) % TRANSACTION_SIZE == 0 {
            connection.execute_batch("COMMIT; BEGIN;")?;
        }
    }
    connection.execute_batch("COMMIT;")?;

    info!(
        seed = packet.seed,
        rows = packet.history.len(),
        "wrote trajectory"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::network::{FactorsRow, Reaction, ReactionNetwork};
    use crate::solver::LinearSolver;

    #[test]
    fn test_seed_queue_hands_out_each_seed_once() {
        let queue = SeedQueue::new(3, 100);
        let mut seeds = Vec::new();
        while let Some(seed) = queue.next_seed() {
            seeds.push(seed);
        }
        assert_eq!(seeds, vec![100, 101, 102]);
    }

    /// X -> nothing at rate 1 with ten copies of X: every trajectory fires
    /// exactly ten times.
    fn decay_network() -> ReactionNetwork {
        ReactionNetwork::new(
            vec![Reaction {
                number_of_reactants: 1,
                number_of_products: 0,
                reactants: [0, 0],
                products: [0, 0],
                rate: 1.0,
            }],
            vec![10],
            FactorsRow {
                factor_zero: 1.0,
                factor_two: 1.0,
                factor_duplicate: 1.0,
            },
            0,
        )
    }

    fn parameters() -> DispatcherParameters {
        DispatcherParameters {
            number_of_simulations: 4,
            base_seed: 17,
            thread_count: 2,
            step_cutoff: 100,
            time_cutoff: f64::INFINITY,
        }
    }

    #[test]
    fn test_dispatcher_records_every_trajectory() {
        let network = decay_network();
        let database_file = NamedTempFile::new().unwrap();

        let connection = Connection::open(database_file.path()).unwrap();
        run_dispatcher::<_, LinearSolver>(&network, &connection, &parameters()).unwrap();
        drop(connection);

        let reopened = Connection::open(database_file.path()).unwrap();
        let rows: i64 = reopened
            .query_row("SELECT COUNT(*) FROM trajectories;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 40);

        let seeds: i64 = reopened
            .query_row("SELECT COUNT(DISTINCT seed) FROM trajectories;", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(seeds, 4);

        let max_step: i64 = reopened
            .query_row("SELECT MAX(step) FROM trajectories;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(max_step, 9);
    }

    #[test]
    fn test_repeated_runs_leave_no_duplicates() {
        let network = decay_network();
        let database_file = NamedTempFile::new().unwrap();
        let connection = Connection::open(database_file.path()).unwrap();

        run_dispatcher::<_, LinearSolver>(&network, &connection, &parameters()).unwrap();
        run_dispatcher::<_, LinearSolver>(&network, &connection, &parameters()).unwrap();

        let rows: i64 = connection
            .query_row("SELECT COUNT(*) FROM trajectories;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 40);
    }
}
