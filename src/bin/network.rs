//! Command-line front end for the well-mixed reaction-network model.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use rusqlite::{Connection, OpenFlags};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use kmc::dispatcher::{run_dispatcher, DispatcherParameters};
use kmc::network::{ReactionNetwork, ReactionNetworkParameters};
use kmc::solver::{LinearSolver, TreeSolver};

#[derive(Parser)]
#[command(
    name = "kmc-network",
    about = "Kinetic Monte Carlo over a well-mixed reaction network"
)]
struct Cli {
    /// SQLite database holding the metadata and reactions tables.
    #[arg(long)]
    reaction_database: PathBuf,

    /// SQLite database holding factors and the initial state; trajectories
    /// are written back into it.
    #[arg(long)]
    initial_state_database: PathBuf,

    #[arg(long)]
    number_of_simulations: u64,

    #[arg(long, default_value_t = 1)]
    base_seed: u64,

    #[arg(long, default_value_t = 1)]
    thread_count: usize,

    /// Stop a trajectory after this many steps.
    #[arg(long)]
    step_cutoff: usize,

    /// Stop a trajectory once its simulated time crosses this value.
    #[arg(long, default_value_t = f64::INFINITY)]
    time_cutoff: f64,

    /// Firings before a reaction's dependent set is worth computing.
    #[arg(long, default_value_t = 0)]
    dependency_threshold: u64,

    #[arg(long, value_enum, default_value = "linear")]
    solver: SolverChoice,
}

#[derive(Clone, Copy, ValueEnum)]
enum SolverChoice {
    Linear,
    Tree,
}

fn run(cli: &Cli) -> Result<(), kmc::Error> {
    let reaction_database = Connection::open_with_flags(
        &cli.reaction_database,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let initial_state_database = Connection::open(&cli.initial_state_database)?;

    let network = ReactionNetwork::from_database(
        &reaction_database,
        &initial_state_database,
        ReactionNetworkParameters {
            dependency_threshold: cli.dependency_threshold,
        },
    )?;

    let parameters = DispatcherParameters {
        number_of_simulations: cli.number_of_simulations,
        base_seed: cli.base_seed,
        thread_count: cli.thread_count,
        step_cutoff: cli.step_cutoff,
        time_cutoff: cli.time_cutoff,
    };
    info!(
        simulations = parameters.number_of_simulations,
        threads = parameters.thread_count,
        "dispatching trajectories"
    );

    match cli.solver {
        SolverChoice::Linear => {
            run_dispatcher::<_, LinearSolver>(&network, &initial_state_database, &parameters)
        }
        SolverChoice::Tree => {
            run_dispatcher::<_, TreeSolver>(&network, &initial_state_database, &parameters)
        }
    }
}

fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(error) = run(&cli) {
        error!(%error, "simulation failed");
        std::process::exit(1);
    }
}
