//! Kinetic Monte Carlo simulation of stochastic reaction systems.
//!
//! Two model engines share a common driver and solver contract:
//!
//! - [`network`]: a well-mixed reaction network with mass-action kinetics on
//!   integer species populations and a lazily-computed reaction dependency
//!   graph.
//! - [`nanoparticle`]: a spatial model of site-indexed discrete states with
//!   one- and two-site interactions whose rates decay with distance.
//!
//! A [`simulation::Simulation`] couples one model to a stochastic event
//! [`solver::Solver`], advancing `(state, time, step)` until the solver runs
//! dry or a cutoff is reached. [`dispatcher::run_dispatcher`] fans many
//! independent seeds out over worker threads and records every trajectory
//! into a SQLite database.

pub mod dispatcher;
pub mod error;
pub mod input;
pub mod nanoparticle;
pub mod network;
pub mod simulation;
pub mod solver;

pub use error::Error;
