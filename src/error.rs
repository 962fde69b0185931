use thiserror::Error;

/// Errors that can occur while loading a model or recording trajectories.
///
/// All of these are unrecoverable for the run that hits them: a model that
/// fails to load cannot be simulated, and a trajectory that fails to write
/// cannot be silently dropped.
#[derive(Debug, Error)]
pub enum Error {
    /// An error from the underlying SQLite database.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A table that must contain exactly one row (metadata, factors) was empty.
    #[error("no {0} row")]
    MissingRow(&'static str),

    /// The reactions table disagrees with the metadata row about how many
    /// reactions exist.
    #[error(
        "reaction loading failed: metadata says {expected} reactions, \
         last reaction_id is {last_id}, {loaded} rows loaded"
    )]
    ReactionCountMismatch {
        expected: usize,
        last_id: usize,
        loaded: usize,
    },

    /// The factors table names a distance factor this build does not know.
    #[error("unexpected distance_factor_type {0:?}, expecting linear or inverse_cubic")]
    UnknownDistanceFactor(String),
}
