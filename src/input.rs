//! Typed row access to the SQLite databases a simulation reads and writes.
//!
//! Each model defines plain row structs mirroring its table columns and wires
//! them up through [`FromRow`] / [`ToRow`]. The machinery here stays dumb on
//! purpose: a row type knows its own SQL, and the readers and writers just
//! move rows across the connection.

use std::marker::PhantomData;

use rusqlite::{Connection, Row, Statement};

use crate::error::Error;

/// A typed row that can be pulled out of its table with a fixed SELECT.
pub trait FromRow: Sized {
    /// Query returning this row type's columns, in `from_row` order.
    const SELECT: &'static str;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// A typed row that can be inserted into its table with a fixed INSERT.
pub trait ToRow {
    /// Creates the backing table when it does not exist yet.
    const CREATE_TABLE: &'static str;

    const INSERT: &'static str;

    fn insert(&self, statement: &mut Statement<'_>) -> rusqlite::Result<usize>;
}

/// Reads every row of `T`'s table into memory.
pub fn read_rows<T: FromRow>(connection: &Connection) -> Result<Vec<T>, Error> {
    let mut statement = connection.prepare(T::SELECT)?;
    let rows = statement.query_map([], T::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Reads the single row of `T`'s table, failing with [`Error::MissingRow`]
/// when the table is empty. Extra rows beyond the first are ignored.
pub fn read_single_row<T: FromRow>(
    connection: &Connection,
    what: &'static str,
) -> Result<T, Error> {
    read_rows(connection)?
        .into_iter()
        .next()
        .ok_or(Error::MissingRow(what))
}

/// An insert statement prepared once and reused for every row of `T`.
pub struct RowWriter<'conn, T: ToRow> {
    statement: Statement<'conn>,
    _row: PhantomData<T>,
}

impl<'conn, T: ToRow> RowWriter<'conn, T> {
    pub fn new(connection: &'conn Connection) -> Result<Self, Error> {
        Ok(Self {
            statement: connection.prepare(T::INSERT)?,
            _row: PhantomData,
        })
    }

    pub fn insert(&mut self, row: &T) -> Result<(), Error> {
        row.insert(&mut self.statement)?;
        Ok(())
    }
}
