pub mod cell_reader;
pub mod connection;
pub mod result;
pub(crate) mod rowset;
pub mod statement;
pub mod transaction;

pub use cell_reader::{CellValue, FromCell};
pub use connection::Connection;
pub use result::ResultSet;
pub use statement::Statement;
pub use transaction::Transaction;

use crate::error::{OdbcError, Result};

/// Executes `sql` directly on `conn` and returns its result.
pub fn execute(conn: &Connection, sql: &str) -> Result<ResultSet> {
    conn.execute(sql)
}

pub fn just_execute(conn: &Connection, sql: &str) -> Result<()> {
    conn.just_execute(sql)
}

/// Prepares `sql` on `statement`.
pub fn prepare(statement: &Statement, sql: &str) -> Result<()> {
    statement.prepare(sql)
}

fn statement_connection(statement: &Statement) -> Result<Connection> {
    statement
        .connection()
        .ok_or_else(|| OdbcError::Programming("statement is not open".to_string()))
}

/// Executes the prepared `statement` for `batch` parameter sets inside a
/// transaction that commits on success.
pub fn transact(statement: &Statement, batch: usize) -> Result<ResultSet> {
    let conn = statement_connection(statement)?;
    let mut txn = conn.begin_transaction()?;
    let result = statement.execute_batch(batch)?;
    txn.commit()?;
    Ok(result)
}

pub fn just_transact(statement: &Statement, batch: usize) -> Result<()> {
    let conn = statement_connection(statement)?;
    let mut txn = conn.begin_transaction()?;
    statement.just_execute_batch(batch)?;
    txn.commit()
}
