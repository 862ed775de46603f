use super::connection::Connection;
use super::result::ResultSet;
use crate::error::{OdbcError, Result};
use std::fmt;

/// One transaction scope on a connection.
///
/// Scopes nest: only the outermost one switches auto-commit off and on, and
/// its final action decides what is persisted. A rollback in an inner scope
/// dooms the whole transaction. A scope dropped without `commit` or
/// `rollback` rolls back.
pub struct Transaction {
    connection: Connection,
    session: u64,
    finished: bool,
}

impl Transaction {
    pub fn begin(connection: &Connection) -> Result<Self> {
        let session = connection.lock()?.enter_transaction()?;
        Ok(Self {
            connection: connection.clone(),
            session,
            finished: false,
        })
    }

    fn finish(&mut self, action: &str) -> Result<()> {
        if self.finished {
            return Err(OdbcError::Programming(format!(
                "Cannot {}: transaction already finished",
                action
            )));
        }
        self.finished = true;
        Ok(())
    }

    /// Commits this scope. Inner scopes only close themselves; the outermost
    /// issues the native commit, or a rollback when an inner scope rolled
    /// back, reported as a programming error.
    pub fn commit(&mut self) -> Result<()> {
        self.finish("commit")?;
        self.connection.lock()?.commit_transaction(self.session)
    }

    /// Rolls back this scope. Native failures are logged, never returned.
    pub fn rollback(&mut self) -> Result<()> {
        self.finish("rollback")?;
        self.connection.lock()?.rollback_transaction(self.session);
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn execute(&self, sql: &str) -> Result<ResultSet> {
        self.connection.execute(sql)
    }

    pub fn just_execute(&self, sql: &str) -> Result<()> {
        self.connection.just_execute(sql)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("finished", &self.finished)
            .field("connection", &self.connection)
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log::warn!("Transaction dropped without commit - auto-rollback");
        match self.connection.lock() {
            Ok(mut conn) => conn.rollback_transaction(self.session),
            Err(e) => log::error!("Auto-rollback skipped: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDriver;
    use crate::driver::Driver;
    use std::sync::Arc;

    fn connect() -> (Arc<MemoryDriver>, Connection) {
        let memory = Arc::new(MemoryDriver::new());
        let driver: Arc<dyn Driver> = memory.clone();
        let conn = Connection::open(driver, "DSN=txn").unwrap();
        conn.just_execute("CREATE TABLE t (id INT)").unwrap();
        (memory, conn)
    }

    #[test]
    fn test_commit_persists() {
        let (memory, conn) = connect();
        let mut txn = conn.begin_transaction().unwrap();
        assert_eq!(conn.transactions(), 1);
        txn.just_execute("INSERT INTO t VALUES (1)").unwrap();
        txn.commit().unwrap();
        assert_eq!(conn.transactions(), 0);
        assert_eq!(memory.table_rows("t"), Some(1));
    }

    #[test]
    fn test_drop_rolls_back() {
        let (memory, conn) = connect();
        {
            let txn = conn.begin_transaction().unwrap();
            txn.just_execute("INSERT INTO t VALUES (1)").unwrap();
            assert_eq!(memory.table_rows("t"), Some(1));
        }
        assert_eq!(conn.transactions(), 0);
        assert_eq!(memory.table_rows("t"), Some(0));
    }

    #[test]
    fn test_double_commit_is_programming_error() {
        let (_m, conn) = connect();
        let mut txn = conn.begin_transaction().unwrap();
        txn.commit().unwrap();
        assert!(matches!(txn.commit(), Err(OdbcError::Programming(_))));
        assert!(matches!(txn.rollback(), Err(OdbcError::Programming(_))));
        assert!(txn.is_finished());
    }

    #[test]
    fn test_nested_commit_persists_only_with_outer() {
        let (memory, conn) = connect();
        let mut outer = conn.begin_transaction().unwrap();
        conn.just_execute("INSERT INTO t VALUES (1)").unwrap();
        {
            let mut inner = conn.begin_transaction().unwrap();
            assert_eq!(conn.transactions(), 2);
            conn.just_execute("INSERT INTO t VALUES (2)").unwrap();
            inner.commit().unwrap();
        }
        assert_eq!(conn.transactions(), 1);
        outer.commit().unwrap();
        assert_eq!(memory.table_rows("t"), Some(2));
    }

    #[test]
    fn test_inner_commit_then_outer_drop_rolls_back() {
        let (memory, conn) = connect();
        {
            let _outer = conn.begin_transaction().unwrap();
            conn.just_execute("INSERT INTO t VALUES (1)").unwrap();
            let mut inner = conn.begin_transaction().unwrap();
            inner.commit().unwrap();
        }
        assert_eq!(memory.table_rows("t"), Some(0));
    }

    #[test]
    fn test_inner_rollback_dooms_outer_commit() {
        let (memory, conn) = connect();
        let mut outer = conn.begin_transaction().unwrap();
        conn.just_execute("INSERT INTO t VALUES (1)").unwrap();
        let mut inner = conn.begin_transaction().unwrap();
        inner.rollback().unwrap();
        assert_eq!(memory.table_rows("t"), Some(1));
        let err = outer.commit().unwrap_err();
        assert!(matches!(err, OdbcError::Programming(ref m) if m.contains("inner scope")));
        assert_eq!(memory.table_rows("t"), Some(0));
        assert_eq!(conn.transactions(), 0);
    }

    #[test]
    fn test_disconnect_ends_open_scope() {
        let (memory, conn) = connect();
        let mut txn = conn.begin_transaction().unwrap();
        conn.just_execute("INSERT INTO t VALUES (1)").unwrap();
        conn.disconnect().unwrap();
        assert_eq!(conn.transactions(), 0);
        assert_eq!(memory.table_rows("t"), Some(0));
        assert!(matches!(txn.commit(), Err(OdbcError::Programming(_))));
    }

    #[test]
    fn test_scope_on_closed_connection_counts_only() {
        let memory = Arc::new(MemoryDriver::new());
        let driver: Arc<dyn Driver> = memory.clone();
        let conn = Connection::new(driver).unwrap();
        let mut txn = Transaction::begin(&conn).unwrap();
        assert_eq!(conn.transactions(), 1);
        txn.rollback().unwrap();
        assert_eq!(conn.transactions(), 0);
    }
}
