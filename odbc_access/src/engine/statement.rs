use super::cell_reader::{decode, FromCell};
use super::connection::Connection;
use super::result::ResultSet;
use crate::async_bridge::{AsyncOperation, AsyncState};
use crate::config::{DEFAULT_COLUMN_FLOOR, DEFAULT_ROWSET_SIZE};
use crate::driver::{
    ColumnDescription, Driver, EventHandle, ParamDescription, RawHandle, SqlReturn,
};
use crate::error::{OdbcError, Result};
use crate::handles::HandleGuard;
use crate::observability::StructuredLogger;
use crate::protocol::{ParamBuffer, ParamDirection, Parameter};
use log::Level;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatementOp {
    Prepare,
    Execute,
    ExecuteDirect,
}

/// Column layout and counters of the result a statement currently exposes.
pub(crate) struct ResultShape {
    pub columns: Vec<ColumnDescription>,
    pub affected_rows: i64,
    pub generation: u64,
    pub rowset_size: usize,
    pub column_floor: usize,
}

fn not_open() -> OdbcError {
    OdbcError::Programming("statement is not open".to_string())
}

/// Shared state behind every alias of one [`Statement`].
pub(crate) struct StatementImpl {
    stmt: Option<HandleGuard>,
    connection: Option<Connection>,
    session: u64,
    sql: Option<String>,
    prepared: bool,
    param_count: Option<u16>,
    /// Sorted by parameter index.
    params: Vec<ParamBuffer>,
    rowset_size: usize,
    column_floor: usize,
    /// Bumped by every execution and by close; results remember the value
    /// they were produced under.
    generation: u64,
    async_op: AsyncOperation<StatementOp>,
    logger: StructuredLogger,
}

impl StatementImpl {
    fn new() -> Self {
        Self {
            stmt: None,
            connection: None,
            session: 0,
            sql: None,
            prepared: false,
            param_count: None,
            params: Vec::new(),
            rowset_size: DEFAULT_ROWSET_SIZE,
            column_floor: DEFAULT_COLUMN_FLOOR,
            generation: 0,
            async_op: AsyncOperation::new(),
            logger: StructuredLogger::default(),
        }
    }

    fn open(&mut self, conn: &Connection) -> Result<()> {
        self.async_op.ensure_idle()?;
        self.release();
        let (guard, session, settings) = conn.lock()?.open_statement()?;
        self.stmt = Some(guard);
        self.connection = Some(conn.clone());
        self.session = session;
        self.rowset_size = settings.rowset_size;
        self.column_floor = settings.column_floor;
        Ok(())
    }

    fn is_open_on(&self, conn: &Connection) -> bool {
        self.stmt.is_some()
            && self.connection.as_ref().is_some_and(|c| c.same_as(conn))
            && self.session_alive()
    }

    fn session_alive(&self) -> bool {
        self.connection
            .as_ref()
            .and_then(|c| c.lock().ok().map(|c| c.session_alive(self.session)))
            .unwrap_or(false)
    }

    /// The statement handle, provided its connection is still usable.
    fn guard(&self) -> Result<&HandleGuard> {
        let stmt = self.stmt.as_ref().ok_or_else(not_open)?;
        if !self.session_alive() {
            return Err(OdbcError::Programming("connection is not open".to_string()));
        }
        Ok(stmt)
    }

    fn native(&self) -> Result<(Arc<dyn Driver>, RawHandle)> {
        let guard = self.guard()?;
        Ok((Arc::clone(guard.driver()), guard.raw()))
    }

    fn check(&self, rc: SqlReturn, context: &str) -> Result<SqlReturn> {
        let stmt = self.stmt.as_ref().ok_or_else(not_open)?;
        stmt.check(rc, context).map_err(|e| {
            self.logger.log_failure(context, &e);
            e
        })
    }

    /// Releases the native bindings of the parameter buffers. Must run
    /// before a bound buffer is dropped or replaced.
    fn reset_native_params(&self) {
        if self.params.is_empty() {
            return;
        }
        let Some(stmt) = self.stmt.as_ref() else {
            return;
        };
        if !self.session_alive() {
            return;
        }
        let rc = stmt.driver().reset_parameters(stmt.raw());
        if !rc.is_success() {
            log::debug!("{}", stmt.describe("reset parameters"));
        }
    }

    fn clear_params(&mut self) {
        self.reset_native_params();
        self.params.clear();
    }

    /// Frees the statement handle. Handles of a disconnected session were
    /// already released by the driver and are only forgotten.
    fn release(&mut self) {
        self.generation += 1;
        self.prepared = false;
        self.param_count = None;
        let Some(stmt) = self.stmt.take() else {
            self.params.clear();
            return;
        };
        match self.connection.as_ref().map(Connection::lock) {
            Some(Ok(conn)) if conn.session_alive(self.session) => {
                if self.async_op.state() != AsyncState::Idle {
                    let rc = stmt.driver().cancel(stmt.raw());
                    if !rc.is_success() {
                        log::debug!("{}", stmt.describe("cancel before close"));
                    }
                    if let Err(e) = self.async_op.complete(&stmt) {
                        log::debug!("Discarding asynchronous statement on close: {}", e);
                    }
                }
                let rc = stmt.driver().close_cursor(stmt.raw());
                if !rc.is_success() {
                    log::debug!("{}", stmt.describe("close cursor"));
                }
                if !self.params.is_empty() {
                    let rc = stmt.driver().reset_parameters(stmt.raw());
                    if !rc.is_success() {
                        log::debug!("{}", stmt.describe("reset parameters"));
                    }
                }
                self.params.clear();
                drop(stmt);
                drop(conn);
            }
            _ => {
                self.async_op = AsyncOperation::new();
                stmt.abandon();
                self.params.clear();
            }
        }
    }

    /// Invalidates earlier results and closes any open cursor.
    fn begin_execution(&mut self, driver: &Arc<dyn Driver>, raw: RawHandle) {
        self.generation += 1;
        let rc = driver.close_cursor(raw);
        if !rc.is_success() {
            log::debug!("close cursor before execute returned {:?}", rc);
        }
    }

    fn prepare(&mut self, sql: &str) -> Result<()> {
        self.async_op.ensure_idle()?;
        let (driver, raw) = self.native()?;
        self.begin_execution(&driver, raw);
        self.prepared = false;
        self.clear_params();
        let rc = driver.prepare(raw, sql);
        self.check(rc, "prepare")?;
        self.sql = Some(sql.to_string());
        self.after_prepare()
    }

    fn after_prepare(&mut self) -> Result<()> {
        let (driver, raw) = self.native()?;
        let mut count = 0u16;
        let rc = driver.num_params(raw, &mut count);
        self.check(rc, "count parameters")?;
        self.prepared = true;
        self.param_count = Some(count);
        self.clear_params();
        Ok(())
    }

    /// Rows per parameter set: the requested batch, or the longest bound
    /// array. Every bound array must cover it.
    fn paramset_size(&self, batch: Option<usize>) -> Result<usize> {
        let longest = self.params.iter().map(ParamBuffer::len).max().unwrap_or(1);
        let size = match batch {
            Some(0) => {
                return Err(OdbcError::Programming(
                    "batch size must be at least 1".to_string(),
                ))
            }
            Some(n) => n,
            None => longest,
        };
        if let Some(short) = self.params.iter().find(|p| p.len() < size) {
            return Err(OdbcError::Programming(format!(
                "parameter {} has {} value(s) but {} are executed",
                short.index(),
                short.len(),
                size
            )));
        }
        Ok(size)
    }

    fn ensure_all_bound(&self) -> Result<()> {
        let count = self.param_count.unwrap_or(0);
        if let Some(missing) = (0..count).find(|i| self.params.iter().all(|p| p.index() != *i)) {
            return Err(OdbcError::Programming(format!(
                "parameter {} is not bound",
                missing
            )));
        }
        Ok(())
    }

    fn ensure_prepared(&self) -> Result<()> {
        if self.stmt.is_none() {
            return Err(not_open());
        }
        if !self.prepared {
            return Err(OdbcError::Programming(
                "statement is not prepared".to_string(),
            ));
        }
        Ok(())
    }

    fn log_execution(&self, sql: &str, paramset: usize) {
        if !self.logger.is_enabled() {
            return;
        }
        let mut metadata = BTreeMap::new();
        metadata.insert("paramset", paramset.to_string());
        metadata.insert("generation", self.generation.to_string());
        self.logger.log_query(Level::Debug, sql, &metadata);
    }

    fn execute(&mut self, batch: Option<usize>) -> Result<()> {
        self.async_op.ensure_idle()?;
        self.ensure_prepared()?;
        self.ensure_all_bound()?;
        let paramset = self.paramset_size(batch)?;
        let (driver, raw) = self.native()?;
        self.begin_execution(&driver, raw);
        let rc = driver.execute(raw, &mut self.params, paramset);
        self.check(rc, "execute")?;
        self.log_execution(self.sql.as_deref().unwrap_or_default(), paramset);
        Ok(())
    }

    fn execute_direct(&mut self, conn: &Connection, sql: &str) -> Result<()> {
        self.async_op.ensure_idle()?;
        if !self.is_open_on(conn) {
            self.open(conn)?;
        }
        let (driver, raw) = self.native()?;
        self.begin_execution(&driver, raw);
        self.prepared = false;
        self.param_count = None;
        self.clear_params();
        self.sql = Some(sql.to_string());
        let rc = driver.exec_direct(raw, sql, &mut [], 1);
        self.check(rc, "execute direct")?;
        self.log_execution(sql, 1);
        Ok(())
    }

    fn async_prepare(&mut self, event: EventHandle, sql: &str) -> Result<()> {
        self.async_op.ensure_idle()?;
        let (driver, raw) = self.native()?;
        self.begin_execution(&driver, raw);
        self.prepared = false;
        self.clear_params();
        self.sql = Some(sql.to_string());
        let stmt = self.stmt.as_ref().ok_or_else(not_open)?;
        self.async_op
            .start(stmt, event, StatementOp::Prepare, || driver.prepare(raw, sql))
    }

    fn async_execute(&mut self, event: EventHandle, batch: Option<usize>) -> Result<()> {
        self.async_op.ensure_idle()?;
        self.ensure_prepared()?;
        self.ensure_all_bound()?;
        let paramset = self.paramset_size(batch)?;
        let (driver, raw) = self.native()?;
        self.begin_execution(&driver, raw);
        let stmt = self.stmt.as_ref().ok_or_else(not_open)?;
        let params = &mut self.params;
        self.async_op.start(stmt, event, StatementOp::Execute, || {
            driver.execute(raw, params, paramset)
        })
    }

    fn async_execute_direct(
        &mut self,
        conn: &Connection,
        event: EventHandle,
        sql: &str,
    ) -> Result<()> {
        self.async_op.ensure_idle()?;
        if !self.is_open_on(conn) {
            self.open(conn)?;
        }
        let (driver, raw) = self.native()?;
        self.begin_execution(&driver, raw);
        self.prepared = false;
        self.param_count = None;
        self.clear_params();
        self.sql = Some(sql.to_string());
        let stmt = self.stmt.as_ref().ok_or_else(not_open)?;
        self.async_op.start(stmt, event, StatementOp::ExecuteDirect, || {
            driver.exec_direct(raw, sql, &mut [], 1)
        })
    }

    fn async_complete(&mut self) -> Result<StatementOp> {
        let stmt = self.stmt.as_ref().ok_or_else(not_open)?;
        let (op, _) = self.async_op.complete(stmt)?;
        if op == StatementOp::Prepare {
            self.after_prepare()?;
        }
        self.log_execution(self.sql.as_deref().unwrap_or_default(), 1);
        Ok(op)
    }

    fn cancel(&self) -> Result<()> {
        let (driver, raw) = self.native()?;
        let rc = driver.cancel(raw);
        self.check(rc, "cancel")?;
        Ok(())
    }

    fn validate_param(&self, index: u16) -> Result<()> {
        self.async_op.ensure_idle()?;
        self.ensure_prepared()?;
        let count = self.param_count.unwrap_or(0);
        if index >= count {
            return Err(OdbcError::IndexRange(format!(
                "parameter {} of {}",
                index, count
            )));
        }
        Ok(())
    }

    fn bind_buffer(&mut self, buffer: ParamBuffer) {
        match self
            .params
            .binary_search_by_key(&buffer.index(), ParamBuffer::index)
        {
            Ok(pos) => {
                self.reset_native_params();
                self.params[pos] = buffer;
            }
            Err(pos) => self.params.insert(pos, buffer),
        }
    }

    fn param(&self, index: u16) -> Result<&ParamBuffer> {
        self.validate_param(index)?;
        self.params
            .iter()
            .find(|p| p.index() == index)
            .ok_or_else(|| OdbcError::Programming(format!("parameter {} is not bound", index)))
    }

    fn describe_param(&self, index: u16) -> Result<ParamDescription> {
        self.validate_param(index)?;
        let (driver, raw) = self.native()?;
        let mut description = ParamDescription::default();
        let rc = driver.describe_param(raw, index, &mut description);
        self.check(rc, "describe parameter")?;
        Ok(description)
    }

    /// Columns and counters of the current result, used to bind a rowset.
    pub(crate) fn result_shape(&self) -> Result<ResultShape> {
        let (driver, raw) = self.native()?;
        let mut count = 0u16;
        let rc = driver.num_result_cols(raw, &mut count);
        self.check(rc, "count result columns")?;
        let mut columns = Vec::with_capacity(usize::from(count));
        for col in 0..count {
            let mut description = ColumnDescription::default();
            let rc = driver.describe_col(raw, col, &mut description);
            self.check(rc, "describe column")?;
            columns.push(description);
        }
        let mut affected_rows = -1i64;
        let rc = driver.row_count(raw, &mut affected_rows);
        self.check(rc, "row count")?;
        Ok(ResultShape {
            columns,
            affected_rows,
            generation: self.generation,
            rowset_size: self.rowset_size,
            column_floor: self.column_floor,
        })
    }

    /// The handle a result produced under `generation` reads from.
    pub(crate) fn current(&self, generation: u64) -> Result<&HandleGuard> {
        if generation != self.generation {
            return Err(OdbcError::Programming(
                "result set is no longer valid; its statement was re-executed or closed"
                    .to_string(),
            ));
        }
        self.guard()
    }
}

impl Drop for StatementImpl {
    fn drop(&mut self) {
        self.release();
    }
}

/// A statement on a connection.
///
/// Clones alias one native statement. Executing through any alias
/// invalidates results produced by earlier executions.
#[derive(Clone)]
pub struct Statement {
    inner: Arc<Mutex<StatementImpl>>,
}

impl Default for Statement {
    fn default() -> Self {
        Self::new()
    }
}

impl Statement {
    /// A statement not yet opened on any connection.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatementImpl::new())),
        }
    }

    /// A statement opened on `conn`.
    pub fn with_connection(conn: &Connection) -> Result<Self> {
        let stmt = Self::new();
        stmt.open(conn)?;
        Ok(stmt)
    }

    /// A statement opened on `conn` with `sql` prepared.
    pub fn with_query(conn: &Connection, sql: &str) -> Result<Self> {
        let stmt = Self::new();
        stmt.prepare_on(conn, sql)?;
        Ok(stmt)
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, StatementImpl>> {
        self.inner
            .lock()
            .map_err(|_| OdbcError::InternalError("Failed to lock statement mutex".to_string()))
    }

    /// Allocates a statement handle on `conn`, closing any previous one.
    pub fn open(&self, conn: &Connection) -> Result<()> {
        self.lock()?.open(conn)
    }

    pub fn is_open(&self) -> bool {
        self.lock().map(|s| s.stmt.is_some()).unwrap_or(false)
    }

    /// True when open and the owning connection is still connected in the
    /// session the statement was opened in.
    pub fn connected(&self) -> bool {
        self.lock()
            .map(|s| s.stmt.is_some() && s.session_alive())
            .unwrap_or(false)
    }

    pub fn connection(&self) -> Option<Connection> {
        self.lock().ok().and_then(|s| s.connection.clone())
    }

    /// Releases the statement handle. Results of this statement become
    /// invalid.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.release();
        inner.connection = None;
        inner.sql = None;
        Ok(())
    }

    /// Asks the driver to abort the statement's current execution.
    pub fn cancel(&self) -> Result<()> {
        self.lock()?.cancel()
    }

    pub fn query(&self) -> Option<String> {
        self.lock().ok().and_then(|s| s.sql.clone())
    }

    pub fn prepare(&self, sql: &str) -> Result<()> {
        self.lock()?.prepare(sql)
    }

    /// Opens on `conn` when needed, then prepares `sql`.
    pub fn prepare_on(&self, conn: &Connection, sql: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.is_open_on(conn) {
            inner.open(conn)?;
        }
        inner.prepare(sql)
    }

    /// Executes the prepared statement once per element of the bound
    /// parameter arrays.
    pub fn execute(&self) -> Result<ResultSet> {
        self.lock()?.execute(None)?;
        ResultSet::new(self.clone())
    }

    /// Executes the prepared statement for exactly `batch` parameter sets.
    pub fn execute_batch(&self, batch: usize) -> Result<ResultSet> {
        self.lock()?.execute(Some(batch))?;
        ResultSet::new(self.clone())
    }

    pub fn just_execute(&self) -> Result<()> {
        self.lock()?.execute(None)
    }

    pub fn just_execute_batch(&self, batch: usize) -> Result<()> {
        self.lock()?.execute(Some(batch))
    }

    /// Executes `sql` without preparing, opening on `conn` when needed.
    pub fn execute_direct(&self, conn: &Connection, sql: &str) -> Result<ResultSet> {
        self.lock()?.execute_direct(conn, sql)?;
        ResultSet::new(self.clone())
    }

    pub fn just_execute_direct(&self, conn: &Connection, sql: &str) -> Result<()> {
        self.lock()?.execute_direct(conn, sql)
    }

    /// Starts preparing `sql`; finish with [`Statement::complete_prepare`].
    pub fn async_prepare(&self, event: EventHandle, sql: &str) -> Result<()> {
        self.lock()?.async_prepare(event, sql)
    }

    pub fn complete_prepare(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.async_op.pending_op() != Some(StatementOp::Prepare) {
            return Err(OdbcError::Programming(
                "no asynchronous prepare is outstanding".to_string(),
            ));
        }
        inner.async_complete().map(|_| ())
    }

    /// Starts executing the prepared statement; finish with
    /// [`Statement::async_complete`].
    pub fn async_execute(&self, event: EventHandle) -> Result<()> {
        self.lock()?.async_execute(event, None)
    }

    pub fn async_execute_direct(
        &self,
        conn: &Connection,
        event: EventHandle,
        sql: &str,
    ) -> Result<()> {
        self.lock()?.async_execute_direct(conn, event, sql)
    }

    /// True once the outstanding asynchronous operation has finished.
    pub fn poll(&self) -> Result<bool> {
        let mut inner = self.lock()?;
        let inner = &mut *inner;
        let stmt = inner.stmt.as_ref().ok_or_else(not_open)?;
        inner.async_op.poll(stmt)
    }

    pub fn async_state(&self) -> Result<AsyncState> {
        Ok(self.lock()?.async_op.state())
    }

    /// Completes an asynchronous execution and returns its result.
    pub fn async_complete(&self) -> Result<ResultSet> {
        {
            let mut inner = self.lock()?;
            if inner.async_op.pending_op() == Some(StatementOp::Prepare) {
                return Err(OdbcError::Programming(
                    "outstanding asynchronous prepare must be finished with complete_prepare"
                        .to_string(),
                ));
            }
            inner.async_complete()?;
        }
        ResultSet::new(self.clone())
    }

    /// Rows fetched per round trip by results of later executions.
    pub fn set_rowset_size(&self, rowset_size: usize) -> Result<()> {
        if rowset_size == 0 {
            return Err(OdbcError::Programming(
                "rowset size must be at least 1".to_string(),
            ));
        }
        self.lock()?.rowset_size = rowset_size;
        Ok(())
    }

    pub fn rowset_size(&self) -> Result<usize> {
        Ok(self.lock()?.rowset_size)
    }

    /// Number of parameter markers of the prepared statement.
    pub fn parameters(&self) -> Result<u16> {
        let inner = self.lock()?;
        inner.ensure_prepared()?;
        Ok(inner.param_count.unwrap_or(0))
    }

    /// Size the driver describes for parameter `index`.
    pub fn parameter_size(&self, index: u16) -> Result<usize> {
        Ok(self.lock()?.describe_param(index)?.column_size)
    }

    pub fn bind<T: Parameter + ?Sized>(&self, index: u16, value: &T) -> Result<()> {
        self.bind_with(index, std::slice::from_ref(&value), None, ParamDirection::Input)
    }

    pub fn bind_array<T: Parameter>(&self, index: u16, values: &[T]) -> Result<()> {
        self.bind_with(index, values, None, ParamDirection::Input)
    }

    /// Binds `values` to parameter `index`. Elements flagged in `nulls` are
    /// sent as NULL whatever their value.
    pub fn bind_with<T: Parameter>(
        &self,
        index: u16,
        values: &[T],
        nulls: Option<&[bool]>,
        direction: ParamDirection,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        inner.validate_param(index)?;
        let buffer = ParamBuffer::from_values(index, values, nulls, direction)?;
        inner.bind_buffer(buffer);
        Ok(())
    }

    pub fn bind_null(&self, index: u16, count: usize) -> Result<()> {
        let mut inner = self.lock()?;
        inner.validate_param(index)?;
        inner.bind_buffer(ParamBuffer::nulls(index, count));
        Ok(())
    }

    pub fn bind_strings(&self, index: u16, values: &[&str]) -> Result<()> {
        self.bind_with(index, values, None, ParamDirection::Input)
    }

    pub fn bind_bytes(&self, index: u16, values: &[&[u8]]) -> Result<()> {
        self.bind_with(index, values, None, ParamDirection::Input)
    }

    /// Binds an output slot for a value of type `T`. `capacity` bounds
    /// character and binary values.
    pub fn bind_output<T: Parameter + ?Sized>(
        &self,
        index: u16,
        direction: ParamDirection,
        capacity: usize,
    ) -> Result<()> {
        if direction == ParamDirection::Input {
            return Err(OdbcError::Programming(
                "output binding needs a direction other than Input".to_string(),
            ));
        }
        let mut inner = self.lock()?;
        inner.validate_param(index)?;
        inner.bind_buffer(ParamBuffer::output::<T>(index, direction, capacity));
        Ok(())
    }

    /// Value written back by the driver into parameter `index`.
    pub fn output<T: FromCell>(&self, index: u16) -> Result<T> {
        self.output_value(index)?.ok_or(OdbcError::NullAccess)
    }

    pub fn output_or<T: FromCell>(&self, index: u16, fallback: T) -> Result<T> {
        Ok(self.output_value(index)?.unwrap_or(fallback))
    }

    fn output_value<T: FromCell>(&self, index: u16) -> Result<Option<T>> {
        let inner = self.lock()?;
        let param = inner.param(index)?;
        if param.is_null(0) {
            return Ok(None);
        }
        let value = decode(param.ctype(), param.value_bytes(0))?;
        T::from_cell(value).map(Some)
    }

    /// Drops every parameter binding.
    pub fn reset_parameters(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.async_op.ensure_idle()?;
        inner.clear_params();
        Ok(())
    }

    /// Number of live aliases, results included.
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn swap(&mut self, other: &mut Statement) {
        std::mem::swap(&mut self.inner, &mut other.inner);
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("open", &self.is_open())
            .field("query", &self.query())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDriver;

    fn connect() -> (Arc<MemoryDriver>, Connection) {
        let memory = Arc::new(MemoryDriver::new());
        let driver: Arc<dyn Driver> = memory.clone();
        let conn = Connection::open(driver, "DSN=stmt").unwrap();
        conn.just_execute("CREATE TABLE t (id INT, name VARCHAR(10))")
            .unwrap();
        (memory, conn)
    }

    #[test]
    fn test_prepare_requires_open_statement() {
        let stmt = Statement::new();
        assert!(matches!(
            stmt.prepare("SELECT 1"),
            Err(OdbcError::Programming(_))
        ));
        assert!(!stmt.is_open());
        assert!(!stmt.connected());
    }

    #[test]
    fn test_bind_requires_prepared_statement() {
        let (_m, conn) = connect();
        let stmt = Statement::with_connection(&conn).unwrap();
        assert!(matches!(stmt.bind(0, &1i32), Err(OdbcError::Programming(_))));
    }

    #[test]
    fn test_bind_index_out_of_range() {
        let (_m, conn) = connect();
        let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
        assert_eq!(stmt.parameters().unwrap(), 2);
        assert!(matches!(stmt.bind(2, &1i32), Err(OdbcError::IndexRange(_))));
        assert!(matches!(
            stmt.bind_null(5, 1),
            Err(OdbcError::IndexRange(_))
        ));
    }

    #[test]
    fn test_unbound_parameter_is_programming_error() {
        let (_m, conn) = connect();
        let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
        stmt.bind(0, &1i32).unwrap();
        assert!(matches!(stmt.just_execute(), Err(OdbcError::Programming(_))));
    }

    #[test]
    fn test_rebinding_replaces() {
        let (memory, conn) = connect();
        let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
        stmt.bind_array(0, &[1i32, 2, 3]).unwrap();
        assert_eq!(memory.param_resets(), 0);
        stmt.bind(0, &9i32).unwrap();
        assert_eq!(memory.param_resets(), 1);
        stmt.bind(1, "x").unwrap();
        stmt.just_execute().unwrap();
        assert_eq!(memory.table_rows("t"), Some(1));
    }

    #[test]
    fn test_close_resets_parameter_bindings() {
        let (memory, conn) = connect();
        let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
        stmt.bind(0, &1i32).unwrap();
        stmt.bind(1, "a").unwrap();
        stmt.just_execute().unwrap();
        assert_eq!(memory.param_resets(), 0);
        stmt.close().unwrap();
        assert_eq!(memory.param_resets(), 1);

        stmt.prepare_on(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
        stmt.bind(0, &2i32).unwrap();
        stmt.bind(1, "b").unwrap();
        stmt.just_execute().unwrap();
        assert_eq!(memory.table_rows("t"), Some(2));
        let result = conn.execute("SELECT name FROM t WHERE id = 2").unwrap();
        assert!(result.next().unwrap());
        assert_eq!(result.get::<String>(0).unwrap(), "b");
    }

    #[test]
    fn test_reprepare_resets_bound_parameters() {
        let (memory, conn) = connect();
        let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
        stmt.bind(0, &1i32).unwrap();
        stmt.bind(1, "a").unwrap();
        stmt.just_execute().unwrap();
        stmt.prepare("SELECT name FROM t WHERE id = ?").unwrap();
        assert_eq!(memory.param_resets(), 1);
        assert!(matches!(stmt.just_execute(), Err(OdbcError::Programming(_))));

        stmt.bind(0, &1i32).unwrap();
        let result = stmt.execute().unwrap();
        assert!(result.next().unwrap());
        assert_eq!(result.get::<String>(0).unwrap(), "a");
        stmt.reset_parameters().unwrap();
        assert_eq!(memory.param_resets(), 2);
        assert!(matches!(stmt.just_execute(), Err(OdbcError::Programming(_))));
    }

    #[test]
    fn test_mismatched_array_lengths() {
        let (_m, conn) = connect();
        let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
        stmt.bind_array(0, &[1i32, 2, 3]).unwrap();
        stmt.bind_strings(1, &["a", "b"]).unwrap();
        assert!(matches!(stmt.just_execute(), Err(OdbcError::Programming(_))));
        assert!(matches!(
            stmt.just_execute_batch(0),
            Err(OdbcError::Programming(_))
        ));
        stmt.just_execute_batch(2).unwrap();
    }

    #[test]
    fn test_bulk_insert_counts_rows() {
        let (memory, conn) = connect();
        let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
        stmt.bind_array(0, &[1i32, 2, 3]).unwrap();
        stmt.bind_with(
            1,
            &["a", "b", "c"],
            Some(&[false, true, false]),
            ParamDirection::Input,
        )
        .unwrap();
        let result = stmt.execute().unwrap();
        assert_eq!(result.affected_rows().unwrap(), 3);
        assert_eq!(memory.table_rows("t"), Some(3));
    }

    #[test]
    fn test_parameter_size_is_described() {
        let (_m, conn) = connect();
        let stmt = Statement::with_query(&conn, "INSERT INTO t VALUES (?, ?)").unwrap();
        assert_eq!(stmt.parameter_size(1).unwrap(), 10);
        assert!(matches!(
            stmt.parameter_size(2),
            Err(OdbcError::IndexRange(_))
        ));
    }

    #[test]
    fn test_database_error_carries_sqlstate() {
        let (_m, conn) = connect();
        let err = Statement::new()
            .just_execute_direct(&conn, "SELECT * FROM missing")
            .unwrap_err();
        assert_eq!(err.sqlstate_str(), "42S02");
        assert!(err.to_string().contains("execute direct"));
    }

    #[test]
    fn test_output_parameters() {
        let (memory, conn) = connect();
        memory.register_procedure("double_it", |args| {
            let v = match &args[0] {
                crate::driver::memory::Value::Int(v) => *v,
                _ => 0,
            };
            args[1] = crate::driver::memory::Value::Int(v * 2);
            Some(crate::driver::memory::Value::Int(7))
        });
        let stmt = Statement::with_query(&conn, "{? = CALL double_it(?, ?)}").unwrap();
        stmt.bind_output::<i32>(0, ParamDirection::Return, 0).unwrap();
        stmt.bind(1, &21i32).unwrap();
        stmt.bind_output::<i64>(2, ParamDirection::Output, 0).unwrap();
        stmt.just_execute().unwrap();
        assert_eq!(stmt.output::<i32>(0).unwrap(), 7);
        assert_eq!(stmt.output::<i64>(2).unwrap(), 42);
        assert!(matches!(
            stmt.bind_output::<i32>(0, ParamDirection::Input, 0),
            Err(OdbcError::Programming(_))
        ));
    }

    #[test]
    fn test_close_releases_handle() {
        let (memory, conn) = connect();
        let before = memory.live_handles();
        let stmt = Statement::with_connection(&conn).unwrap();
        assert_eq!(memory.live_handles(), before + 1);
        stmt.close().unwrap();
        assert_eq!(memory.live_handles(), before);
        assert!(!stmt.is_open());
        assert!(stmt.connection().is_none());
    }

    #[test]
    fn test_statement_after_disconnect_is_not_connected() {
        let (memory, conn) = connect();
        let stmt = Statement::with_query(&conn, "SELECT 1").unwrap();
        conn.disconnect().unwrap();
        assert!(stmt.is_open());
        assert!(!stmt.connected());
        assert!(matches!(stmt.execute(), Err(OdbcError::Programming(_))));
        drop(stmt);
        assert_eq!(memory.invalid_frees(), 0);
    }

    #[test]
    fn test_set_rowset_size_validates() {
        let stmt = Statement::new();
        assert!(matches!(
            stmt.set_rowset_size(0),
            Err(OdbcError::Programming(_))
        ));
        stmt.set_rowset_size(25).unwrap();
        assert_eq!(stmt.rowset_size().unwrap(), 25);
    }

    #[test]
    fn test_async_execute_direct() {
        let (memory, conn) = connect();
        memory.set_async_latency(1);
        let stmt = Statement::new();
        stmt.async_execute_direct(&conn, EventHandle::new(4), "SELECT 5")
            .unwrap();
        assert_eq!(stmt.async_state().unwrap(), AsyncState::Pending);
        assert!(matches!(
            stmt.just_execute_direct(&conn, "SELECT 6"),
            Err(OdbcError::Programming(_))
        ));
        let result = stmt.async_complete().unwrap();
        assert!(result.next().unwrap());
        assert_eq!(result.get::<i32>(0).unwrap(), 5);
    }

    #[test]
    fn test_async_prepare_then_execute() {
        let (memory, conn) = connect();
        memory.set_async_latency(2);
        let stmt = Statement::with_connection(&conn).unwrap();
        stmt.async_prepare(EventHandle::new(9), "INSERT INTO t VALUES (?, ?)")
            .unwrap();
        assert!(matches!(stmt.bind(0, &1i32), Err(OdbcError::Programming(_))));
        assert!(matches!(
            stmt.async_complete(),
            Err(OdbcError::Programming(_))
        ));
        stmt.complete_prepare().unwrap();
        assert_eq!(stmt.parameters().unwrap(), 2);
        stmt.bind(0, &1i32).unwrap();
        stmt.bind(1, "n").unwrap();
        stmt.async_execute(EventHandle::new(9)).unwrap();
        while !stmt.poll().unwrap() {}
        let result = stmt.async_complete().unwrap();
        assert_eq!(result.affected_rows().unwrap(), 1);
        assert_eq!(memory.table_rows("t"), Some(1));
    }

    #[test]
    fn test_cancel_pending_execution() {
        let (memory, conn) = connect();
        memory.set_async_latency(10);
        let stmt = Statement::new();
        let sql = "INSERT INTO t VALUES (1, 'a')";
        stmt.async_execute_direct(&conn, EventHandle::new(2), sql)
            .unwrap();
        stmt.cancel().unwrap();
        let err = stmt.async_complete().unwrap_err();
        assert_eq!(err.sqlstate_str(), "HY008");
        assert_eq!(stmt.async_state().unwrap(), AsyncState::Idle);
    }
}
