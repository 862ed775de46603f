use super::cell_reader::{decode, read_long, CellValue, FromCell};
use super::rowset::Rowset;
use super::statement::Statement;
use crate::driver::{ColumnDescription, FetchOrientation, SqlReturn};
use crate::error::{OdbcError, Result};
use crate::protocol::SqlType;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Where the result's cursor sits relative to the bound rowset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Nothing fetched yet.
    Unfetched,
    OnRow(usize),
    BeforeFirst,
    AfterLast,
}

fn end_for(orientation: FetchOrientation) -> Cursor {
    match orientation {
        FetchOrientation::Prior => Cursor::BeforeFirst,
        FetchOrientation::Relative(n) | FetchOrientation::Absolute(n) if n <= 0 => {
            Cursor::BeforeFirst
        }
        _ => Cursor::AfterLast,
    }
}

/// Outcome of one block fetch.
enum Block {
    NoData,
    /// Rows were fetched; `start` is the 0-based position of the first one
    /// when the driver reports row numbers.
    Rows { start: Option<u64> },
}

struct ResultImpl {
    statement: Statement,
    generation: u64,
    columns: Vec<ColumnDescription>,
    rowset: Rowset,
    /// 0-based absolute number of the rowset's first row.
    rowset_start: u64,
    cursor: Cursor,
    affected_rows: i64,
}

impl ResultImpl {
    fn new(statement: Statement) -> Result<Self> {
        let shape = statement.lock()?.result_shape()?;
        let rowset = Rowset::bind(&shape.columns, shape.rowset_size, shape.column_floor);
        Ok(Self {
            statement,
            generation: shape.generation,
            columns: shape.columns,
            rowset,
            rowset_start: 0,
            cursor: Cursor::Unfetched,
            affected_rows: shape.affected_rows,
        })
    }

    /// Fetches a rowset. `Ok(false)` when the move left the result set.
    fn fetch(&mut self, orientation: FetchOrientation) -> Result<bool> {
        if self.columns.is_empty() {
            self.cursor = Cursor::AfterLast;
            return Ok(false);
        }
        match self.fetch_positioned(orientation) {
            Ok(Some(start)) => {
                self.rowset_start = start;
                self.cursor = Cursor::OnRow(0);
                Ok(true)
            }
            Ok(None) => {
                self.rowset.set_rows(0);
                self.cursor = end_for(orientation);
                Ok(false)
            }
            Err(e) => {
                self.cursor = Cursor::AfterLast;
                Err(e)
            }
        }
    }

    /// Fetches and returns the start of the new rowset, or `None` when no
    /// rows came back.
    fn fetch_positioned(&mut self, orientation: FetchOrientation) -> Result<Option<u64>> {
        let previous = self.cursor;
        let previous_start = self.rowset_start;
        let previous_rows = self.rowset.rows() as u64;
        let start = match self.fetch_block(orientation)? {
            Block::NoData => return Ok(None),
            Block::Rows { start } => start,
        };
        if let Some(start) = start {
            return Ok(Some(start));
        }
        let capacity = self.rowset.capacity() as u64;
        let inferred = match (orientation, previous) {
            (FetchOrientation::First, _) => Some(0),
            (FetchOrientation::Next, Cursor::OnRow(_)) => Some(previous_start + previous_rows),
            (FetchOrientation::Next, _) => Some(0),
            (FetchOrientation::Prior, Cursor::OnRow(_)) => {
                Some(previous_start.saturating_sub(capacity))
            }
            (FetchOrientation::Absolute(n), _) if n > 0 => Some(n as u64 - 1),
            (FetchOrientation::Relative(n), Cursor::OnRow(_)) => {
                Some(previous_start.saturating_add_signed(n))
            }
            _ => None,
        };
        match inferred {
            Some(start) => Ok(Some(start)),
            None => self.locate(orientation),
        }
    }

    fn fetch_block(&mut self, orientation: FetchOrientation) -> Result<Block> {
        let statement = self.statement.lock()?;
        let guard = statement.current(self.generation)?;
        let driver = guard.driver();
        let capacity = self.rowset.capacity();
        let mut fetched = 0usize;
        let rc = driver.fetch_scroll(
            guard.raw(),
            orientation,
            capacity,
            self.rowset.prepare_fetch(),
            &mut fetched,
        );
        let rc = guard.check(rc, "fetch")?;
        if rc == SqlReturn::NoData || fetched == 0 {
            self.rowset.set_rows(0);
            return Ok(Block::NoData);
        }
        self.rowset.set_rows(fetched);

        let mut number = 0u64;
        let rc = driver.row_number(guard.raw(), &mut number);
        let start = if rc.is_success() {
            number.checked_sub(1)
        } else {
            None
        };
        Ok(Block::Rows { start })
    }

    /// Start of the rowset a position-relative fetch landed on, for drivers
    /// that do not report row numbers. Counts the rows, then refetches the
    /// same rowset by absolute position.
    fn locate(&mut self, orientation: FetchOrientation) -> Result<Option<u64>> {
        let total = self.count_rows()?;
        let capacity = self.rowset.capacity() as u64;
        let start = match orientation {
            FetchOrientation::Last => total.saturating_sub(capacity),
            FetchOrientation::Absolute(n) | FetchOrientation::Relative(n) if n < 0 => {
                total.saturating_sub(n.unsigned_abs())
            }
            other => {
                return Err(OdbcError::UnsupportedFeature(format!(
                    "cannot place a {:?} fetch without driver row numbers",
                    other
                )))
            }
        };
        if total == 0 {
            return Ok(None);
        }
        let absolute = i64::try_from(start + 1)
            .map_err(|_| OdbcError::IndexRange(format!("row {} is out of range", start)))?;
        match self.fetch_block(FetchOrientation::Absolute(absolute))? {
            Block::NoData => Ok(None),
            Block::Rows { .. } => Ok(Some(start)),
        }
    }

    /// Number of rows in the result, found with absolute fetches: doubling
    /// steps until the end is passed, then bisection. A partly filled rowset
    /// gives the exact count.
    fn count_rows(&mut self) -> Result<u64> {
        let capacity = self.rowset.capacity() as u64;
        // The count lies in `known..bound`.
        let mut known = 0u64;
        let mut bound: Option<u64> = None;
        loop {
            let at = match bound {
                Some(bound) if bound - known <= 1 => return Ok(known),
                Some(bound) => known + (bound - known) / 2,
                None => known.saturating_mul(2).max(known + 1),
            };
            let absolute = i64::try_from(at)
                .map_err(|_| OdbcError::IndexRange(format!("row {} is out of range", at)))?;
            match self.fetch_block(FetchOrientation::Absolute(absolute))? {
                Block::NoData => bound = Some(at),
                Block::Rows { .. } => {
                    let rows = self.rowset.rows() as u64;
                    if rows < capacity {
                        return Ok(at + rows - 1);
                    }
                    known = at + capacity - 1;
                }
            }
        }
    }

    /// Places the cursor on absolute row `target` if the rowset holds it.
    fn land_on(&mut self, target: u64) -> bool {
        let rows = self.rowset.rows() as u64;
        if target >= self.rowset_start && target < self.rowset_start + rows {
            self.cursor = Cursor::OnRow((target - self.rowset_start) as usize);
            true
        } else {
            false
        }
    }

    fn next(&mut self) -> Result<bool> {
        match self.cursor {
            Cursor::AfterLast => Ok(false),
            Cursor::OnRow(i) if i + 1 < self.rowset.rows() => {
                self.cursor = Cursor::OnRow(i + 1);
                Ok(true)
            }
            _ => self.fetch(FetchOrientation::Next),
        }
    }

    fn prior(&mut self) -> Result<bool> {
        match self.cursor {
            Cursor::Unfetched | Cursor::BeforeFirst => {
                self.cursor = Cursor::BeforeFirst;
                Ok(false)
            }
            Cursor::OnRow(i) if i > 0 => {
                self.cursor = Cursor::OnRow(i - 1);
                Ok(true)
            }
            Cursor::OnRow(_) => {
                if self.rowset_start == 0 {
                    return self.fetch(FetchOrientation::Absolute(0));
                }
                let target = self.rowset_start - 1;
                if !self.fetch(FetchOrientation::Prior)? {
                    return Ok(false);
                }
                if self.land_on(target) {
                    return Ok(true);
                }
                self.fetch(FetchOrientation::Absolute(target as i64 + 1))
            }
            Cursor::AfterLast => self.last(),
        }
    }

    fn first(&mut self) -> Result<bool> {
        self.fetch(FetchOrientation::First)
    }

    fn last(&mut self) -> Result<bool> {
        if !self.fetch(FetchOrientation::Last)? {
            return Ok(false);
        }
        self.cursor = Cursor::OnRow(self.rowset.rows() - 1);
        Ok(true)
    }

    fn move_to(&mut self, row: u64) -> Result<bool> {
        if matches!(self.cursor, Cursor::OnRow(_)) && self.land_on(row) {
            return Ok(true);
        }
        let absolute = i64::try_from(row)
            .ok()
            .and_then(|r| r.checked_add(1))
            .ok_or_else(|| OdbcError::IndexRange(format!("row {} is out of range", row)))?;
        self.fetch(FetchOrientation::Absolute(absolute))
    }

    fn skip(&mut self, rows: i64) -> Result<bool> {
        let i = match self.cursor {
            Cursor::OnRow(i) => i,
            Cursor::Unfetched | Cursor::BeforeFirst if rows > 0 => {
                return self.fetch(FetchOrientation::Absolute(rows));
            }
            Cursor::Unfetched | Cursor::BeforeFirst => {
                self.cursor = Cursor::BeforeFirst;
                return Ok(false);
            }
            // Counted back from the end: -1 is the last row.
            Cursor::AfterLast if rows < 0 => return self.fetch(FetchOrientation::Absolute(rows)),
            Cursor::AfterLast => return Ok(false),
        };
        let current = (self.rowset_start + i as u64) as i64;
        let target = current.saturating_add(rows);
        if target < 0 {
            return self.fetch(FetchOrientation::Absolute(0));
        }
        if self.land_on(target as u64) {
            return Ok(true);
        }
        self.fetch(FetchOrientation::Absolute(target.saturating_add(1)))
    }

    fn next_result(&mut self) -> Result<bool> {
        let shape = {
            let statement = self.statement.lock()?;
            let guard = statement.current(self.generation)?;
            let rc = guard.driver().more_results(guard.raw());
            if guard.check(rc, "advance to next result")? == SqlReturn::NoData {
                drop(statement);
                self.rowset.set_rows(0);
                self.cursor = Cursor::AfterLast;
                return Ok(false);
            }
            statement.result_shape()?
        };
        self.rowset = Rowset::bind(&shape.columns, shape.rowset_size, shape.column_floor);
        self.columns = shape.columns;
        self.affected_rows = shape.affected_rows;
        self.rowset_start = 0;
        self.cursor = Cursor::Unfetched;
        Ok(true)
    }

    fn current_row(&self) -> Result<usize> {
        match self.cursor {
            Cursor::OnRow(i) => Ok(i),
            _ => Err(OdbcError::IndexRange("no current row".to_string())),
        }
    }

    fn column_description(&self, column: usize) -> Result<&ColumnDescription> {
        self.columns.get(column).ok_or_else(|| {
            OdbcError::IndexRange(format!(
                "column {} of {}",
                column,
                self.columns.len()
            ))
        })
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .or_else(|| {
                self.columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(name))
            })
            .ok_or_else(|| OdbcError::IndexRange(format!("no column named '{}'", name)))
    }

    /// The value under the cursor in `column`; `None` for NULL. Values longer
    /// than the bound element are streamed in chunks.
    fn read_cell(&self, column: usize) -> Result<Option<CellValue>> {
        self.column_description(column)?;
        let buffer = self
            .rowset
            .buffer(column)
            .ok_or_else(|| OdbcError::InternalError(format!("column {} is not bound", column)))?;
        let statement = self.statement.lock()?;
        let guard = statement.current(self.generation)?;
        let row = self.current_row()?;
        if buffer.is_null(row) {
            return Ok(None);
        }
        if !buffer.is_truncated(row) {
            return decode(buffer.ctype(), buffer.value_bytes(row)).map(Some);
        }
        let col = u16::try_from(column)
            .map_err(|_| OdbcError::IndexRange(format!("column {} is out of range", column)))?;
        match read_long(guard, col, row, buffer.ctype(), buffer.element_len())? {
            Some(bytes) => decode(buffer.ctype(), &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn is_null(&self, column: usize) -> Result<bool> {
        self.column_description(column)?;
        self.statement.lock()?.current(self.generation)?;
        let row = self.current_row()?;
        Ok(self
            .rowset
            .buffer(column)
            .is_some_and(|buffer| buffer.is_null(row)))
    }
}

/// The result of executing a statement, read through a block cursor.
///
/// Clones alias one cursor. A result stays usable until its statement is
/// executed again or closed; after that every access is a
/// [`OdbcError::Programming`] error.
#[derive(Clone)]
pub struct ResultSet {
    inner: Arc<Mutex<ResultImpl>>,
}

impl ResultSet {
    pub(crate) fn new(statement: Statement) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(ResultImpl::new(statement)?)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, ResultImpl>> {
        self.inner
            .lock()
            .map_err(|_| OdbcError::InternalError("Failed to lock result mutex".to_string()))
    }

    pub fn statement(&self) -> Result<Statement> {
        Ok(self.lock()?.statement.clone())
    }

    /// Advances one row, fetching the next rowset when the current one is
    /// used up.
    pub fn next(&self) -> Result<bool> {
        self.lock()?.next()
    }

    pub fn prior(&self) -> Result<bool> {
        self.lock()?.prior()
    }

    pub fn first(&self) -> Result<bool> {
        self.lock()?.first()
    }

    pub fn last(&self) -> Result<bool> {
        self.lock()?.last()
    }

    /// Moves to the 0-based absolute `row`.
    pub fn move_to(&self, row: u64) -> Result<bool> {
        self.lock()?.move_to(row)
    }

    /// Moves `rows` forward, or backward when negative.
    pub fn skip(&self, rows: i64) -> Result<bool> {
        self.lock()?.skip(rows)
    }

    /// 0-based absolute number of the current row.
    pub fn position(&self) -> Result<u64> {
        let inner = self.lock()?;
        let row = inner.current_row()?;
        Ok(inner.rowset_start + row as u64)
    }

    /// True once the cursor has moved past either end.
    pub fn end(&self) -> bool {
        self.lock()
            .map(|inner| matches!(inner.cursor, Cursor::BeforeFirst | Cursor::AfterLast))
            .unwrap_or(true)
    }

    /// Rows held by the current rowset.
    pub fn rows(&self) -> Result<usize> {
        Ok(self.lock()?.rowset.rows())
    }

    pub fn rowset_size(&self) -> Result<usize> {
        Ok(self.lock()?.rowset.capacity())
    }

    /// Rows affected by the statement, or -1 when the driver cannot tell.
    pub fn affected_rows(&self) -> Result<i64> {
        Ok(self.lock()?.affected_rows)
    }

    /// Moves to the next result of a multi-result execution.
    pub fn next_result(&self) -> Result<bool> {
        self.lock()?.next_result()
    }

    pub fn columns(&self) -> Result<usize> {
        Ok(self.lock()?.columns.len())
    }

    pub fn column_name(&self, column: usize) -> Result<String> {
        Ok(self.lock()?.column_description(column)?.name.clone())
    }

    /// Index of the column called `name`.
    pub fn column(&self, name: &str) -> Result<usize> {
        self.lock()?.column_index(name)
    }

    pub fn column_size(&self, column: usize) -> Result<usize> {
        Ok(self.lock()?.column_description(column)?.column_size)
    }

    pub fn column_datatype(&self, column: usize) -> Result<SqlType> {
        Ok(self.lock()?.column_description(column)?.sql_type)
    }

    pub fn is_null(&self, column: usize) -> Result<bool> {
        self.lock()?.is_null(column)
    }

    pub fn is_null_by_name(&self, name: &str) -> Result<bool> {
        let inner = self.lock()?;
        let column = inner.column_index(name)?;
        inner.is_null(column)
    }

    /// Value of `column` in the current row. NULL is
    /// [`OdbcError::NullAccess`].
    pub fn get<T: FromCell>(&self, column: usize) -> Result<T> {
        match self.lock()?.read_cell(column)? {
            Some(value) => T::from_cell(value),
            None => Err(OdbcError::NullAccess),
        }
    }

    /// Like [`ResultSet::get`], with NULL replaced by `fallback`.
    pub fn get_or<T: FromCell>(&self, column: usize, fallback: T) -> Result<T> {
        match self.lock()?.read_cell(column)? {
            Some(value) => T::from_cell(value),
            None => Ok(fallback),
        }
    }

    pub fn get_by_name<T: FromCell>(&self, name: &str) -> Result<T> {
        let column = self.column(name)?;
        self.get(column)
    }

    pub fn get_by_name_or<T: FromCell>(&self, name: &str, fallback: T) -> Result<T> {
        let column = self.column(name)?;
        self.get_or(column, fallback)
    }

    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn swap(&mut self, other: &mut ResultSet) {
        std::mem::swap(&mut self.inner, &mut other.inner);
    }
}

impl fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lock() {
            Ok(inner) => f
                .debug_struct("ResultSet")
                .field("columns", &inner.columns.len())
                .field("rowset_size", &inner.rowset.capacity())
                .field("cursor", &inner.cursor)
                .finish(),
            Err(_) => f.write_str("ResultSet { <poisoned> }"),
        }
    }
}
