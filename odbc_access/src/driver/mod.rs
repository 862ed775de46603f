//! The native call-level interface consumed by the engine.
//!
//! [`Driver`] mirrors the handle-based C surface one call at a time: every
//! method returns a [`SqlReturn`] status and reports detail through
//! diagnostic records retrievable with [`Driver::diag_record`]. Column and
//! parameter numbers are 0-based here; backends translate to whatever the
//! native library expects.

#[cfg(any(test, feature = "test-helpers"))]
pub mod memory;
#[cfg(feature = "odbc")]
pub mod odbc;

use crate::protocol::{CType, ColumnBuffer, ParamBuffer, SqlType};

/// Opaque native handle value. Only [`crate::handles::HandleGuard`] frees one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(usize);

impl RawHandle {
    pub fn new(value: usize) -> Self {
        Self(value)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Environment,
    Connection,
    Statement,
}

impl HandleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandleKind::Environment => "environment",
            HandleKind::Connection => "connection",
            HandleKind::Statement => "statement",
        }
    }
}

/// Return status of a native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlReturn {
    Success,
    SuccessWithInfo,
    NoData,
    NeedData,
    StillExecuting,
    Error,
    InvalidHandle,
}

impl SqlReturn {
    pub fn is_success(self) -> bool {
        matches!(self, SqlReturn::Success | SqlReturn::SuccessWithInfo)
    }
}

/// One native diagnostic record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagRecord {
    pub state: [u8; 5],
    pub native_error: i32,
    pub message: String,
}

impl DiagRecord {
    pub fn new(state: &str, native_error: i32, message: impl Into<String>) -> Self {
        let mut code = [b'0'; 5];
        for (dst, src) in code.iter_mut().zip(state.bytes()) {
            *dst = src;
        }
        Self {
            state: code,
            native_error,
            message: message.into(),
        }
    }

    pub fn state_str(&self) -> &str {
        std::str::from_utf8(&self.state).unwrap_or("?????")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrientation {
    Next,
    Prior,
    First,
    Last,
    /// 1-based row number; negative values count from the end.
    Absolute(i64),
    Relative(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    pub sql_type: SqlType,
    pub column_size: usize,
    pub decimal_digits: i16,
    pub nullable: Option<bool>,
}

impl Default for ColumnDescription {
    fn default() -> Self {
        Self {
            name: String::new(),
            sql_type: SqlType::Unknown(0),
            column_size: 0,
            decimal_digits: 0,
            nullable: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDescription {
    pub sql_type: SqlType,
    pub column_size: usize,
    pub decimal_digits: i16,
    pub nullable: Option<bool>,
}

impl Default for ParamDescription {
    fn default() -> Self {
        Self {
            sql_type: SqlType::Unknown(0),
            column_size: 0,
            decimal_digits: 0,
            nullable: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKind {
    DbmsName,
    DbmsVersion,
    DataSourceName,
    /// File name of the driver library.
    DriverName,
}

/// Platform wait object signalled when an asynchronous call finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(usize);

impl EventHandle {
    pub fn new(value: usize) -> Self {
        Self(value)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Native call-level database interface.
///
/// Implementations must be callable from any thread; the engine serializes
/// calls per handle.
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    fn alloc_handle(
        &self,
        kind: HandleKind,
        parent: Option<RawHandle>,
        out: &mut Option<RawHandle>,
    ) -> SqlReturn;

    fn free_handle(&self, kind: HandleKind, handle: RawHandle) -> SqlReturn;

    /// Diagnostic record `rec` (1-based) of the last call on `handle`.
    fn diag_record(&self, kind: HandleKind, handle: RawHandle, rec: i16) -> Option<DiagRecord>;

    fn driver_connect(
        &self,
        dbc: RawHandle,
        conn_str: &str,
        login_timeout: Option<u32>,
    ) -> SqlReturn;

    fn connect(
        &self,
        dbc: RawHandle,
        dsn: &str,
        user: &str,
        password: &str,
        login_timeout: Option<u32>,
    ) -> SqlReturn;

    fn disconnect(&self, dbc: RawHandle) -> SqlReturn;

    fn set_autocommit(&self, dbc: RawHandle, enabled: bool) -> SqlReturn;

    fn end_transaction(&self, dbc: RawHandle, commit: bool) -> SqlReturn;

    fn get_info(&self, dbc: RawHandle, info: InfoKind, out: &mut String) -> SqlReturn;

    fn prepare(&self, stmt: RawHandle, sql: &str) -> SqlReturn;

    fn num_params(&self, stmt: RawHandle, out: &mut u16) -> SqlReturn;

    fn describe_param(&self, stmt: RawHandle, param: u16, out: &mut ParamDescription)
        -> SqlReturn;

    /// Executes the prepared statement with `params` bound for
    /// `paramset_size` rows. Output parameters are written back into the
    /// buffers before returning.
    fn execute(&self, stmt: RawHandle, params: &mut [ParamBuffer], paramset_size: usize)
        -> SqlReturn;

    fn exec_direct(
        &self,
        stmt: RawHandle,
        sql: &str,
        params: &mut [ParamBuffer],
        paramset_size: usize,
    ) -> SqlReturn;

    fn row_count(&self, stmt: RawHandle, out: &mut i64) -> SqlReturn;

    fn num_result_cols(&self, stmt: RawHandle, out: &mut u16) -> SqlReturn;

    fn describe_col(&self, stmt: RawHandle, col: u16, out: &mut ColumnDescription) -> SqlReturn;

    /// Fetches up to `rowset_size` rows into `columns`, one buffer per result
    /// column, each with capacity for `rowset_size` elements.
    fn fetch_scroll(
        &self,
        stmt: RawHandle,
        orientation: FetchOrientation,
        rowset_size: usize,
        columns: &mut [ColumnBuffer],
        rows_fetched: &mut usize,
    ) -> SqlReturn;

    /// 1-based absolute number of the first row of the current rowset.
    fn row_number(&self, stmt: RawHandle, out: &mut u64) -> SqlReturn;

    /// Releases every parameter binding on `stmt`. Buffers handed to an
    /// earlier `execute` may be dropped only after this returns.
    fn reset_parameters(&self, stmt: RawHandle) -> SqlReturn;

    /// Positions the cursor on `row` (0-based) within the current rowset.
    fn set_position(&self, stmt: RawHandle, row: usize) -> SqlReturn;

    /// Reads the next chunk of `col` for the positioned row. `indicator`
    /// receives the bytes remaining before this call or a null marker.
    fn get_data(
        &self,
        stmt: RawHandle,
        col: u16,
        ctype: CType,
        buf: &mut [u8],
        indicator: &mut isize,
    ) -> SqlReturn;

    fn more_results(&self, stmt: RawHandle) -> SqlReturn;

    fn close_cursor(&self, stmt: RawHandle) -> SqlReturn;

    fn cancel(&self, stmt: RawHandle) -> SqlReturn;

    fn supports_async(&self) -> bool {
        false
    }

    /// Arms (or with `None` disarms) event-driven completion for `handle`.
    fn set_async_event(
        &self,
        _kind: HandleKind,
        _handle: RawHandle,
        _event: Option<EventHandle>,
    ) -> SqlReturn {
        SqlReturn::Error
    }

    /// Collects the outcome of the pending asynchronous call into `outcome`.
    /// Returns `StillExecuting` while the call has not finished.
    fn complete_async(
        &self,
        _kind: HandleKind,
        _handle: RawHandle,
        _outcome: &mut SqlReturn,
    ) -> SqlReturn {
        SqlReturn::Error
    }
}
