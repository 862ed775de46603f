//! [`Driver`] backed by the system ODBC driver manager through `odbc_api::sys`.
//!
//! Every call is a thin translation onto the native function. Parameter and
//! column buffers are bound right before the call that uses them, so the
//! pointers handed to the driver manager never outlive the borrow.

use crate::driver::{
    ColumnDescription, DiagRecord, Driver, FetchOrientation, HandleKind, InfoKind,
    ParamDescription, RawHandle, SqlReturn,
};
use crate::protocol::{CType, ColumnBuffer, ParamBuffer, ParamDirection, SqlType};
use odbc_api::sys as ffi;
use std::ptr::null_mut;

const SQL_ODBC3: usize = 3;
const SQL_AUTOCOMMIT_OFF: usize = 0;
const SQL_AUTOCOMMIT_ON: usize = 1;
const SQL_CURSOR_STATIC: usize = 3;
const MAX_MESSAGE: usize = 1024;
const MAX_NAME: usize = 256;

#[derive(Debug, Default)]
pub struct OdbcDriver;

impl OdbcDriver {
    pub fn new() -> Self {
        Self
    }
}

fn handle_type(kind: HandleKind) -> ffi::HandleType {
    match kind {
        HandleKind::Environment => ffi::HandleType::Env,
        HandleKind::Connection => ffi::HandleType::Dbc,
        HandleKind::Statement => ffi::HandleType::Stmt,
    }
}

fn as_handle(h: RawHandle) -> ffi::Handle {
    h.as_usize() as ffi::Handle
}

fn as_dbc(h: RawHandle) -> ffi::HDbc {
    h.as_usize() as ffi::HDbc
}

fn as_stmt(h: RawHandle) -> ffi::HStmt {
    h.as_usize() as ffi::HStmt
}

fn ret(rc: ffi::SqlReturn) -> SqlReturn {
    match rc {
        ffi::SqlReturn::SUCCESS => SqlReturn::Success,
        ffi::SqlReturn::SUCCESS_WITH_INFO => SqlReturn::SuccessWithInfo,
        ffi::SqlReturn::NO_DATA => SqlReturn::NoData,
        ffi::SqlReturn::NEED_DATA => SqlReturn::NeedData,
        ffi::SqlReturn::STILL_EXECUTING => SqlReturn::StillExecuting,
        ffi::SqlReturn::INVALID_HANDLE => SqlReturn::InvalidHandle,
        _ => SqlReturn::Error,
    }
}

fn c_type(ctype: CType) -> ffi::CDataType {
    match ctype {
        CType::Bit => ffi::CDataType::Bit,
        CType::Short => ffi::CDataType::SShort,
        CType::Long => ffi::CDataType::SLong,
        CType::SBigInt => ffi::CDataType::SBigInt,
        CType::Float => ffi::CDataType::Float,
        CType::Double => ffi::CDataType::Double,
        CType::Char => ffi::CDataType::Char,
        CType::Binary => ffi::CDataType::Binary,
        CType::Date => ffi::CDataType::TypeDate,
        CType::Timestamp => ffi::CDataType::TypeTimestamp,
    }
}

fn param_type(direction: ParamDirection) -> ffi::ParamType {
    match direction {
        ParamDirection::Input => ffi::ParamType::Input,
        ParamDirection::Output => ffi::ParamType::Output,
        ParamDirection::InputOutput => ffi::ParamType::InputOutput,
        ParamDirection::Return => ffi::ParamType::ReturnValue,
    }
}

fn nullable(n: ffi::Nullability) -> Option<bool> {
    match n {
        ffi::Nullability::NULLABLE => Some(true),
        ffi::Nullability::NO_NULLS => Some(false),
        _ => None,
    }
}

fn set_login_timeout(h: ffi::HDbc, login_timeout: Option<u32>) -> SqlReturn {
    let Some(secs) = login_timeout else {
        return SqlReturn::Success;
    };
    ret(unsafe {
        ffi::SQLSetConnectAttr(
            h,
            ffi::ConnectionAttribute::LoginTimeout,
            secs as usize as ffi::Pointer,
            0,
        )
    })
}

fn text_len(s: &str) -> ffi::SmallInt {
    ffi::SmallInt::try_from(s.len()).unwrap_or(ffi::SmallInt::MAX)
}

impl OdbcDriver {
    /// Binds every parameter buffer and the paramset size on `stmt`.
    fn bind_params(
        &self,
        stmt: RawHandle,
        params: &mut [ParamBuffer],
        paramset_size: usize,
    ) -> SqlReturn {
        let h = as_stmt(stmt);
        unsafe {
            let rc = ret(ffi::SQLFreeStmt(h, ffi::FreeStmtOption::ResetParams));
            if !rc.is_success() {
                return rc;
            }
            let rc = ret(ffi::SQLSetStmtAttr(
                h,
                ffi::StatementAttribute::ParamsetSize,
                paramset_size.max(1) as ffi::Pointer,
                0,
            ));
            if !rc.is_success() {
                return rc;
            }
            for p in params.iter_mut() {
                let rc = ret(ffi::SQLBindParameter(
                    h,
                    p.index() + 1,
                    param_type(p.direction()),
                    c_type(p.ctype()),
                    ffi::SqlDataType(p.sql_type().code()),
                    p.column_size() as ffi::ULen,
                    p.decimal_digits(),
                    p.data_mut_ptr() as ffi::Pointer,
                    p.element_len() as ffi::Len,
                    p.indicators_mut_ptr() as *mut ffi::Len,
                ));
                if !rc.is_success() {
                    return rc;
                }
            }
        }
        SqlReturn::Success
    }
}

impl Driver for OdbcDriver {
    fn name(&self) -> &str {
        "odbc"
    }

    fn alloc_handle(
        &self,
        kind: HandleKind,
        parent: Option<RawHandle>,
        out: &mut Option<RawHandle>,
    ) -> SqlReturn {
        let mut raw: ffi::Handle = null_mut();
        let input = parent.map(as_handle).unwrap_or(null_mut());
        let rc = ret(unsafe { ffi::SQLAllocHandle(handle_type(kind), input, &mut raw) });
        if !rc.is_success() || raw.is_null() {
            *out = None;
            return rc;
        }
        if kind == HandleKind::Environment {
            let rc = ret(unsafe {
                ffi::SQLSetEnvAttr(
                    raw as ffi::HEnv,
                    ffi::EnvironmentAttribute::OdbcVersion,
                    SQL_ODBC3 as ffi::Pointer,
                    0,
                )
            });
            if !rc.is_success() {
                unsafe { ffi::SQLFreeHandle(ffi::HandleType::Env, raw) };
                *out = None;
                return rc;
            }
        }
        *out = Some(RawHandle::new(raw as usize));
        rc
    }

    fn free_handle(&self, kind: HandleKind, handle: RawHandle) -> SqlReturn {
        ret(unsafe { ffi::SQLFreeHandle(handle_type(kind), as_handle(handle)) })
    }

    fn diag_record(&self, kind: HandleKind, handle: RawHandle, rec: i16) -> Option<DiagRecord> {
        let mut state = [0u8; 6];
        let mut native: ffi::Integer = 0;
        let mut message = vec![0u8; MAX_MESSAGE];
        let mut len: ffi::SmallInt = 0;
        let rc = ret(unsafe {
            ffi::SQLGetDiagRec(
                handle_type(kind),
                as_handle(handle),
                rec,
                state.as_mut_ptr(),
                &mut native,
                message.as_mut_ptr(),
                MAX_MESSAGE as ffi::SmallInt,
                &mut len,
            )
        });
        if !rc.is_success() {
            return None;
        }
        let n = usize::try_from(len).unwrap_or(0).min(MAX_MESSAGE - 1);
        message.truncate(n);
        Some(DiagRecord::new(
            &String::from_utf8_lossy(&state[..5]),
            native,
            String::from_utf8_lossy(&message).into_owned(),
        ))
    }

    fn driver_connect(
        &self,
        dbc: RawHandle,
        conn_str: &str,
        login_timeout: Option<u32>,
    ) -> SqlReturn {
        let h = as_dbc(dbc);
        let rc = set_login_timeout(h, login_timeout);
        if !rc.is_success() {
            return rc;
        }
        let mut out_len: ffi::SmallInt = 0;
        ret(unsafe {
            ffi::SQLDriverConnect(
                h,
                null_mut(),
                conn_str.as_ptr(),
                text_len(conn_str),
                null_mut(),
                0,
                &mut out_len,
                ffi::DriverConnectOption::NoPrompt,
            )
        })
    }

    fn connect(
        &self,
        dbc: RawHandle,
        dsn: &str,
        user: &str,
        password: &str,
        login_timeout: Option<u32>,
    ) -> SqlReturn {
        let h = as_dbc(dbc);
        let rc = set_login_timeout(h, login_timeout);
        if !rc.is_success() {
            return rc;
        }
        ret(unsafe {
            ffi::SQLConnect(
                h,
                dsn.as_ptr(),
                text_len(dsn),
                user.as_ptr(),
                text_len(user),
                password.as_ptr(),
                text_len(password),
            )
        })
    }

    fn disconnect(&self, dbc: RawHandle) -> SqlReturn {
        ret(unsafe { ffi::SQLDisconnect(as_dbc(dbc)) })
    }

    fn set_autocommit(&self, dbc: RawHandle, enabled: bool) -> SqlReturn {
        let value = if enabled {
            SQL_AUTOCOMMIT_ON
        } else {
            SQL_AUTOCOMMIT_OFF
        };
        ret(unsafe {
            ffi::SQLSetConnectAttr(
                as_dbc(dbc),
                ffi::ConnectionAttribute::AutoCommit,
                value as ffi::Pointer,
                0,
            )
        })
    }

    fn end_transaction(&self, dbc: RawHandle, commit: bool) -> SqlReturn {
        let completion = if commit {
            ffi::CompletionType::Commit
        } else {
            ffi::CompletionType::Rollback
        };
        ret(unsafe { ffi::SQLEndTran(ffi::HandleType::Dbc, as_handle(dbc), completion) })
    }

    fn get_info(&self, dbc: RawHandle, info: InfoKind, out: &mut String) -> SqlReturn {
        let info_type = match info {
            InfoKind::DbmsName => ffi::InfoType::DbmsName,
            InfoKind::DbmsVersion => ffi::InfoType::DbmsVer,
            InfoKind::DataSourceName => ffi::InfoType::DataSourceName,
            InfoKind::DriverName => ffi::InfoType::DriverName,
        };
        let mut buf = vec![0u8; MAX_NAME];
        let mut len: ffi::SmallInt = 0;
        let rc = ret(unsafe {
            ffi::SQLGetInfo(
                as_dbc(dbc),
                info_type,
                buf.as_mut_ptr() as ffi::Pointer,
                MAX_NAME as ffi::SmallInt,
                &mut len,
            )
        });
        if rc.is_success() {
            buf.truncate(usize::try_from(len).unwrap_or(0).min(MAX_NAME - 1));
            *out = String::from_utf8_lossy(&buf).into_owned();
        }
        rc
    }

    fn prepare(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        let h = as_stmt(stmt);
        // Static cursors allow scrolling in every direction; drivers without
        // them keep forward-only and report scroll attempts as errors.
        unsafe {
            ffi::SQLSetStmtAttr(
                h,
                ffi::StatementAttribute::CursorType,
                SQL_CURSOR_STATIC as ffi::Pointer,
                0,
            );
        }
        let len = ffi::Integer::try_from(sql.len()).unwrap_or(ffi::Integer::MAX);
        ret(unsafe { ffi::SQLPrepare(h, sql.as_ptr(), len) })
    }

    fn num_params(&self, stmt: RawHandle, out: &mut u16) -> SqlReturn {
        let mut n: ffi::SmallInt = 0;
        let rc = ret(unsafe { ffi::SQLNumParams(as_stmt(stmt), &mut n) });
        *out = u16::try_from(n).unwrap_or(0);
        rc
    }

    fn describe_param(
        &self,
        stmt: RawHandle,
        param: u16,
        out: &mut ParamDescription,
    ) -> SqlReturn {
        let mut data_type = ffi::SqlDataType::UNKNOWN_TYPE;
        let mut size: ffi::ULen = 0;
        let mut digits: ffi::SmallInt = 0;
        let mut null_flag = ffi::Nullability::UNKNOWN;
        let rc = ret(unsafe {
            ffi::SQLDescribeParam(
                as_stmt(stmt),
                param + 1,
                &mut data_type,
                &mut size,
                &mut digits,
                &mut null_flag,
            )
        });
        if rc.is_success() {
            *out = ParamDescription {
                sql_type: SqlType::from_code(data_type.0),
                column_size: size as usize,
                decimal_digits: digits,
                nullable: nullable(null_flag),
            };
        }
        rc
    }

    fn execute(
        &self,
        stmt: RawHandle,
        params: &mut [ParamBuffer],
        paramset_size: usize,
    ) -> SqlReturn {
        let rc = self.bind_params(stmt, params, paramset_size);
        if !rc.is_success() {
            return rc;
        }
        ret(unsafe { ffi::SQLExecute(as_stmt(stmt)) })
    }

    fn exec_direct(
        &self,
        stmt: RawHandle,
        sql: &str,
        params: &mut [ParamBuffer],
        paramset_size: usize,
    ) -> SqlReturn {
        let h = as_stmt(stmt);
        unsafe {
            ffi::SQLSetStmtAttr(
                h,
                ffi::StatementAttribute::CursorType,
                SQL_CURSOR_STATIC as ffi::Pointer,
                0,
            );
        }
        let rc = self.bind_params(stmt, params, paramset_size);
        if !rc.is_success() {
            return rc;
        }
        let len = ffi::Integer::try_from(sql.len()).unwrap_or(ffi::Integer::MAX);
        ret(unsafe { ffi::SQLExecDirect(h, sql.as_ptr(), len) })
    }

    fn row_count(&self, stmt: RawHandle, out: &mut i64) -> SqlReturn {
        let mut n: ffi::Len = 0;
        let rc = ret(unsafe { ffi::SQLRowCount(as_stmt(stmt), &mut n) });
        *out = n as i64;
        rc
    }

    fn num_result_cols(&self, stmt: RawHandle, out: &mut u16) -> SqlReturn {
        let mut n: ffi::SmallInt = 0;
        let rc = ret(unsafe { ffi::SQLNumResultCols(as_stmt(stmt), &mut n) });
        *out = u16::try_from(n).unwrap_or(0);
        rc
    }

    fn describe_col(&self, stmt: RawHandle, col: u16, out: &mut ColumnDescription) -> SqlReturn {
        let mut name = vec![0u8; MAX_NAME];
        let mut name_len: ffi::SmallInt = 0;
        let mut data_type = ffi::SqlDataType::UNKNOWN_TYPE;
        let mut size: ffi::ULen = 0;
        let mut digits: ffi::SmallInt = 0;
        let mut null_flag = ffi::Nullability::UNKNOWN;
        let rc = ret(unsafe {
            ffi::SQLDescribeCol(
                as_stmt(stmt),
                col + 1,
                name.as_mut_ptr(),
                MAX_NAME as ffi::SmallInt,
                &mut name_len,
                &mut data_type,
                &mut size,
                &mut digits,
                &mut null_flag,
            )
        });
        if rc.is_success() {
            name.truncate(usize::try_from(name_len).unwrap_or(0).min(MAX_NAME - 1));
            *out = ColumnDescription {
                name: String::from_utf8_lossy(&name).into_owned(),
                sql_type: SqlType::from_code(data_type.0),
                column_size: size as usize,
                decimal_digits: digits,
                nullable: nullable(null_flag),
            };
        }
        rc
    }

    fn fetch_scroll(
        &self,
        stmt: RawHandle,
        orientation: FetchOrientation,
        rowset_size: usize,
        columns: &mut [ColumnBuffer],
        rows_fetched: &mut usize,
    ) -> SqlReturn {
        let h = as_stmt(stmt);
        let mut fetched: ffi::ULen = 0;
        let (native, offset) = match orientation {
            FetchOrientation::Next => (ffi::FetchOrientation::Next, 0),
            FetchOrientation::Prior => (ffi::FetchOrientation::Prior, 0),
            FetchOrientation::First => (ffi::FetchOrientation::First, 0),
            FetchOrientation::Last => (ffi::FetchOrientation::Last, 0),
            FetchOrientation::Absolute(k) => (ffi::FetchOrientation::Absolute, k),
            FetchOrientation::Relative(k) => (ffi::FetchOrientation::Relative, k),
        };
        let rc = unsafe {
            let steps = [
                ffi::SQLFreeStmt(h, ffi::FreeStmtOption::Unbind),
                ffi::SQLSetStmtAttr(
                    h,
                    ffi::StatementAttribute::RowArraySize,
                    rowset_size.max(1) as ffi::Pointer,
                    0,
                ),
                ffi::SQLSetStmtAttr(
                    h,
                    ffi::StatementAttribute::RowsFetchedPtr,
                    &mut fetched as *mut ffi::ULen as ffi::Pointer,
                    0,
                ),
            ];
            if let Some(failed) = steps.iter().map(|rc| ret(*rc)).find(|rc| !rc.is_success()) {
                return failed;
            }
            for (i, column) in columns.iter_mut().enumerate() {
                let rc = ret(ffi::SQLBindCol(
                    h,
                    (i + 1) as ffi::USmallInt,
                    c_type(column.ctype()),
                    column.data_mut_ptr() as ffi::Pointer,
                    column.element_len() as ffi::Len,
                    column.indicators_mut_ptr() as *mut ffi::Len,
                ));
                if !rc.is_success() {
                    return rc;
                }
            }
            let rc = ret(ffi::SQLFetchScroll(h, native, offset as ffi::Len));
            ffi::SQLSetStmtAttr(h, ffi::StatementAttribute::RowsFetchedPtr, null_mut(), 0);
            ffi::SQLFreeStmt(h, ffi::FreeStmtOption::Unbind);
            rc
        };
        *rows_fetched = if rc.is_success() { fetched as usize } else { 0 };
        rc
    }

    fn row_number(&self, stmt: RawHandle, out: &mut u64) -> SqlReturn {
        let mut value: ffi::ULen = 0;
        let rc = ret(unsafe {
            ffi::SQLGetStmtAttr(
                as_stmt(stmt),
                ffi::StatementAttribute::RowNumber,
                &mut value as *mut ffi::ULen as ffi::Pointer,
                0,
                null_mut(),
            )
        });
        *out = value as u64;
        rc
    }

    fn reset_parameters(&self, stmt: RawHandle) -> SqlReturn {
        ret(unsafe { ffi::SQLFreeStmt(as_stmt(stmt), ffi::FreeStmtOption::ResetParams) })
    }

    fn set_position(&self, stmt: RawHandle, row: usize) -> SqlReturn {
        ret(unsafe {
            ffi::SQLSetPos(
                as_stmt(stmt),
                (row + 1) as ffi::SetPosIRow,
                ffi::Operation::Position,
                ffi::Lock::NoChange,
            )
        })
    }

    fn get_data(
        &self,
        stmt: RawHandle,
        col: u16,
        ctype: CType,
        buf: &mut [u8],
        indicator: &mut isize,
    ) -> SqlReturn {
        let mut ind: ffi::Len = 0;
        let rc = ret(unsafe {
            ffi::SQLGetData(
                as_stmt(stmt),
                col + 1,
                c_type(ctype),
                buf.as_mut_ptr() as ffi::Pointer,
                buf.len() as ffi::Len,
                &mut ind,
            )
        });
        *indicator = ind as isize;
        rc
    }

    fn more_results(&self, stmt: RawHandle) -> SqlReturn {
        ret(unsafe { ffi::SQLMoreResults(as_stmt(stmt)) })
    }

    fn close_cursor(&self, stmt: RawHandle) -> SqlReturn {
        // SQL_CLOSE tolerates a statement without an open cursor.
        ret(unsafe { ffi::SQLFreeStmt(as_stmt(stmt), ffi::FreeStmtOption::Close) })
    }

    fn cancel(&self, stmt: RawHandle) -> SqlReturn {
        ret(unsafe { ffi::SQLCancel(as_stmt(stmt)) })
    }
}

