//! An in-process [`Driver`] over an in-memory table store.
//!
//! Speaks a small SQL subset (see [`sql`]), keeps every table in one shared
//! database per driver instance, and follows the native interface's rules
//! for handle lifetimes, auto-commit, block cursors, chunked `get_data` and
//! event-driven asynchronous completion closely enough to exercise the
//! engine without a database server.

mod sql;
mod store;

pub use store::Value;

use self::sql::{Batch, Command, Expr, Filter, SelectItem};
use self::store::{diag, ColumnDef, Database, SqlResult, Table};
use crate::driver::{
    ColumnDescription, DiagRecord, Driver, EventHandle, FetchOrientation, HandleKind, InfoKind,
    ParamDescription, RawHandle, SqlReturn,
};
use crate::protocol::{CType, ColumnBuffer, ParamBuffer, SqlType, NULL_DATA};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// A stored procedure: receives its arguments (output arguments may be
/// overwritten in place) and returns the value for a `? =` return marker.
pub type Procedure = Arc<dyn Fn(&mut [Value]) -> Option<Value> + Send + Sync>;

const DBMS_NAME: &str = "MemoryDB";
const DBMS_VERSION: &str = "01.00.0000";
const DRIVER_NAME: &str = "memdrv.so";

#[derive(Debug, Clone)]
struct ResultRows {
    columns: Vec<ColumnDescription>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone)]
enum Outcome {
    Rows(ResultRows),
    Count(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CursorPos {
    #[default]
    BeforeFirst,
    /// 0-based index of the first row of the current rowset.
    At(usize),
    AfterLast,
}

#[derive(Debug, Default)]
struct Cursor {
    pos: CursorPos,
    rowset_len: usize,
    row: usize,
    /// Bytes already handed out by `get_data`, per column of the positioned row.
    reads: HashMap<u16, usize>,
}

#[derive(Debug)]
struct Dbc {
    connected: bool,
    data_source: String,
    autocommit: bool,
    snapshot: Option<Database>,
}

#[derive(Debug, Default)]
struct Stmt {
    prepared: Option<Batch>,
    param_descs: Vec<ParamDescription>,
    current: Option<Outcome>,
    pending_results: VecDeque<Outcome>,
    cursor: Cursor,
    row_count: i64,
}

impl Stmt {
    fn cursor_open(&self) -> bool {
        matches!(self.current, Some(Outcome::Rows(_)))
    }

    fn rows(&self) -> Option<&ResultRows> {
        match &self.current {
            Some(Outcome::Rows(r)) => Some(r),
            _ => None,
        }
    }

    fn clear_results(&mut self) {
        self.current = None;
        self.pending_results.clear();
        self.cursor = Cursor::default();
    }

    fn advance_result(&mut self) -> bool {
        self.cursor = Cursor::default();
        self.current = self.pending_results.pop_front();
        self.row_count = match &self.current {
            Some(Outcome::Count(n)) => *n,
            _ => -1,
        };
        self.current.is_some()
    }
}

#[derive(Debug)]
enum Body {
    Env,
    Dbc(Dbc),
    Stmt(Stmt),
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    outcome: SqlReturn,
    polls_left: u32,
}

#[derive(Debug)]
struct Entry {
    kind: HandleKind,
    parent: Option<usize>,
    diags: Vec<DiagRecord>,
    event: Option<EventHandle>,
    pending: Option<Pending>,
    body: Body,
}

struct Inner {
    next_id: usize,
    entries: HashMap<usize, Entry>,
    freed: usize,
    invalid_frees: usize,
    database: Database,
    procedures: HashMap<String, Procedure>,
    password: Option<String>,
    async_latency: u32,
    last_login_timeout: Option<u32>,
    row_numbers: bool,
    param_resets: usize,
}

/// In-memory [`Driver`]. Cloning the `Arc` around it shares the database.
pub struct MemoryDriver {
    inner: Mutex<Inner>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                entries: HashMap::new(),
                freed: 0,
                invalid_frees: 0,
                database: Database::default(),
                procedures: HashMap::new(),
                password: None,
                async_latency: 0,
                last_login_timeout: None,
                row_numbers: true,
                param_resets: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic inside a test closure must not wedge every later call.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a procedure callable as `{[? =] CALL name(...)}`.
    pub fn register_procedure<F>(&self, name: &str, procedure: F)
    where
        F: Fn(&mut [Value]) -> Option<Value> + Send + Sync + 'static,
    {
        self.lock()
            .procedures
            .insert(name.to_ascii_lowercase(), Arc::new(procedure));
    }

    /// Makes connects fail with SQLSTATE 28000 unless `password` is supplied.
    pub fn require_password(&self, password: &str) {
        self.lock().password = Some(password.to_string());
    }

    /// Number of extra `complete_async` polls answered with `StillExecuting`
    /// before an asynchronous call reports its outcome.
    pub fn set_async_latency(&self, polls: u32) {
        self.lock().async_latency = polls;
    }

    /// With `false`, `row_number` fails as on drivers without row-number
    /// support.
    pub fn set_row_numbers(&self, enabled: bool) {
        self.lock().row_numbers = enabled;
    }

    /// Parameter binding resets received so far.
    pub fn param_resets(&self) -> usize {
        self.lock().param_resets
    }

    /// Handles currently allocated.
    pub fn live_handles(&self) -> usize {
        self.lock().entries.len()
    }

    /// Handles released so far, explicitly or by disconnect.
    pub fn freed_handles(&self) -> usize {
        self.lock().freed
    }

    /// Free calls that named a handle which was not allocated.
    pub fn invalid_frees(&self) -> usize {
        self.lock().invalid_frees
    }

    /// Login timeout passed with the most recent connect.
    pub fn last_login_timeout(&self) -> Option<u32> {
        self.lock().last_login_timeout
    }

    /// Rows currently stored in `table`, if it exists.
    pub fn table_rows(&self, table: &str) -> Option<usize> {
        self.lock().database.table(table).ok().map(|t| t.rows.len())
    }
}

impl Inner {
    fn entry(&mut self, kind: HandleKind, h: RawHandle) -> Option<&mut Entry> {
        self.entries
            .get_mut(&h.as_usize())
            .filter(|e| e.kind == kind)
    }

    fn push_diag(&mut self, h: RawHandle, record: DiagRecord) {
        if let Some(e) = self.entries.get_mut(&h.as_usize()) {
            e.diags.push(record);
        }
    }

    fn fail(&mut self, h: RawHandle, record: DiagRecord) -> SqlReturn {
        self.push_diag(h, record);
        SqlReturn::Error
    }

    fn dbc(&mut self, h: RawHandle) -> Option<&mut Dbc> {
        match self.entries.get_mut(&h.as_usize()).map(|e| &mut e.body) {
            Some(Body::Dbc(d)) => Some(d),
            _ => None,
        }
    }

    fn stmt(&mut self, h: RawHandle) -> Option<&mut Stmt> {
        match self.entries.get_mut(&h.as_usize()).map(|e| &mut e.body) {
            Some(Body::Stmt(s)) => Some(s),
            _ => None,
        }
    }

    fn stmt_connection(&self, h: RawHandle) -> Option<RawHandle> {
        self.entries
            .get(&h.as_usize())
            .and_then(|e| e.parent)
            .map(RawHandle::new)
    }

    /// Common entry point of every call on a handle: validates it, clears
    /// its diagnostics and, when an event is armed and the call may run
    /// asynchronously, stashes the outcome for `complete_async`.
    fn call<F>(&mut self, kind: HandleKind, h: RawHandle, may_defer: bool, op: F) -> SqlReturn
    where
        F: FnOnce(&mut Inner) -> SqlReturn,
    {
        let latency = self.async_latency;
        let Some(entry) = self.entry(kind, h) else {
            return SqlReturn::InvalidHandle;
        };
        if entry.pending.is_some() {
            entry.diags = vec![diag("HY010", "Function sequence error")];
            return SqlReturn::Error;
        }
        entry.diags.clear();
        let deferred = may_defer && entry.event.is_some();
        let rc = op(self);
        if deferred {
            if let Some(entry) = self.entry(kind, h) {
                entry.pending = Some(Pending {
                    outcome: rc,
                    polls_left: latency,
                });
                return SqlReturn::StillExecuting;
            }
        }
        rc
    }

    fn check_password(&self, supplied: Option<&str>) -> SqlResult<()> {
        match (&self.password, supplied) {
            (None, _) => Ok(()),
            (Some(expected), Some(given)) if expected == given => Ok(()),
            _ => Err(diag("28000", "Login failed")),
        }
    }

    fn open_session(
        &mut self,
        dbc: RawHandle,
        data_source: String,
        password: Option<&str>,
        login_timeout: Option<u32>,
    ) -> SqlReturn {
        self.last_login_timeout = login_timeout;
        if let Err(record) = self.check_password(password) {
            return self.fail(dbc, record);
        }
        match self.dbc(dbc) {
            Some(d) if d.connected => {
                self.fail(dbc, diag("08002", "Connection name in use"))
            }
            Some(d) => {
                d.connected = true;
                d.data_source = data_source;
                d.autocommit = true;
                d.snapshot = None;
                SqlReturn::Success
            }
            None => SqlReturn::InvalidHandle,
        }
    }

    fn close_session(&mut self, dbc: RawHandle) -> SqlReturn {
        let Some(d) = self.dbc(dbc) else {
            return SqlReturn::InvalidHandle;
        };
        if !d.connected {
            return self.fail(dbc, diag("08003", "Connection not open"));
        }
        d.connected = false;
        d.autocommit = true;
        let snapshot = d.snapshot.take();
        if let Some(snapshot) = snapshot {
            self.database = snapshot;
        }
        // Disconnecting releases every statement of the connection.
        let children: Vec<usize> = self
            .entries
            .iter()
            .filter(|(_, e)| e.parent == Some(dbc.as_usize()) && e.kind == HandleKind::Statement)
            .map(|(id, _)| *id)
            .collect();
        for id in children {
            self.entries.remove(&id);
            self.freed += 1;
        }
        SqlReturn::Success
    }

    fn require_connected(&mut self, stmt: RawHandle) -> SqlResult<()> {
        let connected = self
            .stmt_connection(stmt)
            .and_then(|dbc| match self.entries.get(&dbc.as_usize()).map(|e| &e.body) {
                Some(Body::Dbc(d)) => Some(d.connected),
                _ => None,
            })
            .unwrap_or(false);
        if connected {
            Ok(())
        } else {
            Err(diag("08003", "Connection not open"))
        }
    }

    fn prepare(&mut self, stmt: RawHandle, text: &str) -> SqlReturn {
        if let Err(record) = self.require_connected(stmt) {
            return self.fail(stmt, record);
        }
        if self.stmt(stmt).is_some_and(|s| s.cursor_open()) {
            return self.fail(stmt, diag("24000", "Invalid cursor state"));
        }
        let parsed = sql::parse(text);
        let descs = match &parsed {
            Ok(batch) => describe_params(&self.database, batch),
            Err(_) => Vec::new(),
        };
        let Some(s) = self.stmt(stmt) else {
            return SqlReturn::InvalidHandle;
        };
        s.clear_results();
        match parsed {
            Ok(batch) => {
                s.prepared = Some(batch);
                s.param_descs = descs;
                SqlReturn::Success
            }
            Err(record) => {
                s.prepared = None;
                s.param_descs.clear();
                self.fail(stmt, record)
            }
        }
    }

    fn run(
        &mut self,
        stmt: RawHandle,
        batch: &Batch,
        params: &mut [ParamBuffer],
        paramset_size: usize,
    ) -> SqlReturn {
        if let Err(record) = self.require_connected(stmt) {
            return self.fail(stmt, record);
        }
        if self.stmt(stmt).is_some_and(|s| s.cursor_open()) {
            return self.fail(stmt, diag("24000", "Invalid cursor state"));
        }
        let before = self.database.clone();
        match self.run_batch(batch, params, paramset_size.max(1)) {
            Ok(outcomes) => {
                let Some(s) = self.stmt(stmt) else {
                    return SqlReturn::InvalidHandle;
                };
                s.clear_results();
                s.pending_results = outcomes.into();
                s.advance_result();
                SqlReturn::Success
            }
            Err(record) => {
                self.database = before;
                if let Some(s) = self.stmt(stmt) {
                    s.clear_results();
                    s.row_count = -1;
                }
                self.fail(stmt, record)
            }
        }
    }

    fn run_batch(
        &mut self,
        batch: &Batch,
        params: &mut [ParamBuffer],
        paramset_size: usize,
    ) -> SqlResult<Vec<Outcome>> {
        let mut slots: Vec<Option<usize>> = vec![None; batch.param_count];
        for (pos, p) in params.iter().enumerate() {
            if let Some(slot) = slots.get_mut(usize::from(p.index())) {
                *slot = Some(pos);
            }
        }
        if slots.iter().any(Option::is_none) {
            return Err(diag("07002", "COUNT field incorrect"));
        }
        let slots: Vec<usize> = slots.into_iter().flatten().collect();
        if slots.iter().any(|&pos| params[pos].len() < paramset_size) {
            return Err(diag("HY090", "Parameter array shorter than the paramset size"));
        }
        let meta: Vec<ColumnDescription> = slots
            .iter()
            .map(|&pos| ColumnDescription {
                name: String::new(),
                sql_type: params[pos].sql_type(),
                column_size: params[pos].column_size(),
                decimal_digits: params[pos].decimal_digits(),
                nullable: Some(true),
            })
            .collect();

        let mut outcomes = Vec::new();
        for command in &batch.commands {
            let mut affected = 0i64;
            let mut produces_rows = false;
            for row in 0..paramset_size {
                let values: Vec<Value> = slots
                    .iter()
                    .map(|&pos| store::decode_param(&params[pos], row))
                    .collect();
                match command {
                    Command::Select {
                        items,
                        from,
                        filter,
                        order,
                    } => {
                        produces_rows = true;
                        let rows = self.select(
                            items,
                            from.as_deref(),
                            filter.as_ref(),
                            order,
                            &values,
                            &meta,
                        )?;
                        outcomes.push(Outcome::Rows(rows));
                    }
                    Command::Call { name, ret, args } => {
                        produces_rows = true;
                        self.call_procedure(name, *ret, args, &values, &slots, params, row)?;
                        outcomes.push(Outcome::Count(-1));
                    }
                    other => affected += self.modify(other, &values)?,
                }
            }
            if !produces_rows {
                outcomes.push(Outcome::Count(affected));
            }
        }
        Ok(outcomes)
    }

    fn modify(&mut self, command: &Command, values: &[Value]) -> SqlResult<i64> {
        match command {
            Command::CreateTable { name, columns } => {
                self.database.create(name, columns.clone())?;
                Ok(0)
            }
            Command::DropTable { name, if_exists } => {
                self.database.drop_table(name, *if_exists)?;
                Ok(0)
            }
            Command::Insert {
                table,
                columns,
                rows,
            } => {
                let t = self.database.table_mut(table)?;
                let targets: Vec<usize> = match columns {
                    Some(names) => names
                        .iter()
                        .map(|n| t.column_index(n))
                        .collect::<SqlResult<_>>()?,
                    None => (0..t.columns.len()).collect(),
                };
                let mut inserted = Vec::with_capacity(rows.len());
                for exprs in rows {
                    if exprs.len() != targets.len() {
                        return Err(diag(
                            "21S01",
                            "Insert value list does not match column list",
                        ));
                    }
                    let mut row = vec![Value::Null; t.columns.len()];
                    for (expr, &target) in exprs.iter().zip(&targets) {
                        row[target] = eval(expr, None, values)?;
                    }
                    let row = row
                        .into_iter()
                        .zip(&t.columns)
                        .map(|(v, c)| c.coerce(v))
                        .collect::<SqlResult<Vec<_>>>()?;
                    inserted.push(row);
                }
                let n = inserted.len() as i64;
                t.rows.extend(inserted);
                Ok(n)
            }
            Command::Update {
                table,
                assignments,
                filter,
            } => {
                let t = self.database.table_mut(table)?;
                let targets = assignments
                    .iter()
                    .map(|(c, e)| Ok((t.column_index(c)?, e)))
                    .collect::<SqlResult<Vec<_>>>()?;
                let matches = matching_rows(t, filter.as_ref(), values)?;
                for &i in &matches {
                    for &(c, expr) in &targets {
                        let v = eval(expr, Some((&*t, i)), values)?;
                        let v = t.columns[c].coerce(v)?;
                        t.rows[i][c] = v;
                    }
                }
                Ok(matches.len() as i64)
            }
            Command::Delete { table, filter } => {
                let t = self.database.table_mut(table)?;
                let matches = matching_rows(t, filter.as_ref(), values)?;
                let mut index = 0;
                t.rows.retain(|_| {
                    let keep = !matches.contains(&index);
                    index += 1;
                    keep
                });
                Ok(matches.len() as i64)
            }
            Command::Select { .. } | Command::Call { .. } => Ok(0),
        }
    }

    fn select(
        &self,
        items: &[SelectItem],
        from: Option<&str>,
        filter: Option<&Filter>,
        order: &Option<sql::Order>,
        values: &[Value],
        meta: &[ColumnDescription],
    ) -> SqlResult<ResultRows> {
        let describe_expr = |expr: &Expr,
                             alias: &Option<String>,
                             table: Option<&Table>|
         -> SqlResult<ColumnDescription> {
            let name = alias.clone().unwrap_or_default();
            match expr {
                Expr::Column(c) => {
                    let t = table.ok_or_else(|| {
                        diag("42S22", format!("Invalid column name '{}'", c))
                    })?;
                    let mut d = t.columns[t.column_index(c)?].description();
                    if let Some(a) = alias {
                        d.name = a.clone();
                    }
                    Ok(d)
                }
                Expr::Param(o) => {
                    let mut d = meta.get(*o).cloned().unwrap_or_default();
                    d.name = name;
                    Ok(d)
                }
                Expr::Literal(v) => Ok(v.describe(&name)),
            }
        };

        let Some(from) = from else {
            let mut columns = Vec::new();
            let mut row = Vec::new();
            for item in items {
                match item {
                    SelectItem::Expr { expr, alias } => {
                        columns.push(describe_expr(expr, alias, None)?);
                        row.push(eval(expr, None, values)?);
                    }
                    _ => return Err(diag("42000", "Syntax error: '*' requires FROM")),
                }
            }
            return Ok(ResultRows {
                columns,
                rows: vec![row],
            });
        };

        let t = self.database.table(from)?;
        let mut matches = matching_rows(t, filter, values)?;
        if let Some(order) = order {
            let c = t.column_index(&order.column)?;
            matches.sort_by(|&a, &b| {
                let o = t.rows[a][c].sort_cmp(&t.rows[b][c]);
                if order.descending {
                    o.reverse()
                } else {
                    o
                }
            });
        }

        let mut columns = Vec::new();
        for item in items {
            match item {
                SelectItem::Star => columns.extend(t.columns.iter().map(ColumnDef::description)),
                SelectItem::CountStar(alias) => columns.push(ColumnDescription {
                    name: alias.clone().unwrap_or_default(),
                    sql_type: SqlType::BigInt,
                    column_size: 19,
                    decimal_digits: 0,
                    nullable: Some(false),
                }),
                SelectItem::Expr { expr, alias } => {
                    columns.push(describe_expr(expr, alias, Some(t))?)
                }
            }
        }

        let aggregate = items.iter().any(|i| matches!(i, SelectItem::CountStar(_)));
        let project = |i: Option<usize>| -> SqlResult<Vec<Value>> {
            let mut row = Vec::new();
            for item in items {
                match item {
                    SelectItem::Star => match i {
                        Some(i) => row.extend(t.rows[i].iter().cloned()),
                        None => row.extend(t.columns.iter().map(|_| Value::Null)),
                    },
                    SelectItem::CountStar(_) => row.push(Value::Int(matches.len() as i64)),
                    SelectItem::Expr { expr, .. } => match i {
                        Some(i) => row.push(eval(expr, Some((t, i)), values)?),
                        None => row.push(eval(expr, None, values).unwrap_or(Value::Null)),
                    },
                }
            }
            Ok(row)
        };
        let rows = if aggregate {
            vec![project(matches.first().copied())?]
        } else {
            matches
                .iter()
                .map(|&i| project(Some(i)))
                .collect::<SqlResult<_>>()?
        };
        Ok(ResultRows { columns, rows })
    }

    #[allow(clippy::too_many_arguments)]
    fn call_procedure(
        &mut self,
        name: &str,
        ret: Option<usize>,
        args: &[Expr],
        values: &[Value],
        slots: &[usize],
        params: &mut [ParamBuffer],
        row: usize,
    ) -> SqlResult<()> {
        let procedure = self
            .procedures
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| diag("42000", format!("Could not find stored procedure '{}'", name)))?;
        let mut call_args = args
            .iter()
            .map(|a| eval(a, None, values))
            .collect::<SqlResult<Vec<_>>>()?;
        let returned = (*procedure)(&mut call_args[..]);
        if row != 0 {
            return Ok(());
        }
        if let Some(o) = ret {
            let p = &mut params[slots[o]];
            if p.direction().writes_back() {
                store::write_param(p, &returned.unwrap_or(Value::Null))?;
            }
        }
        for (arg, value) in args.iter().zip(&call_args) {
            if let Expr::Param(o) = arg {
                let p = &mut params[slots[*o]];
                if p.direction().writes_back() {
                    store::write_param(p, value)?;
                }
            }
        }
        Ok(())
    }

    fn fetch(
        &mut self,
        stmt: RawHandle,
        orientation: FetchOrientation,
        rowset_size: usize,
        columns: &mut [ColumnBuffer],
        rows_fetched: &mut usize,
    ) -> SqlReturn {
        *rows_fetched = 0;
        let Some(s) = self.stmt(stmt) else {
            return SqlReturn::InvalidHandle;
        };
        let Some(result) = s.rows() else {
            return self.fail(stmt, diag("24000", "Invalid cursor state"));
        };
        let total = result.rows.len();
        let r = rowset_size.max(1);
        let target = next_position(s.cursor.pos, orientation, total, r);
        s.cursor = Cursor {
            pos: target,
            ..Cursor::default()
        };
        let CursorPos::At(start) = target else {
            return SqlReturn::NoData;
        };
        let len = r.min(total - start);
        s.cursor.rowset_len = len;

        let mut truncated = false;
        let mut failure = None;
        if let Some(result) = s.rows() {
            'rows: for i in 0..len {
                for (c, column) in columns.iter_mut().enumerate() {
                    let Some(value) = result.rows[start + i].get(c) else {
                        continue;
                    };
                    match store::fill_cell(column, i, value) {
                        Ok(t) => truncated |= t,
                        Err(record) => {
                            failure = Some(record);
                            break 'rows;
                        }
                    }
                }
            }
        }
        if let Some(record) = failure {
            return self.fail(stmt, record);
        }
        *rows_fetched = len;
        if truncated {
            self.push_diag(stmt, diag("01004", "String data, right truncated"));
            SqlReturn::SuccessWithInfo
        } else {
            SqlReturn::Success
        }
    }

    fn get_data(
        &mut self,
        stmt: RawHandle,
        col: u16,
        ctype: CType,
        buf: &mut [u8],
        indicator: &mut isize,
    ) -> SqlReturn {
        let Some(s) = self.stmt(stmt) else {
            return SqlReturn::InvalidHandle;
        };
        let CursorPos::At(start) = s.cursor.pos else {
            return self.fail(stmt, diag("24000", "Invalid cursor state"));
        };
        let row = start + s.cursor.row;
        let value = match s.rows().and_then(|r| r.rows.get(row)) {
            Some(cells) => match cells.get(usize::from(col)) {
                Some(v) => v.clone(),
                None => return self.fail(stmt, diag("07009", "Invalid descriptor index")),
            },
            None => return self.fail(stmt, diag("24000", "Invalid cursor state")),
        };
        let consumed = s.cursor.reads.get(&col).copied();
        if value.is_null() {
            if consumed.is_some() {
                return SqlReturn::NoData;
            }
            s.cursor.reads.insert(col, 0);
            *indicator = NULL_DATA;
            return SqlReturn::Success;
        }
        let bytes = match store::encode(&value, ctype) {
            Ok(b) => b,
            Err(record) => return self.fail(stmt, record),
        };
        let offset = consumed.unwrap_or(0);
        if consumed.is_some() && offset >= bytes.len() {
            return SqlReturn::NoData;
        }
        let remaining = bytes.len() - offset;
        *indicator = remaining as isize;
        let capacity = match ctype.fixed_width() {
            Some(w) => w,
            None if ctype.is_nul_terminated() => buf.len().saturating_sub(1),
            None => buf.len(),
        };
        if capacity > buf.len() {
            return self.fail(stmt, diag("HY090", "Invalid string or buffer length"));
        }
        let n = remaining.min(capacity);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        if ctype.is_nul_terminated() && n < buf.len() {
            buf[n] = 0;
        }
        s.cursor.reads.insert(col, offset + n);
        if n < remaining {
            self.push_diag(stmt, diag("01004", "String data, right truncated"));
            SqlReturn::SuccessWithInfo
        } else {
            SqlReturn::Success
        }
    }
}

/// Where a scroll request leaves the cursor, following the native
/// interface's block-cursor rules.
fn next_position(
    current: CursorPos,
    orientation: FetchOrientation,
    total: usize,
    rowset: usize,
) -> CursorPos {
    let total_i = total as i64;
    let rowset_i = rowset as i64;
    let absolute = |k: i64| -> CursorPos {
        if k > 0 {
            if k > total_i {
                CursorPos::AfterLast
            } else {
                CursorPos::At((k - 1) as usize)
            }
        } else if k < 0 {
            if -k <= total_i {
                CursorPos::At((total_i + k) as usize)
            } else if -k > rowset_i {
                CursorPos::BeforeFirst
            } else if total > 0 {
                CursorPos::At(0)
            } else {
                CursorPos::BeforeFirst
            }
        } else {
            CursorPos::BeforeFirst
        }
    };
    match orientation {
        FetchOrientation::Next => match current {
            CursorPos::BeforeFirst => absolute(1),
            CursorPos::At(start) => absolute(start as i64 + rowset_i + 1),
            CursorPos::AfterLast => CursorPos::AfterLast,
        },
        FetchOrientation::Prior => match current {
            CursorPos::BeforeFirst => CursorPos::BeforeFirst,
            CursorPos::At(0) => CursorPos::BeforeFirst,
            CursorPos::At(start) if start < rowset => CursorPos::At(0),
            CursorPos::At(start) => CursorPos::At(start - rowset),
            CursorPos::AfterLast if total == 0 => CursorPos::BeforeFirst,
            CursorPos::AfterLast => CursorPos::At(total.saturating_sub(rowset)),
        },
        FetchOrientation::First => absolute(1),
        FetchOrientation::Last => {
            if total == 0 {
                CursorPos::AfterLast
            } else {
                CursorPos::At(total.saturating_sub(rowset))
            }
        }
        FetchOrientation::Absolute(k) => absolute(k),
        FetchOrientation::Relative(k) => match current {
            CursorPos::BeforeFirst if k > 0 => absolute(k),
            CursorPos::BeforeFirst => CursorPos::BeforeFirst,
            CursorPos::AfterLast if k < 0 => absolute(total_i + 1 + k),
            CursorPos::AfterLast => CursorPos::AfterLast,
            CursorPos::At(start) => {
                let target = start as i64 + 1 + k;
                if target < 1 {
                    if -k > rowset_i {
                        CursorPos::BeforeFirst
                    } else {
                        absolute(1)
                    }
                } else {
                    absolute(target)
                }
            }
        },
    }
}

fn eval(expr: &Expr, row: Option<(&Table, usize)>, values: &[Value]) -> SqlResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Param(o) => values
            .get(*o)
            .cloned()
            .ok_or_else(|| diag("07002", "COUNT field incorrect")),
        Expr::Column(name) => match row {
            Some((t, i)) => Ok(t.rows[i][t.column_index(name)?].clone()),
            None => Err(diag("42S22", format!("Invalid column name '{}'", name))),
        },
    }
}

fn matching_rows(t: &Table, filter: Option<&Filter>, values: &[Value]) -> SqlResult<Vec<usize>> {
    let Some(filter) = filter else {
        return Ok((0..t.rows.len()).collect());
    };
    let c = t.column_index(&filter.column)?;
    let mut out = Vec::new();
    for i in 0..t.rows.len() {
        let rhs = eval(&filter.value, Some((t, i)), values)?;
        if t.rows[i][c].sql_eq(&rhs) {
            out.push(i);
        }
    }
    Ok(out)
}

/// Parameter types as far as the statement text reveals them.
fn describe_params(db: &Database, batch: &Batch) -> Vec<ParamDescription> {
    let fallback = ParamDescription {
        sql_type: SqlType::Varchar,
        column_size: 255,
        decimal_digits: 0,
        nullable: Some(true),
    };
    let mut out = vec![fallback; batch.param_count];
    let mut note = |expr: &Expr, column: Option<&ColumnDef>| {
        if let (Expr::Param(o), Some(c)) = (expr, column) {
            if let Some(slot) = out.get_mut(*o) {
                *slot = ParamDescription {
                    sql_type: c.sql_type,
                    column_size: c.size,
                    decimal_digits: c.digits,
                    nullable: Some(c.nullable),
                };
            }
        }
    };
    for command in &batch.commands {
        match command {
            Command::Insert {
                table,
                columns,
                rows,
            } => {
                let Ok(t) = db.table(table) else { continue };
                let targets: Vec<Option<&ColumnDef>> = match columns {
                    Some(names) => names
                        .iter()
                        .map(|n| t.column_index(n).ok().map(|i| &t.columns[i]))
                        .collect(),
                    None => t.columns.iter().map(Some).collect(),
                };
                for exprs in rows {
                    for (expr, col) in exprs.iter().zip(&targets) {
                        note(expr, *col);
                    }
                }
            }
            Command::Select {
                from: Some(table),
                filter: Some(f),
                ..
            }
            | Command::Delete {
                table,
                filter: Some(f),
            } => {
                if let Ok(t) = db.table(table) {
                    note(&f.value, t.column_index(&f.column).ok().map(|i| &t.columns[i]));
                }
            }
            Command::Update {
                table,
                assignments,
                filter,
            } => {
                let Ok(t) = db.table(table) else { continue };
                for (c, e) in assignments {
                    note(e, t.column_index(c).ok().map(|i| &t.columns[i]));
                }
                if let Some(f) = filter {
                    note(&f.value, t.column_index(&f.column).ok().map(|i| &t.columns[i]));
                }
            }
            _ => {}
        }
    }
    out
}

fn parse_conn_str(conn_str: &str) -> HashMap<String, String> {
    conn_str
        .split(';')
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| {
            (
                k.trim().to_ascii_lowercase(),
                v.trim().trim_start_matches('{').trim_end_matches('}').to_string(),
            )
        })
        .collect()
}

impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn alloc_handle(
        &self,
        kind: HandleKind,
        parent: Option<RawHandle>,
        out: &mut Option<RawHandle>,
    ) -> SqlReturn {
        let mut inner = self.lock();
        *out = None;
        let body = match (kind, parent) {
            (HandleKind::Environment, None) => Body::Env,
            (HandleKind::Connection, Some(p)) => {
                if inner.entry(HandleKind::Environment, p).is_none() {
                    return SqlReturn::InvalidHandle;
                }
                Body::Dbc(Dbc {
                    connected: false,
                    data_source: String::new(),
                    autocommit: true,
                    snapshot: None,
                })
            }
            (HandleKind::Statement, Some(p)) => {
                match inner.entry(HandleKind::Connection, p) {
                    None => return SqlReturn::InvalidHandle,
                    Some(e) => {
                        e.diags.clear();
                        if !matches!(&e.body, Body::Dbc(d) if d.connected) {
                            e.diags.push(diag("08003", "Connection not open"));
                            return SqlReturn::Error;
                        }
                    }
                }
                Body::Stmt(Stmt {
                    row_count: -1,
                    ..Stmt::default()
                })
            }
            _ => return SqlReturn::Error,
        };
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            id,
            Entry {
                kind,
                parent: parent.map(RawHandle::as_usize),
                diags: Vec::new(),
                event: None,
                pending: None,
                body,
            },
        );
        *out = Some(RawHandle::new(id));
        SqlReturn::Success
    }

    fn free_handle(&self, kind: HandleKind, handle: RawHandle) -> SqlReturn {
        let mut inner = self.lock();
        let id = handle.as_usize();
        let Some(entry) = inner.entry(kind, handle) else {
            inner.invalid_frees += 1;
            return SqlReturn::InvalidHandle;
        };
        entry.diags.clear();
        let busy = match &entry.body {
            Body::Dbc(d) => d.connected,
            _ => false,
        };
        if busy {
            return inner.fail(handle, diag("HY010", "Function sequence error"));
        }
        let has_children = inner.entries.values().any(|e| e.parent == Some(id));
        if has_children {
            return inner.fail(handle, diag("HY010", "Function sequence error"));
        }
        inner.entries.remove(&id);
        inner.freed += 1;
        SqlReturn::Success
    }

    fn diag_record(&self, kind: HandleKind, handle: RawHandle, rec: i16) -> Option<DiagRecord> {
        let mut inner = self.lock();
        let index = usize::try_from(rec).ok()?.checked_sub(1)?;
        inner
            .entry(kind, handle)
            .and_then(|e| e.diags.get(index).cloned())
    }

    fn driver_connect(
        &self,
        dbc: RawHandle,
        conn_str: &str,
        login_timeout: Option<u32>,
    ) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Connection, dbc, true, |inner| {
            let attrs = parse_conn_str(conn_str);
            let source = ["dsn", "database", "driver"]
                .iter()
                .find_map(|k| attrs.get(*k).cloned());
            let Some(source) = source else {
                return inner.fail(
                    dbc,
                    diag(
                        "IM002",
                        "Data source name not found and no default driver specified",
                    ),
                );
            };
            let password = attrs.get("pwd").or_else(|| attrs.get("password")).cloned();
            inner.open_session(dbc, source, password.as_deref(), login_timeout)
        })
    }

    fn connect(
        &self,
        dbc: RawHandle,
        dsn: &str,
        _user: &str,
        password: &str,
        login_timeout: Option<u32>,
    ) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Connection, dbc, true, |inner| {
            if dsn.is_empty() {
                return inner.fail(
                    dbc,
                    diag(
                        "IM002",
                        "Data source name not found and no default driver specified",
                    ),
                );
            }
            inner.open_session(dbc, dsn.to_string(), Some(password), login_timeout)
        })
    }

    fn disconnect(&self, dbc: RawHandle) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Connection, dbc, false, |inner| inner.close_session(dbc))
    }

    fn set_autocommit(&self, dbc: RawHandle, enabled: bool) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Connection, dbc, false, |inner| {
            let current = inner.database.clone();
            let Some(d) = inner.dbc(dbc) else {
                return SqlReturn::InvalidHandle;
            };
            if !d.connected {
                return inner.fail(dbc, diag("08003", "Connection not open"));
            }
            match (d.autocommit, enabled) {
                (true, false) => d.snapshot = Some(current),
                // Turning auto-commit back on commits the open transaction.
                (false, true) => d.snapshot = None,
                _ => {}
            }
            d.autocommit = enabled;
            SqlReturn::Success
        })
    }

    fn end_transaction(&self, dbc: RawHandle, commit: bool) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Connection, dbc, false, |inner| {
            let current = inner.database.clone();
            let Some(d) = inner.dbc(dbc) else {
                return SqlReturn::InvalidHandle;
            };
            if !d.connected {
                return inner.fail(dbc, diag("08003", "Connection not open"));
            }
            if d.autocommit {
                return SqlReturn::Success;
            }
            if commit {
                d.snapshot = Some(current);
            } else if let Some(snapshot) = d.snapshot.clone() {
                inner.database = snapshot;
            }
            SqlReturn::Success
        })
    }

    fn get_info(&self, dbc: RawHandle, info: InfoKind, out: &mut String) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Connection, dbc, false, |inner| {
            let Some(d) = inner.dbc(dbc) else {
                return SqlReturn::InvalidHandle;
            };
            if !d.connected {
                return inner.fail(dbc, diag("08003", "Connection not open"));
            }
            *out = match info {
                InfoKind::DbmsName => DBMS_NAME.to_string(),
                InfoKind::DbmsVersion => DBMS_VERSION.to_string(),
                InfoKind::DataSourceName => d.data_source.clone(),
                InfoKind::DriverName => DRIVER_NAME.to_string(),
            };
            SqlReturn::Success
        })
    }

    fn prepare(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, true, |inner| inner.prepare(stmt, sql))
    }

    fn num_params(&self, stmt: RawHandle, out: &mut u16) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, false, |inner| {
            match inner.stmt(stmt).and_then(|s| s.prepared.as_ref()) {
                Some(batch) => {
                    *out = u16::try_from(batch.param_count).unwrap_or(u16::MAX);
                    SqlReturn::Success
                }
                None => inner.fail(stmt, diag("HY010", "Function sequence error")),
            }
        })
    }

    fn describe_param(
        &self,
        stmt: RawHandle,
        param: u16,
        out: &mut ParamDescription,
    ) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, false, |inner| {
            match inner
                .stmt(stmt)
                .and_then(|s| s.param_descs.get(usize::from(param)).copied())
            {
                Some(d) => {
                    *out = d;
                    SqlReturn::Success
                }
                None => inner.fail(stmt, diag("07009", "Invalid descriptor index")),
            }
        })
    }

    fn execute(
        &self,
        stmt: RawHandle,
        params: &mut [ParamBuffer],
        paramset_size: usize,
    ) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, true, |inner| {
            let Some(batch) = inner.stmt(stmt).and_then(|s| s.prepared.clone()) else {
                return inner.fail(stmt, diag("HY010", "Function sequence error"));
            };
            inner.run(stmt, &batch, params, paramset_size)
        })
    }

    fn exec_direct(
        &self,
        stmt: RawHandle,
        sql: &str,
        params: &mut [ParamBuffer],
        paramset_size: usize,
    ) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, true, |inner| {
            if let Some(s) = inner.stmt(stmt) {
                s.prepared = None;
                s.param_descs.clear();
            }
            match sql::parse(sql) {
                Ok(batch) => inner.run(stmt, &batch, params, paramset_size),
                Err(record) => inner.fail(stmt, record),
            }
        })
    }

    fn row_count(&self, stmt: RawHandle, out: &mut i64) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, false, |inner| {
            match inner.stmt(stmt) {
                Some(s) => {
                    *out = s.row_count;
                    SqlReturn::Success
                }
                None => SqlReturn::InvalidHandle,
            }
        })
    }

    fn num_result_cols(&self, stmt: RawHandle, out: &mut u16) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, false, |inner| {
            match inner.stmt(stmt) {
                Some(s) => {
                    let n = s.rows().map(|r| r.columns.len()).unwrap_or(0);
                    *out = u16::try_from(n).unwrap_or(u16::MAX);
                    SqlReturn::Success
                }
                None => SqlReturn::InvalidHandle,
            }
        })
    }

    fn describe_col(&self, stmt: RawHandle, col: u16, out: &mut ColumnDescription) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, false, |inner| {
            let described = inner
                .stmt(stmt)
                .and_then(|s| s.rows())
                .and_then(|r| r.columns.get(usize::from(col)).cloned());
            match described {
                Some(d) => {
                    *out = d;
                    SqlReturn::Success
                }
                None => inner.fail(stmt, diag("07009", "Invalid descriptor index")),
            }
        })
    }

    fn fetch_scroll(
        &self,
        stmt: RawHandle,
        orientation: FetchOrientation,
        rowset_size: usize,
        columns: &mut [ColumnBuffer],
        rows_fetched: &mut usize,
    ) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, false, |inner| {
            inner.fetch(stmt, orientation, rowset_size, columns, rows_fetched)
        })
    }

    fn row_number(&self, stmt: RawHandle, out: &mut u64) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, false, |inner| {
            if !inner.row_numbers {
                return inner.fail(stmt, diag("HYC00", "Optional feature not implemented"));
            }
            match inner.stmt(stmt) {
                Some(s) => {
                    *out = match s.cursor.pos {
                        CursorPos::At(start) => start as u64 + 1,
                        _ => 0,
                    };
                    SqlReturn::Success
                }
                None => SqlReturn::InvalidHandle,
            }
        })
    }

    fn reset_parameters(&self, stmt: RawHandle) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, false, |inner| {
            inner.param_resets += 1;
            SqlReturn::Success
        })
    }

    fn set_position(&self, stmt: RawHandle, row: usize) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, false, |inner| {
            let Some(s) = inner.stmt(stmt) else {
                return SqlReturn::InvalidHandle;
            };
            if !matches!(s.cursor.pos, CursorPos::At(_)) {
                return inner.fail(stmt, diag("24000", "Invalid cursor state"));
            }
            if row >= s.cursor.rowset_len {
                return inner.fail(stmt, diag("HY107", "Row value out of range"));
            }
            s.cursor.row = row;
            s.cursor.reads.clear();
            SqlReturn::Success
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
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, false, |inner| {
            inner.get_data(stmt, col, ctype, buf, indicator)
        })
    }

    fn more_results(&self, stmt: RawHandle) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, false, |inner| {
            match inner.stmt(stmt) {
                Some(s) if s.current.is_none() => SqlReturn::NoData,
                Some(s) => {
                    if s.advance_result() {
                        SqlReturn::Success
                    } else {
                        SqlReturn::NoData
                    }
                }
                None => SqlReturn::InvalidHandle,
            }
        })
    }

    fn close_cursor(&self, stmt: RawHandle) -> SqlReturn {
        let mut inner = self.lock();
        inner.call(HandleKind::Statement, stmt, false, |inner| {
            match inner.stmt(stmt) {
                Some(s) => {
                    s.clear_results();
                    SqlReturn::Success
                }
                None => SqlReturn::InvalidHandle,
            }
        })
    }

    fn cancel(&self, stmt: RawHandle) -> SqlReturn {
        let mut inner = self.lock();
        let Some(entry) = inner.entry(HandleKind::Statement, stmt) else {
            return SqlReturn::InvalidHandle;
        };
        if let Some(pending) = entry.pending.as_mut() {
            pending.outcome = SqlReturn::Error;
            pending.polls_left = 0;
            entry.diags = vec![diag("HY008", "Operation canceled")];
            if let Body::Stmt(s) = &mut entry.body {
                s.clear_results();
            }
        } else {
            entry.diags.clear();
        }
        SqlReturn::Success
    }

    fn supports_async(&self) -> bool {
        true
    }

    fn set_async_event(
        &self,
        kind: HandleKind,
        handle: RawHandle,
        event: Option<EventHandle>,
    ) -> SqlReturn {
        let mut inner = self.lock();
        let Some(entry) = inner.entry(kind, handle) else {
            return SqlReturn::InvalidHandle;
        };
        if entry.pending.is_some() {
            entry.diags = vec![diag("HY010", "Function sequence error")];
            return SqlReturn::Error;
        }
        entry.diags.clear();
        entry.event = event;
        SqlReturn::Success
    }

    fn complete_async(
        &self,
        kind: HandleKind,
        handle: RawHandle,
        outcome: &mut SqlReturn,
    ) -> SqlReturn {
        let mut inner = self.lock();
        let Some(entry) = inner.entry(kind, handle) else {
            return SqlReturn::InvalidHandle;
        };
        match entry.pending.as_mut() {
            None => {
                entry.diags = vec![diag("HY010", "Function sequence error")];
                SqlReturn::Error
            }
            Some(p) if p.polls_left > 0 => {
                p.polls_left -= 1;
                SqlReturn::StillExecuting
            }
            Some(p) => {
                *outcome = p.outcome;
                entry.pending = None;
                SqlReturn::Success
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ParamDirection;

    struct Session {
        driver: MemoryDriver,
        env: RawHandle,
        dbc: RawHandle,
        stmt: RawHandle,
    }

    fn alloc(d: &MemoryDriver, kind: HandleKind, parent: Option<RawHandle>) -> RawHandle {
        let mut out = None;
        assert_eq!(d.alloc_handle(kind, parent, &mut out), SqlReturn::Success);
        out.unwrap()
    }

    fn session() -> Session {
        let driver = MemoryDriver::new();
        let env = alloc(&driver, HandleKind::Environment, None);
        let dbc = alloc(&driver, HandleKind::Connection, Some(env));
        assert_eq!(
            driver.driver_connect(dbc, "DSN=test", None),
            SqlReturn::Success
        );
        let stmt = alloc(&driver, HandleKind::Statement, Some(dbc));
        Session {
            driver,
            env,
            dbc,
            stmt,
        }
    }

    fn exec(s: &Session, sql: &str) -> SqlReturn {
        s.driver.close_cursor(s.stmt);
        s.driver.exec_direct(s.stmt, sql, &mut [], 1)
    }

    #[test]
    fn test_scroll_positions_follow_block_cursor_rules() {
        let at = |p| CursorPos::At(p);
        assert_eq!(
            next_position(CursorPos::BeforeFirst, FetchOrientation::Next, 5, 2),
            at(0)
        );
        assert_eq!(next_position(at(4), FetchOrientation::Next, 5, 2), CursorPos::AfterLast);
        assert_eq!(next_position(at(1), FetchOrientation::Prior, 5, 2), at(0));
        assert_eq!(next_position(at(0), FetchOrientation::Prior, 5, 2), CursorPos::BeforeFirst);
        assert_eq!(next_position(CursorPos::AfterLast, FetchOrientation::Prior, 5, 2), at(3));
        assert_eq!(next_position(at(0), FetchOrientation::Last, 5, 2), at(3));
        assert_eq!(next_position(at(0), FetchOrientation::Absolute(6), 5, 1), CursorPos::AfterLast);
        assert_eq!(next_position(at(0), FetchOrientation::Absolute(-1), 5, 1), at(4));
        assert_eq!(next_position(at(2), FetchOrientation::Relative(-2), 5, 1), at(0));
        assert_eq!(
            next_position(CursorPos::BeforeFirst, FetchOrientation::First, 0, 1),
            CursorPos::AfterLast
        );
    }

    #[test]
    fn test_statement_requires_connected_parent() {
        let d = MemoryDriver::new();
        let env = alloc(&d, HandleKind::Environment, None);
        let dbc = alloc(&d, HandleKind::Connection, Some(env));
        let mut out = None;
        assert_eq!(
            d.alloc_handle(HandleKind::Statement, Some(dbc), &mut out),
            SqlReturn::Error
        );
        assert_eq!(
            d.diag_record(HandleKind::Connection, dbc, 1)
                .map(|r| r.state_str().to_string()),
            Some("08003".to_string())
        );
    }

    #[test]
    fn test_disconnect_releases_statements() {
        let s = session();
        assert_eq!(s.driver.live_handles(), 3);
        assert_eq!(s.driver.disconnect(s.dbc), SqlReturn::Success);
        assert_eq!(s.driver.live_handles(), 2);
        assert_eq!(
            s.driver.free_handle(HandleKind::Statement, s.stmt),
            SqlReturn::InvalidHandle
        );
        assert_eq!(s.driver.invalid_frees(), 1);
        assert_eq!(s.driver.free_handle(HandleKind::Connection, s.dbc), SqlReturn::Success);
        assert_eq!(s.driver.free_handle(HandleKind::Environment, s.env), SqlReturn::Success);
        assert_eq!(s.driver.live_handles(), 0);
    }

    #[test]
    fn test_rollback_restores_snapshot() {
        let s = session();
        exec(&s, "CREATE TABLE t (a INT)");
        s.driver.set_autocommit(s.dbc, false);
        exec(&s, "INSERT INTO t VALUES (1)");
        assert_eq!(s.driver.table_rows("t"), Some(1));
        s.driver.end_transaction(s.dbc, false);
        assert_eq!(s.driver.table_rows("t"), Some(0));
        exec(&s, "INSERT INTO t VALUES (2)");
        s.driver.end_transaction(s.dbc, true);
        s.driver.set_autocommit(s.dbc, true);
        assert_eq!(s.driver.table_rows("t"), Some(1));
    }

    #[test]
    fn test_get_data_chunks_long_value() {
        let s = session();
        exec(&s, "CREATE TABLE t (body TEXT)");
        exec(&s, &format!("INSERT INTO t VALUES ('{}')", "x".repeat(10)));
        exec(&s, "SELECT body FROM t");
        let mut fetched = 0;
        let mut cols = vec![ColumnBuffer::new(CType::Char, 4, 1)];
        assert_eq!(
            s.driver
                .fetch_scroll(s.stmt, FetchOrientation::Next, 1, &mut cols, &mut fetched),
            SqlReturn::SuccessWithInfo
        );
        assert_eq!(fetched, 1);
        assert_eq!(cols[0].indicator(0), 10);

        let mut buf = [0u8; 5];
        let mut ind = 0;
        let mut collected = Vec::new();
        loop {
            match s.driver.get_data(s.stmt, 0, CType::Char, &mut buf, &mut ind) {
                SqlReturn::NoData => break,
                rc => {
                    assert!(rc.is_success());
                    let n = (ind as usize).min(4);
                    collected.extend_from_slice(&buf[..n]);
                }
            }
        }
        assert_eq!(collected, b"xxxxxxxxxx");
    }

    #[test]
    fn test_procedure_writes_back_output_params() {
        let s = session();
        s.driver.register_procedure("double_it", |args| {
            let v = match &args[0] {
                Value::Int(v) => *v,
                _ => 0,
            };
            args[1] = Value::Int(v * 2);
            Some(Value::Int(7))
        });
        let mut params = vec![
            ParamBuffer::output::<i32>(0, ParamDirection::Return, 0),
            ParamBuffer::from_values(1, &[21i32], None, ParamDirection::Input).unwrap(),
            ParamBuffer::output::<i32>(2, ParamDirection::Output, 0),
        ];
        assert_eq!(
            s.driver
                .exec_direct(s.stmt, "{? = CALL double_it(?, ?)}", &mut params, 1),
            SqlReturn::Success
        );
        assert_eq!(params[0].element(0), &7i32.to_ne_bytes());
        assert_eq!(params[2].element(0), &42i32.to_ne_bytes());
    }

    #[test]
    fn test_async_call_reports_after_latency() {
        let s = session();
        s.driver.set_async_latency(1);
        let event = Some(EventHandle::new(9));
        assert_eq!(
            s.driver.set_async_event(HandleKind::Statement, s.stmt, event),
            SqlReturn::Success
        );
        assert_eq!(
            s.driver.exec_direct(s.stmt, "SELECT 1", &mut [], 1),
            SqlReturn::StillExecuting
        );
        let mut outcome = SqlReturn::Error;
        assert_eq!(
            s.driver
                .complete_async(HandleKind::Statement, s.stmt, &mut outcome),
            SqlReturn::StillExecuting
        );
        assert_eq!(
            s.driver
                .complete_async(HandleKind::Statement, s.stmt, &mut outcome),
            SqlReturn::Success
        );
        assert_eq!(outcome, SqlReturn::Success);
    }

    #[test]
    fn test_execute_with_open_cursor_is_rejected() {
        let s = session();
        assert_eq!(exec(&s, "SELECT 1"), SqlReturn::Success);
        assert_eq!(
            s.driver.exec_direct(s.stmt, "SELECT 2", &mut [], 1),
            SqlReturn::Error
        );
        assert_eq!(
            s.driver
                .diag_record(HandleKind::Statement, s.stmt, 1)
                .map(|r| r.state_str().to_string()),
            Some("24000".to_string())
        );
    }
}
