use super::result::ResultSet;
use super::statement::Statement;
use super::transaction::Transaction;
use crate::async_bridge::{AsyncOperation, AsyncState};
use crate::config::Settings;
use crate::driver::{Driver, EventHandle, HandleKind, InfoKind, SqlReturn};
use crate::error::{OdbcError, Result};
use crate::handles::HandleGuard;
use crate::observability::{mask_connection_string, StructuredLogger};
use log::Level;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectOp {
    DriverConnect,
}

/// Shared state behind every alias of one [`Connection`].
pub(crate) struct ConnectionImpl {
    // Declared before `env` so the connection handle is freed first.
    dbc: HandleGuard,
    env: HandleGuard,
    driver: Arc<dyn Driver>,
    settings: Settings,
    connected: bool,
    /// Bumped on every disconnect; statements opened in an older session
    /// hold handles the driver has already released.
    session: u64,
    transactions: usize,
    rollback_pending: bool,
    async_op: AsyncOperation<ConnectOp>,
    pending_connect: Option<(Settings, String)>,
    target: String,
    logger: StructuredLogger,
}

impl ConnectionImpl {
    fn new(driver: Arc<dyn Driver>, settings: Settings) -> Result<Self> {
        settings.validate()?;
        let env = HandleGuard::acquire(&driver, HandleKind::Environment, None)?;
        let dbc = HandleGuard::acquire(&driver, HandleKind::Connection, Some(&env))?;
        Ok(Self {
            dbc,
            env,
            driver,
            settings,
            connected: false,
            session: 0,
            transactions: 0,
            rollback_pending: false,
            async_op: AsyncOperation::new(),
            pending_connect: None,
            target: String::new(),
            logger: StructuredLogger::default(),
        })
    }

    /// Strips client-side options and returns the settings plus the string
    /// handed to the driver.
    fn prepare_connect(
        &mut self,
        connection_string: &str,
    ) -> Result<(Settings, Zeroizing<String>)> {
        self.async_op.ensure_idle()?;
        self.disconnect()?;
        let (settings, sanitized) = self.settings.apply_connection_options(connection_string);
        if sanitized.trim().is_empty() {
            return Err(OdbcError::EmptyConnectionString);
        }
        Ok((settings, Zeroizing::new(sanitized)))
    }

    fn established(&mut self, settings: Settings, target: String) {
        self.settings = settings;
        self.target = target;
        self.connected = true;
        self.logger
            .log_connection(Level::Info, &self.target, "established");
    }

    fn connect_string(&mut self, connection_string: &str, timeout: Option<u32>) -> Result<()> {
        let (settings, sanitized) = self.prepare_connect(connection_string)?;
        let timeout = timeout.or(settings.login_timeout_secs);
        let rc = self
            .driver
            .driver_connect(self.dbc.raw(), sanitized.as_str(), timeout);
        if let Err(e) = self.dbc.check(rc, "connect") {
            self.logger
                .log_connection(Level::Warn, sanitized.as_str(), "failed");
            return Err(e);
        }
        self.established(settings, mask_connection_string(sanitized.as_str()));
        Ok(())
    }

    fn connect_dsn(
        &mut self,
        dsn: &str,
        user: &str,
        password: Zeroizing<String>,
        timeout: Option<u32>,
    ) -> Result<()> {
        self.async_op.ensure_idle()?;
        self.disconnect()?;
        let timeout = timeout.or(self.settings.login_timeout_secs);
        let rc = self
            .driver
            .connect(self.dbc.raw(), dsn, user, password.as_str(), timeout);
        self.check(rc, "connect")?;
        let settings = self.settings;
        self.established(settings, format!("DSN={};UID={}", dsn, user));
        Ok(())
    }

    fn async_connect(
        &mut self,
        connection_string: &str,
        event: EventHandle,
        timeout: Option<u32>,
    ) -> Result<()> {
        let (settings, sanitized) = self.prepare_connect(connection_string)?;
        let timeout = timeout.or(settings.login_timeout_secs);
        let driver = Arc::clone(&self.driver);
        let raw = self.dbc.raw();
        self.async_op.start(&self.dbc, event, ConnectOp::DriverConnect, || {
            driver.driver_connect(raw, sanitized.as_str(), timeout)
        })?;
        self.pending_connect = Some((settings, mask_connection_string(sanitized.as_str())));
        Ok(())
    }

    fn async_complete(&mut self) -> Result<()> {
        let finished = self.async_op.complete(&self.dbc);
        let pending = self.pending_connect.take();
        finished?;
        let (settings, target) = pending.unwrap_or((self.settings, String::new()));
        self.established(settings, target);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.async_op.ensure_idle()?;
        if self.transactions > 0 {
            log::warn!(
                "Disconnecting with {} open transaction scope(s) - rolling back",
                self.transactions
            );
            self.finish_native(false);
            self.transactions = 0;
            self.rollback_pending = false;
        }
        let rc = self.driver.disconnect(self.dbc.raw());
        self.check(rc, "disconnect")?;
        self.connected = false;
        self.session += 1;
        self.logger
            .log_connection(Level::Info, &self.target, "closed");
        Ok(())
    }

    fn check(&self, rc: SqlReturn, context: &str) -> Result<SqlReturn> {
        self.dbc.check(rc, context).map_err(|e| {
            self.logger.log_failure(context, &e);
            e
        })
    }

    fn info(&self, kind: InfoKind) -> Result<String> {
        self.ensure_connected()?;
        let mut out = String::new();
        let rc = self.driver.get_info(self.dbc.raw(), kind, &mut out);
        self.check(rc, "get connection info")?;
        Ok(out)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(OdbcError::Programming("connection is not open".to_string()))
        }
    }

    /// Allocates a statement handle for the current session.
    pub(crate) fn open_statement(&self) -> Result<(HandleGuard, u64, Settings)> {
        self.ensure_connected()?;
        let stmt = HandleGuard::acquire(&self.driver, HandleKind::Statement, Some(&self.dbc))?;
        Ok((stmt, self.session, self.settings))
    }

    /// True while handles allocated in `session` are still owned by us.
    pub(crate) fn session_alive(&self, session: u64) -> bool {
        self.connected && self.session == session
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn session(&self) -> u64 {
        self.session
    }

    pub(crate) fn transaction_depth(&self) -> usize {
        self.transactions
    }

    pub(crate) fn enter_transaction(&mut self) -> Result<u64> {
        if self.transactions == 0 && self.connected {
            let rc = self.driver.set_autocommit(self.dbc.raw(), false);
            self.check(rc, "disable auto-commit")?;
        }
        self.transactions += 1;
        Ok(self.session)
    }

    pub(crate) fn commit_transaction(&mut self, session: u64) -> Result<()> {
        if session != self.session {
            return Err(OdbcError::Programming(
                "connection was closed while the transaction was open".to_string(),
            ));
        }
        self.transactions = self.transactions.saturating_sub(1);
        if self.transactions > 0 {
            return Ok(());
        }
        let rolled_back = std::mem::take(&mut self.rollback_pending);
        if !self.connected {
            return Ok(());
        }
        if rolled_back {
            self.finish_native(false);
            return Err(OdbcError::Programming(
                "transaction was rolled back by an inner scope".to_string(),
            ));
        }
        let rc = self.driver.end_transaction(self.dbc.raw(), true);
        if let Err(e) = self.check(rc, "commit transaction") {
            self.finish_native(false);
            return Err(e);
        }
        self.restore_autocommit();
        Ok(())
    }

    /// Never fails; native errors are logged.
    pub(crate) fn rollback_transaction(&mut self, session: u64) {
        if session != self.session {
            return;
        }
        self.transactions = self.transactions.saturating_sub(1);
        self.rollback_pending = true;
        if self.transactions == 0 {
            if self.connected {
                self.finish_native(false);
            }
            self.rollback_pending = false;
        }
    }

    fn finish_native(&self, commit: bool) {
        let rc = self.driver.end_transaction(self.dbc.raw(), commit);
        if let Err(e) = self.dbc.check(rc, "end transaction") {
            log::warn!("{}", e);
        }
        self.restore_autocommit();
    }

    fn restore_autocommit(&self) {
        let rc = self.driver.set_autocommit(self.dbc.raw(), true);
        if let Err(e) = self.dbc.check(rc, "enable auto-commit") {
            log::warn!("{}", e);
        }
    }
}

impl Drop for ConnectionImpl {
    fn drop(&mut self) {
        if self.async_op.state() != AsyncState::Idle {
            // An uncollected connect may still have succeeded on the driver.
            match self.async_op.complete(&self.dbc) {
                Ok(_) => self.connected = true,
                Err(e) => log::debug!("Discarding asynchronous connect on drop: {}", e),
            }
            self.pending_connect = None;
        }
        if let Err(e) = self.disconnect() {
            log::warn!("Failed to disconnect on drop: {}", e);
        }
        log::debug!("{}: releasing {:?}", self.driver.name(), self.env.raw());
    }
}

/// A connection to a data source.
///
/// Clones alias the same native connection: `disconnect` through one clone
/// is seen by all of them, and the handles are released when the last clone
/// drops.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Mutex<ConnectionImpl>>,
}

impl Connection {
    /// Allocates environment and connection handles without connecting.
    pub fn new(driver: Arc<dyn Driver>) -> Result<Self> {
        Self::with_settings(driver, Settings::default())
    }

    pub fn with_settings(driver: Arc<dyn Driver>, settings: Settings) -> Result<Self> {
        let inner = ConnectionImpl::new(driver, settings)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Allocates handles and connects with `connection_string`.
    pub fn open(driver: Arc<dyn Driver>, connection_string: &str) -> Result<Self> {
        let conn = Self::new(driver)?;
        conn.connect(connection_string)?;
        Ok(conn)
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, ConnectionImpl>> {
        self.inner
            .lock()
            .map_err(|_| OdbcError::InternalError("Failed to lock connection mutex".to_string()))
    }

    /// Connects with a driver connection string, disconnecting first if
    /// already connected. `RowsetSize=`, `ColumnFloor=` and `LoginTimeout=`
    /// are consumed here and never reach the driver.
    pub fn connect(&self, connection_string: &str) -> Result<()> {
        if connection_string.trim().is_empty() {
            return Err(OdbcError::EmptyConnectionString);
        }
        self.lock()?.connect_string(connection_string, None)
    }

    pub fn connect_with_timeout(&self, connection_string: &str, timeout_secs: u32) -> Result<()> {
        if connection_string.trim().is_empty() {
            return Err(OdbcError::EmptyConnectionString);
        }
        self.lock()?
            .connect_string(connection_string, Some(timeout_secs))
    }

    /// Connects to a named data source.
    pub fn connect_dsn(
        &self,
        dsn: &str,
        user: &str,
        password: &str,
        timeout_secs: Option<u32>,
    ) -> Result<()> {
        if dsn.trim().is_empty() {
            return Err(OdbcError::EmptyConnectionString);
        }
        let password = Zeroizing::new(password.to_string());
        self.lock()?.connect_dsn(dsn, user, password, timeout_secs)
    }

    /// Starts connecting and returns while the driver works. Finish with
    /// [`Connection::async_complete`] once `event` is signalled or
    /// [`Connection::poll`] reports completion.
    pub fn async_connect(
        &self,
        connection_string: &str,
        event: EventHandle,
        timeout_secs: Option<u32>,
    ) -> Result<()> {
        if connection_string.trim().is_empty() {
            return Err(OdbcError::EmptyConnectionString);
        }
        self.lock()?
            .async_connect(connection_string, event, timeout_secs)
    }

    pub fn async_complete(&self) -> Result<()> {
        self.lock()?.async_complete()
    }

    /// True once the outstanding asynchronous connect has finished.
    pub fn poll(&self) -> Result<bool> {
        let mut inner = self.lock()?;
        let inner = &mut *inner;
        inner.async_op.poll(&inner.dbc)
    }

    pub fn async_state(&self) -> Result<AsyncState> {
        Ok(self.lock()?.async_op.state())
    }

    pub fn connected(&self) -> bool {
        self.lock().map(|c| c.connected).unwrap_or(false)
    }

    /// Disconnects every alias. Open transaction scopes are rolled back
    /// first. A no-op when not connected.
    pub fn disconnect(&self) -> Result<()> {
        self.lock()?.disconnect()
    }

    /// Depth of open transaction scopes.
    pub fn transactions(&self) -> usize {
        self.lock().map(|c| c.transactions).unwrap_or(0)
    }

    pub fn dbms_name(&self) -> Result<String> {
        self.lock()?.info(InfoKind::DbmsName)
    }

    pub fn dbms_version(&self) -> Result<String> {
        self.lock()?.info(InfoKind::DbmsVersion)
    }

    pub fn data_source_name(&self) -> Result<String> {
        self.lock()?.info(InfoKind::DataSourceName)
    }

    /// File name of the driver library, as the driver reports it.
    pub fn driver_name(&self) -> Result<String> {
        self.lock()?.info(InfoKind::DriverName)
    }

    pub fn settings(&self) -> Result<Settings> {
        Ok(self.lock()?.settings)
    }

    pub fn begin_transaction(&self) -> Result<Transaction> {
        Transaction::begin(self)
    }

    /// Runs `f` in a transaction scope: commits on `Ok`, rolls back on `Err`.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let mut txn = self.begin_transaction()?;
        match f(&txn) {
            Ok(result) => {
                txn.commit()?;
                Ok(result)
            }
            Err(e) => {
                let _ = txn.rollback();
                Err(e)
            }
        }
    }

    /// Number of live aliases, statements and results included.
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn swap(&mut self, other: &mut Connection) {
        std::mem::swap(&mut self.inner, &mut other.inner);
    }

    pub(crate) fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Executes `sql` directly and returns its first result.
    pub fn execute(&self, sql: &str) -> Result<ResultSet> {
        Statement::new().execute_direct(self, sql)
    }

    /// Executes `sql` directly, discarding any result.
    pub fn just_execute(&self, sql: &str) -> Result<()> {
        Statement::new().just_execute_direct(self, sql)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.connected())
            .field("transactions", &self.transactions())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDriver;

    fn memory() -> (Arc<MemoryDriver>, Arc<dyn Driver>) {
        let memory = Arc::new(MemoryDriver::new());
        let driver: Arc<dyn Driver> = memory.clone();
        (memory, driver)
    }

    #[test]
    fn test_connect_empty_string() {
        let (_m, driver) = memory();
        let conn = Connection::new(driver).unwrap();
        assert!(matches!(
            conn.connect(""),
            Err(OdbcError::EmptyConnectionString)
        ));
        assert!(matches!(
            conn.connect_with_timeout("   ", 5),
            Err(OdbcError::EmptyConnectionString)
        ));
    }

    #[test]
    fn test_only_client_options_is_empty() {
        let (_m, driver) = memory();
        let conn = Connection::new(driver).unwrap();
        assert!(matches!(
            conn.connect("RowsetSize=10;"),
            Err(OdbcError::EmptyConnectionString)
        ));
    }

    #[test]
    fn test_connect_and_disconnect() {
        let (memory, driver) = memory();
        let conn = Connection::open(driver, "DSN=sales").unwrap();
        assert!(conn.connected());
        assert_eq!(conn.data_source_name().unwrap(), "sales");
        assert_eq!(conn.dbms_name().unwrap(), "MemoryDB");
        assert_eq!(conn.driver_name().unwrap(), "memdrv.so");
        conn.disconnect().unwrap();
        assert!(!conn.connected());
        conn.disconnect().unwrap();
        drop(conn);
        assert_eq!(memory.live_handles(), 0);
    }

    #[test]
    fn test_aliases_share_disconnect() {
        let (_m, driver) = memory();
        let a = Connection::open(driver, "DSN=x").unwrap();
        let b = a.clone();
        assert_eq!(a.share_count(), 2);
        a.disconnect().unwrap();
        assert!(!b.connected());
    }

    #[test]
    fn test_swap_exchanges_state() {
        let (_m, driver) = memory();
        let mut a = Connection::open(Arc::clone(&driver), "DSN=x").unwrap();
        let mut b = Connection::new(driver).unwrap();
        a.swap(&mut b);
        assert!(!a.connected());
        assert!(b.connected());
    }

    #[test]
    fn test_info_requires_connection() {
        let (_m, driver) = memory();
        let conn = Connection::new(driver).unwrap();
        assert!(matches!(conn.dbms_name(), Err(OdbcError::Programming(_))));
        assert!(matches!(conn.driver_name(), Err(OdbcError::Programming(_))));
    }

    #[test]
    fn test_driver_name_comes_from_driver_info() {
        let (_m, driver) = memory();
        let conn = Connection::open(Arc::clone(&driver), "DSN=info").unwrap();
        assert_eq!(conn.driver_name().unwrap(), "memdrv.so");
        assert_ne!(conn.driver_name().unwrap(), driver.name());
    }

    #[test]
    fn test_failed_login_reports_sqlstate() {
        let (memory, driver) = memory();
        memory.require_password("s3cret");
        let conn = Connection::new(driver).unwrap();
        let err = conn.connect("DSN=x;PWD=wrong").unwrap_err();
        assert_eq!(err.sqlstate_str(), "28000");
        assert!(!conn.connected());
        conn.connect("DSN=x;PWD=s3cret").unwrap();
        assert!(conn.connected());
    }

    #[test]
    fn test_connect_dsn_with_credentials() {
        let (memory, driver) = memory();
        memory.require_password("pw");
        let conn = Connection::new(driver).unwrap();
        conn.connect_dsn("inventory", "app", "pw", Some(9)).unwrap();
        assert_eq!(memory.last_login_timeout(), Some(9));
        assert_eq!(conn.data_source_name().unwrap(), "inventory");
    }

    #[test]
    fn test_connection_options_feed_settings_and_timeout() {
        let (memory, driver) = memory();
        let conn = Connection::new(driver).unwrap();
        conn.connect("DSN=x;RowsetSize=16;LoginTimeout=4").unwrap();
        let settings = conn.settings().unwrap();
        assert_eq!(settings.rowset_size, 16);
        assert_eq!(memory.last_login_timeout(), Some(4));
        conn.connect_with_timeout("DSN=x", 11).unwrap();
        assert_eq!(memory.last_login_timeout(), Some(11));
    }

    #[test]
    fn test_reconnect_disconnects_first() {
        let (_m, driver) = memory();
        let conn = Connection::open(driver, "DSN=a").unwrap();
        conn.connect("DSN=b").unwrap();
        assert_eq!(conn.data_source_name().unwrap(), "b");
    }

    #[test]
    fn test_async_connect_two_phase() {
        let (memory, driver) = memory();
        memory.set_async_latency(2);
        let conn = Connection::new(driver).unwrap();
        conn.async_connect("DSN=later", EventHandle::new(7), None)
            .unwrap();
        assert_eq!(conn.async_state().unwrap(), AsyncState::Pending);
        assert!(!conn.connected());
        assert!(matches!(
            conn.async_connect("DSN=again", EventHandle::new(8), None),
            Err(OdbcError::Programming(_))
        ));
        conn.async_complete().unwrap();
        assert_eq!(conn.async_state().unwrap(), AsyncState::Idle);
        assert!(conn.connected());
        assert!(matches!(conn.poll(), Err(OdbcError::Programming(_))));
    }

    #[test]
    fn test_drop_with_pending_connect_releases_handles() {
        let (memory, driver) = memory();
        memory.set_async_latency(3);
        {
            let conn = Connection::new(driver).unwrap();
            conn.async_connect("DSN=x", EventHandle::new(1), None)
                .unwrap();
        }
        assert_eq!(memory.live_handles(), 0);
    }

    #[test]
    fn test_with_transaction_commits_on_ok() {
        let (_m, driver) = memory();
        let conn = Connection::open(driver, "DSN=x").unwrap();
        let value = conn.with_transaction(|_| Ok(42)).unwrap();
        assert_eq!(value, 42);
        assert_eq!(conn.transactions(), 0);
    }

    #[test]
    fn test_with_transaction_rolls_back_on_err() {
        let (_m, driver) = memory();
        let conn = Connection::open(driver, "DSN=x").unwrap();
        let result: Result<()> =
            conn.with_transaction(|_| Err(OdbcError::Programming("boom".to_string())));
        assert!(result.is_err());
        assert_eq!(conn.transactions(), 0);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let (_m, driver) = memory();
        let settings = Settings {
            rowset_size: 0,
            ..Settings::default()
        };
        assert!(matches!(
            Connection::with_settings(driver, settings),
            Err(OdbcError::Programming(_))
        ));
    }
}
