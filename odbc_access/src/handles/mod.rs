pub mod diagnostics;

use crate::driver::{Driver, HandleKind, RawHandle, SqlReturn};
use crate::error::{OdbcError, Result};
use std::fmt;
use std::sync::Arc;

/// Sole owner of one native handle.
///
/// Not `Clone`: the handle is freed exactly once, when the guard drops.
/// Sharing happens one level up, by cloning the `Arc` around the state that
/// holds the guard.
pub struct HandleGuard {
    driver: Arc<dyn Driver>,
    kind: HandleKind,
    handle: RawHandle,
    released: bool,
}

impl HandleGuard {
    /// Allocates a handle of `kind` under `parent`.
    pub fn acquire(
        driver: &Arc<dyn Driver>,
        kind: HandleKind,
        parent: Option<&HandleGuard>,
    ) -> Result<Self> {
        let mut out = None;
        let rc = driver.alloc_handle(kind, parent.map(HandleGuard::raw), &mut out);
        let context = format!("allocate {} handle", kind.as_str());
        match (rc.is_success(), out) {
            (true, Some(handle)) => {
                log::debug!("{}: allocated {:?}", driver.name(), handle);
                Ok(Self {
                    driver: Arc::clone(driver),
                    kind,
                    handle,
                    released: false,
                })
            }
            _ => Err(match parent {
                Some(p) => {
                    diagnostics::database_error(driver.as_ref(), p.raw(), p.kind(), &context)
                }
                None => OdbcError::database(format!("{}: unknown error", context)),
            }),
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn raw(&self) -> RawHandle {
        self.handle
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Checks the status of a call made on this handle.
    pub fn check(&self, rc: SqlReturn, context: &str) -> Result<SqlReturn> {
        diagnostics::check(self.driver.as_ref(), self.handle, self.kind, rc, context)
    }

    pub fn describe(&self, context: &str) -> String {
        diagnostics::describe(self.driver.as_ref(), self.handle, self.kind, context)
    }

    /// Drops the guard without freeing. Used once the driver has already
    /// released the handle, e.g. statements of a disconnected connection.
    pub fn abandon(mut self) {
        self.released = true;
    }
}

impl fmt::Debug for HandleGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleGuard")
            .field("driver", &self.driver.name())
            .field("kind", &self.kind)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if self.released {
            log::debug!("{}: {:?} already released", self.driver.name(), self.handle);
            return;
        }
        let rc = self.driver.free_handle(self.kind, self.handle);
        if rc.is_success() {
            log::debug!("{}: freed {:?}", self.driver.name(), self.handle);
        } else {
            log::warn!(
                "{}",
                self.describe(&format!("free {} handle", self.kind.as_str()))
            );
        }
    }
}
