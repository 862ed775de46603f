//! Two-phase asynchronous calls on a single native handle.
//!
//! An operation is started with an event handle armed on the native handle,
//! the driver answers `StillExecuting`, and the caller later polls or
//! completes it. Only one operation may be outstanding per handle.

use crate::driver::{EventHandle, SqlReturn};
use crate::error::{OdbcError, Result};
use crate::handles::HandleGuard;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsyncState {
    #[default]
    Idle,
    Pending,
    /// The driver finished; the outcome waits for `complete`.
    Ready,
}

/// State machine for the asynchronous operation of one handle. `Op` tags
/// which call is in flight.
#[derive(Debug)]
pub struct AsyncOperation<Op> {
    state: AsyncState,
    op: Option<Op>,
    outcome: Option<SqlReturn>,
}

impl<Op> Default for AsyncOperation<Op> {
    fn default() -> Self {
        Self {
            state: AsyncState::Idle,
            op: None,
            outcome: None,
        }
    }
}

impl<Op: Copy + fmt::Debug> AsyncOperation<Op> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AsyncState {
        self.state
    }

    pub fn pending_op(&self) -> Option<Op> {
        self.op
    }

    /// Fails unless the handle is idle.
    pub fn ensure_idle(&self) -> Result<()> {
        match self.state {
            AsyncState::Idle => Ok(()),
            _ => Err(OdbcError::Programming(format!(
                "asynchronous {:?} still outstanding; complete it first",
                self.op
            ))),
        }
    }

    /// Arms `event` on `guard` and issues `call`.
    pub fn start<F>(
        &mut self,
        guard: &HandleGuard,
        event: EventHandle,
        op: Op,
        call: F,
    ) -> Result<()>
    where
        F: FnOnce() -> SqlReturn,
    {
        self.ensure_idle()?;
        let driver = guard.driver();
        if !driver.supports_async() {
            return Err(OdbcError::UnsupportedFeature(format!(
                "driver '{}' does not support asynchronous execution",
                driver.name()
            )));
        }
        let rc = driver.set_async_event(guard.kind(), guard.raw(), Some(event));
        guard.check(rc, "enable asynchronous notification")?;

        let rc = call();
        self.op = Some(op);
        if rc == SqlReturn::StillExecuting {
            self.state = AsyncState::Pending;
            self.outcome = None;
        } else {
            // Finished synchronously; the outcome is still collected by `complete`.
            self.state = AsyncState::Ready;
            self.outcome = Some(rc);
        }
        log::debug!("async {:?} started: {:?}", op, self.state);
        Ok(())
    }

    /// Returns true once the outstanding operation has finished.
    pub fn poll(&mut self, guard: &HandleGuard) -> Result<bool> {
        match self.state {
            AsyncState::Idle => Err(OdbcError::Programming(
                "no asynchronous operation is outstanding".to_string(),
            )),
            AsyncState::Ready => Ok(true),
            AsyncState::Pending => {
                let mut outcome = SqlReturn::Error;
                let rc = guard
                    .driver()
                    .complete_async(guard.kind(), guard.raw(), &mut outcome);
                if rc == SqlReturn::StillExecuting {
                    return Ok(false);
                }
                if let Err(e) = guard.check(rc, "poll asynchronous operation") {
                    self.reset(guard);
                    return Err(e);
                }
                self.outcome = Some(outcome);
                self.state = AsyncState::Ready;
                Ok(true)
            }
        }
    }

    /// Waits for the outstanding operation and hands back which call it was
    /// and the status it finished with. A failed call is translated while
    /// its diagnostics are still attached. The handle is idle afterwards.
    pub fn complete(&mut self, guard: &HandleGuard) -> Result<(Op, SqlReturn)> {
        if self.state == AsyncState::Idle {
            return Err(OdbcError::Programming(
                "no asynchronous operation to complete".to_string(),
            ));
        }
        while !self.poll(guard)? {
            std::thread::yield_now();
        }
        let finished = match self.op.take().zip(self.outcome.take()) {
            Some((op, rc)) => guard
                .check(rc, &format!("complete asynchronous {:?}", op))
                .map(|rc| (op, rc)),
            None => Err(OdbcError::InternalError(
                "asynchronous outcome missing".to_string(),
            )),
        };
        self.reset(guard);
        finished
    }

    fn reset(&mut self, guard: &HandleGuard) {
        self.state = AsyncState::Idle;
        self.op = None;
        self.outcome = None;
        let rc = guard
            .driver()
            .set_async_event(guard.kind(), guard.raw(), None);
        if !rc.is_success() {
            log::debug!("{}", guard.describe("disable asynchronous notification"));
        }
    }
}
