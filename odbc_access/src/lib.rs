//! Client-side access layer over a handle-based, call-level database
//! interface.
//!
//! [`Connection`], [`Statement`], [`ResultSet`] and [`Transaction`] are cheap
//! to clone; clones alias the same native handle, which is released when
//! the last alias goes away. Every native status is checked and failures
//! surface as [`OdbcError`] with the driver's SQLSTATE and message.
//!
//! The native layer is reached through the [`Driver`] trait. [`OdbcDriver`]
//! (feature `odbc`) talks to the platform driver manager;
//! [`MemoryDriver`] (feature `test-helpers`) is an in-process database for
//! tests.

pub mod async_bridge;
pub mod config;
pub mod driver;
pub mod engine;
mod error;
mod handles;
pub mod observability;
pub mod protocol;
#[cfg(feature = "test-helpers")]
pub mod test_helpers;

pub use async_bridge::AsyncState;
pub use config::Settings;
#[cfg(any(test, feature = "test-helpers"))]
pub use driver::memory::MemoryDriver;
#[cfg(feature = "odbc")]
pub use driver::odbc::OdbcDriver;
pub use driver::{Driver, EventHandle};
pub use engine::{
    execute, just_execute, just_transact, prepare, transact, CellValue, Connection, FromCell,
    ResultSet, Statement, Transaction,
};
pub use error::{OdbcError, Result};
pub use protocol::{Date, ParamDirection, SqlType, Timestamp};
