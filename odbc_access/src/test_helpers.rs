//! Shared setup for unit tests, integration tests and benches.

use crate::driver::memory::MemoryDriver;
use crate::driver::Driver;
use crate::engine::Connection;
use crate::error::Result;
use std::sync::{Arc, Once};

static DOTENV: Once = Once::new();

/// Loads `.env` from the working directory or its parents, once per process.
pub fn load_dotenv() {
    DOTENV.call_once(|| {
        if let Ok(path) = dotenvy::dotenv() {
            log::debug!("Loaded environment from {}", path.display());
        }
    });
}

/// Connection string of a real data source for end-to-end tests, taken from
/// `ODBC_TEST_DSN`.
pub fn test_dsn() -> Option<String> {
    load_dotenv();
    std::env::var("ODBC_TEST_DSN")
        .ok()
        .filter(|s| !s.trim().is_empty())
}

/// A connection to a fresh in-memory database, with the driver kept for
/// inspection.
pub fn memory_connection(data_source: &str) -> Result<(Arc<MemoryDriver>, Connection)> {
    let memory = Arc::new(MemoryDriver::new());
    let driver: Arc<dyn Driver> = memory.clone();
    let conn = Connection::open(driver, &format!("DSN={}", data_source))?;
    Ok((memory, conn))
}
