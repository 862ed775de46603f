pub mod e2e;
pub mod env;

use odbc_access::test_helpers::memory_connection;
use odbc_access::{Connection, MemoryDriver};
use std::sync::{Arc, Once};

#[allow(unused_imports)]
pub use e2e::should_run_e2e_tests;
#[allow(unused_imports)]
pub use env::get_test_dsn;

static LOGGING: Once = Once::new();

/// Routes `log` output to the test harness; `RUST_LOG` picks the level.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Fresh in-memory database with an open connection.
#[allow(dead_code)]
pub fn memory(data_source: &str) -> (Arc<MemoryDriver>, Connection) {
    init_logging();
    memory_connection(data_source).expect("memory connection")
}
