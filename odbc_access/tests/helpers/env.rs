//! Helper functions for reading environment variables in tests

use odbc_access::test_helpers::test_dsn;

/// Get the ODBC_TEST_DSN connection string from environment
/// Returns None if not set (tests should be skipped in this case)
pub fn get_test_dsn() -> Option<String> {
    test_dsn()
}
