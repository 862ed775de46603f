use crate::config::split_connection_string_parts;
use crate::error::OdbcError;
use log::Level;
use std::collections::BTreeMap;

const SECRET_KEYS: &[&str] = &["pwd", "password"];

/// Connection and statement events routed through the `log` facade.
#[derive(Debug, Clone, Copy)]
pub struct StructuredLogger {
    enabled: bool,
}

impl StructuredLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn log_query(&self, level: Level, query: &str, metadata: &BTreeMap<&str, String>) {
        if !self.enabled || !log::log_enabled!(level) {
            return;
        }

        let mut message = format!("Query: {}", query);
        for (key, value) in metadata {
            message.push_str(&format!(", {}={}", key, value));
        }

        log::log!(level, "{}", message);
    }

    /// Logs a connection event. Password values never reach the log.
    pub fn log_connection(&self, level: Level, connection_string: &str, action: &str) {
        if !self.enabled || !log::log_enabled!(level) {
            return;
        }

        log::log!(
            level,
            "Connection {}: {}",
            action,
            mask_connection_string(connection_string)
        );
    }

    pub fn log_error(&self, error: &str, metadata: &BTreeMap<&str, String>) {
        if !self.enabled {
            return;
        }

        let mut message = format!("Error: {}", error);
        for (key, value) in metadata {
            message.push_str(&format!(", {}={}", key, value));
        }

        log::error!("{}", message);
    }

    /// Logs a failed native call made for `context`.
    pub fn log_failure(&self, context: &str, error: &OdbcError) {
        if !self.enabled || !log::log_enabled!(Level::Error) {
            return;
        }
        self.log_error(&error.message(), &failure_metadata(context, error));
    }
}

fn failure_metadata<'a>(context: &str, error: &OdbcError) -> BTreeMap<&'a str, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert("context", context.to_string());
    metadata.insert("category", format!("{:?}", error.error_category()));
    metadata.insert("retryable", error.is_retryable().to_string());
    let state = error.sqlstate_str();
    if !state.is_empty() {
        metadata.insert("sqlstate", state);
    }
    metadata
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Replaces the values of `PWD=` and `Password=` with `***`.
pub fn mask_connection_string(connection_string: &str) -> String {
    split_connection_string_parts(connection_string)
        .into_iter()
        .map(|part| match part.split_once('=') {
            Some((key, _)) if SECRET_KEYS.contains(&key.trim().to_ascii_lowercase().as_str()) => {
                format!("{}=***", key)
            }
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_logger_default() {
        let logger = StructuredLogger::default();
        assert!(logger.is_enabled());
    }

    #[test]
    fn test_structured_logger_disabled() {
        let logger = StructuredLogger::new(false);
        assert!(!logger.is_enabled());
        logger.log_connection(Level::Info, "DSN=test;PWD=secret", "connect");
        logger.log_error("failed", &BTreeMap::new());
    }

    #[test]
    fn test_mask_hides_passwords() {
        assert_eq!(
            mask_connection_string("DSN=prod;UID=sa;PWD={p;w};"),
            "DSN=prod;UID=sa;PWD=***;"
        );
        assert_eq!(
            mask_connection_string("Driver=X;password=hunter2"),
            "Driver=X;password=***"
        );
    }

    #[test]
    fn test_mask_keeps_strings_without_secrets() {
        assert_eq!(mask_connection_string("DSN=test"), "DSN=test");
        assert_eq!(mask_connection_string(""), "");
    }

    #[test]
    fn test_failure_metadata_classifies_error() {
        let lost = OdbcError::Database {
            sqlstate: *b"08S01",
            native_code: 0,
            message: "link failure".to_string(),
        };
        let metadata = failure_metadata("execute", &lost);
        assert_eq!(metadata["context"], "execute");
        assert_eq!(metadata["sqlstate"], "08S01");
        assert_eq!(metadata["category"], "ConnectionLost");
        assert_eq!(metadata["retryable"], "true");

        let misuse = OdbcError::Programming("not open".to_string());
        let metadata = failure_metadata("prepare", &misuse);
        assert_eq!(metadata["category"], "Validation");
        assert_eq!(metadata["retryable"], "false");
        assert!(!metadata.contains_key("sqlstate"));
        StructuredLogger::new(false).log_failure("prepare", &misuse);
    }

    #[test]
    fn test_log_query_different_levels() {
        let logger = StructuredLogger::new(true);
        let mut metadata = BTreeMap::new();
        metadata.insert("rows", "42".to_string());
        logger.log_query(Level::Debug, "SELECT 1", &metadata);
        logger.log_query(Level::Trace, "SELECT 1", &metadata);
    }
}
