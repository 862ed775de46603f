//! Client-side tuning knobs.
//!
//! [`Settings`] can come from defaults, process environment, JSON, or
//! driver-neutral options embedded in a connection string. The embedded
//! options are removed before the string reaches the driver.

use crate::error::{OdbcError, Result};
use serde::{Deserialize, Serialize};

/// Smallest buffer allocated for a result column, in bytes.
pub const DEFAULT_COLUMN_FLOOR: usize = 1024;
pub const DEFAULT_ROWSET_SIZE: usize = 1;

const ENV_ROWSET_SIZE: &str = "ODBC_ROWSET_SIZE";
const ENV_COLUMN_FLOOR: &str = "ODBC_COLUMN_FLOOR";
const ENV_LOGIN_TIMEOUT: &str = "ODBC_LOGIN_TIMEOUT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Rows fetched per round trip for new statements.
    pub rowset_size: usize,
    pub column_floor: usize,
    /// Passed to the driver on connect; `None` keeps the driver default.
    pub login_timeout_secs: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rowset_size: DEFAULT_ROWSET_SIZE,
            column_floor: DEFAULT_COLUMN_FLOOR,
            login_timeout_secs: None,
        }
    }
}

impl Settings {
    /// Defaults overridden by `ODBC_ROWSET_SIZE`, `ODBC_COLUMN_FLOOR` and
    /// `ODBC_LOGIN_TIMEOUT`. Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(v) = env_number(ENV_ROWSET_SIZE) {
            settings.rowset_size = v;
        }
        if let Some(v) = env_number(ENV_COLUMN_FLOOR) {
            settings.column_floor = v;
        }
        if let Some(v) = env_number(ENV_LOGIN_TIMEOUT) {
            settings.login_timeout_secs = u32::try_from(v).ok();
        }
        settings.normalized()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| OdbcError::Programming(format!("Invalid settings JSON: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| OdbcError::InternalError(format!("Failed to serialize settings: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.rowset_size == 0 {
            return Err(OdbcError::Programming(
                "rowset_size must be at least 1".to_string(),
            ));
        }
        if self.column_floor == 0 {
            return Err(OdbcError::Programming(
                "column_floor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn normalized(mut self) -> Self {
        self.rowset_size = self.rowset_size.max(1);
        self.column_floor = self.column_floor.max(1);
        self
    }

    /// Pulls `RowsetSize=`, `ColumnFloor=` and `LoginTimeout=` out of
    /// `connection_string`, applying them on top of `self`. Returns the
    /// updated settings and the string the driver should see.
    pub fn apply_connection_options(&self, connection_string: &str) -> (Self, String) {
        let mut settings = *self;
        let mut kept = Vec::new();

        for part in split_connection_string_parts(connection_string) {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some((key, raw_value)) = trimmed.split_once('=') {
                let value = raw_value.trim().trim_matches(|c| c == '{' || c == '}');
                let parsed = value.parse::<usize>().ok();
                match key.trim().to_ascii_lowercase().as_str() {
                    "rowsetsize" => {
                        if let Some(v) = parsed {
                            settings.rowset_size = v;
                        }
                        continue;
                    }
                    "columnfloor" => {
                        if let Some(v) = parsed {
                            settings.column_floor = v;
                        }
                        continue;
                    }
                    "logintimeout" => {
                        if let Some(v) = parsed {
                            settings.login_timeout_secs = u32::try_from(v).ok();
                        }
                        continue;
                    }
                    _ => {}
                }
            }
            kept.push(trimmed);
        }

        let mut sanitized = kept.join(";");
        if !sanitized.is_empty() && connection_string.trim_end().ends_with(';') {
            sanitized.push(';');
        }
        (settings.normalized(), sanitized)
    }
}

fn env_number(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring {}={:?}: not a non-negative integer", name, raw);
            None
        }
    }
}

/// Splits on `;` outside `{...}` so braced values may contain separators.
pub(crate) fn split_connection_string_parts(connection_string: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut brace_depth = 0u32;

    for (idx, ch) in connection_string.char_indices() {
        match ch {
            '{' => brace_depth = brace_depth.saturating_add(1),
            '}' => brace_depth = brace_depth.saturating_sub(1),
            ';' if brace_depth == 0 => {
                parts.push(&connection_string[start..idx]);
                start = idx + ch.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&connection_string[start..]);
    parts
}
