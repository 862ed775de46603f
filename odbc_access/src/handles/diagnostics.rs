use crate::driver::{DiagRecord, Driver, HandleKind, RawHandle, SqlReturn};
use crate::error::{OdbcError, Result};

// Drivers keep a bounded list; stop early if one keeps answering.
const MAX_RECORDS: i16 = 64;

/// Every diagnostic record currently attached to `handle`.
pub fn records(driver: &dyn Driver, handle: RawHandle, kind: HandleKind) -> Vec<DiagRecord> {
    let mut out = Vec::new();
    let mut rec = 1;
    while rec <= MAX_RECORDS {
        match driver.diag_record(kind, handle, rec) {
            Some(record) => out.push(record),
            None => break,
        }
        rec += 1;
    }
    out
}

/// Renders all diagnostic records as one line prefixed by `context`.
pub fn describe(
    driver: &dyn Driver,
    handle: RawHandle,
    kind: HandleKind,
    context: &str,
) -> String {
    render(context, &records(driver, handle, kind))
}

fn render(context: &str, records: &[DiagRecord]) -> String {
    if records.is_empty() {
        return format!("{}: unknown error", context);
    }
    let details: Vec<String> = records
        .iter()
        .map(|r| format!("[{}] ({}) {}", r.state_str(), r.native_error, r.message))
        .collect();
    format!("{}: {}", context, details.join("; "))
}

/// Builds a [`OdbcError::Database`] from the diagnostics of `handle`.
pub fn database_error(
    driver: &dyn Driver,
    handle: RawHandle,
    kind: HandleKind,
    context: &str,
) -> OdbcError {
    let records = records(driver, handle, kind);
    let (sqlstate, native_code) = records
        .first()
        .map(|r| (r.state, r.native_error))
        .unwrap_or(([0u8; 5], 0));
    OdbcError::Database {
        sqlstate,
        native_code,
        message: render(context, &records),
    }
}

/// Maps a native return status onto a `Result`.
///
/// Error statuses become [`OdbcError::Database`]; informational records of
/// `SuccessWithInfo` are logged. Every other status is handed back so the
/// caller can branch on `NoData`, `NeedData` or `StillExecuting`.
pub fn check(
    driver: &dyn Driver,
    handle: RawHandle,
    kind: HandleKind,
    rc: SqlReturn,
    context: &str,
) -> Result<SqlReturn> {
    match rc {
        SqlReturn::Error => Err(database_error(driver, handle, kind, context)),
        SqlReturn::InvalidHandle => Err(OdbcError::database(format!(
            "{}: invalid {} handle",
            context,
            kind.as_str()
        ))),
        SqlReturn::SuccessWithInfo => {
            if log::log_enabled!(log::Level::Debug) {
                for r in records(driver, handle, kind) {
                    log::debug!(
                        "{}: [{}] ({}) {}",
                        context,
                        r.state_str(),
                        r.native_error,
                        r.message
                    );
                }
            }
            Ok(rc)
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_without_records() {
        assert_eq!(render("connect", &[]), "connect: unknown error");
    }

    #[test]
    fn test_render_joins_records() {
        let recs = vec![
            DiagRecord::new("08001", 17, "server not found"),
            DiagRecord::new("01000", 0, "general warning"),
        ];
        assert_eq!(
            render("connect", &recs),
            "connect: [08001] (17) server not found; [01000] (0) general warning"
        );
    }
}
