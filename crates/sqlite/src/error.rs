//! Translation of SQLite errors into the backend taxonomy

use relkv_core::BackendError;
use rusqlite::ffi;
use rusqlite::ErrorCode;

/// Map a rusqlite error onto [`BackendError`].
///
/// Lock contention is Retryable, primary key and unique violations are
/// AlreadyExists and a missing row is NotFound. Everything else is an engine
/// error.
pub fn convert_error(err: rusqlite::Error) -> BackendError {
    match &err {
        rusqlite::Error::QueryReturnedNoRows => BackendError::not_found(err.to_string()),
        rusqlite::Error::SqliteFailure(code, _) => match code.code {
            ErrorCode::ConstraintViolation
                if code.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || code.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                BackendError::already_exists(err.to_string())
            }
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                BackendError::retryable(err.to_string())
            }
            ErrorCode::ReadOnly => BackendError::ReadOnly("write"),
            ErrorCode::OperationInterrupted => BackendError::Canceled,
            _ => BackendError::engine(err.to_string()),
        },
        _ => BackendError::engine(err.to_string()),
    }
}
