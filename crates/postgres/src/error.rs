//! Translation of PostgreSQL errors into the backend taxonomy

use postgres::error::SqlState;
use relkv_core::BackendError;

/// Map a SQLSTATE onto [`BackendError`].
///
/// | SQLSTATE | class |
/// |----------|-------|
/// | 23505 unique_violation | AlreadyExists |
/// | 40001 serialization_failure | Retryable |
/// | 40P01 deadlock_detected | Retryable |
/// | 57014 query_canceled | DeadlineExceeded |
/// | 25006 read_only_sql_transaction | ReadOnly |
///
/// Errors without a SQLSTATE, and any other code, are engine errors.
pub fn classify(code: Option<&SqlState>, msg: String) -> BackendError {
    let Some(code) = code else {
        return BackendError::engine(msg);
    };
    if *code == SqlState::UNIQUE_VIOLATION {
        BackendError::already_exists(msg)
    } else if *code == SqlState::T_R_SERIALIZATION_FAILURE
        || *code == SqlState::T_R_DEADLOCK_DETECTED
    {
        BackendError::retryable(msg)
    } else if *code == SqlState::QUERY_CANCELED {
        // Only statement_timeout cancels queries from this side.
        BackendError::DeadlineExceeded
    } else if *code == SqlState::READ_ONLY_SQL_TRANSACTION {
        BackendError::ReadOnly("write")
    } else {
        BackendError::engine(msg)
    }
}

/// Map a postgres client error onto [`BackendError`]. A closed socket is a
/// connection error.
pub fn convert_error(err: postgres::Error) -> BackendError {
    if err.is_closed() {
        return BackendError::connection(err.to_string());
    }
    classify(err.code(), err.to_string())
}
