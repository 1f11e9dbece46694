//! Error taxonomy for the object store.
//!
//! Errors cross the process-shared boundary (and the recording container)
//! as small negative codes, so every variant has a stable numeric mapping.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// Object/process absent, or deleted at the queried time.
    #[error("object not found")]
    NotFound,

    /// Malformed arguments: bad name, size, regex or parent.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Caller lacks read or write permission on the object.
    #[error("permission denied")]
    NoPerm,

    /// Heap arena exhausted. Recoverable: retry after a housekeeper purge.
    #[error("out of heap memory")]
    NoMemory,

    /// Object table exhausted. Recoverable like `NoMemory`.
    #[error("out of object slots")]
    OutOfObjects,

    /// An active object with the same (name, type) holds the unique flag.
    #[error("object name/type not unique")]
    NotUnique,

    /// Rate limit violated, or the only available data is stale.
    /// Caller-retryable.
    #[error("commit too fast or data too stale")]
    TooFast,

    /// A concurrent overwrite invalidated an in-progress read.
    /// Retry; this is detection, not corruption.
    #[error("history wrapped during read")]
    HistWrap,

    /// An absolute deadline elapsed while blocked.
    #[error("deadline elapsed")]
    Timeout,

    /// The handle is not connected to a segment.
    #[error("not connected")]
    NotConnected,

    /// Segment signature/layout mismatch. Shared state cannot be locally
    /// repaired; callers should treat this as fatal.
    #[error("corrupt segment: {0}")]
    Corrupt(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Stable negative code used at the recording/wire boundary.
    pub fn code(&self) -> i32 {
        match self {
            DbError::NotFound => -1,
            DbError::Invalid(_) => -2,
            DbError::NoPerm => -3,
            DbError::NoMemory => -4,
            DbError::OutOfObjects => -5,
            DbError::NotUnique => -6,
            DbError::TooFast => -7,
            DbError::HistWrap => -8,
            DbError::Timeout => -9,
            DbError::NotConnected => -10,
            DbError::Corrupt(_) => -11,
            DbError::Internal(_) => -12,
        }
    }

    /// Reverse mapping for codes read back from a wire or container.
    pub fn from_code(code: i32) -> Option<DbError> {
        Some(match code {
            -1 => DbError::NotFound,
            -2 => DbError::Invalid(String::new()),
            -3 => DbError::NoPerm,
            -4 => DbError::NoMemory,
            -5 => DbError::OutOfObjects,
            -6 => DbError::NotUnique,
            -7 => DbError::TooFast,
            -8 => DbError::HistWrap,
            -9 => DbError::Timeout,
            -10 => DbError::NotConnected,
            -11 => DbError::Corrupt(String::new()),
            -12 => DbError::Internal(String::new()),
            _ => return None,
        })
    }

    /// True for errors a caller is expected to retry (possibly after a
    /// housekeeper pass), as opposed to hard failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::TooFast | DbError::HistWrap | DbError::NoMemory | DbError::OutOfObjects
        )
    }
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        let all = [
            DbError::NotFound,
            DbError::Invalid(String::new()),
            DbError::NoPerm,
            DbError::NoMemory,
            DbError::OutOfObjects,
            DbError::NotUnique,
            DbError::TooFast,
            DbError::HistWrap,
            DbError::Timeout,
            DbError::NotConnected,
            DbError::Corrupt(String::new()),
            DbError::Internal(String::new()),
        ];
        for e in all {
            assert!(e.code() < 0);
            assert_eq!(DbError::from_code(e.code()), Some(e));
        }
        assert_eq!(DbError::from_code(0), None);
    }

    #[test]
    fn retryable_classification() {
        assert!(DbError::HistWrap.is_retryable());
        assert!(DbError::TooFast.is_retryable());
        assert!(!DbError::NoPerm.is_retryable());
        assert!(!DbError::Timeout.is_retryable());
    }
}
