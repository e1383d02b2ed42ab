use rusqlite::ffi::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Lock contention or a deadlock loser. Retry the operation.
    #[error("store is busy")]
    Busy,
    /// The database is not present or not yet recovered. Callers that
    /// bootstrap a follower retry this until the master has materialized
    /// the files.
    #[error("store is not available yet")]
    Unavailable,
    /// Unreadable file, size mismatch, or a missing/mismatched encryption
    /// key. Fatal.
    #[error("store state is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Dump(#[from] reputation::dump::Error),
    #[error(transparent)]
    Sqlite(rusqlite::Error),
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Busy)
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Unavailable)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Error::Busy,
                ErrorCode::CannotOpen => Error::Unavailable,
                ErrorCode::NotADatabase => {
                    Error::Corrupt("file is not a recognized database (wrong key?)".to_string())
                }
                ErrorCode::DatabaseCorrupt => Error::Corrupt(err.to_string()),
                _ => Error::Sqlite(err),
            },
            _ => Error::Sqlite(err),
        }
    }
}
