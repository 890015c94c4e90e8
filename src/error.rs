/// Error surfaced to a `connect` caller. The `Display` text for
/// [`ConnectFailed`](Error::ConnectFailed) and
/// [`RetriesExhausted`](Error::RetriesExhausted) is the literal string a
/// caller should match on, matching the two fixed failure messages this
/// kind of pool has always surfaced.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to connect to host")]
    ConnectFailed,
    #[error("connection failed")]
    RetriesExhausted,
    #[error("{0}")]
    Resolve(String),
    #[error("pool is disabled")]
    Disabled,
    #[error("connect request was canceled")]
    Canceled,
}

impl Error {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

/// Failure from [`Pool::return_connection`](crate::Pool::return_connection).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReturnError {
    #[error("failed to export the connection for reinsertion")]
    ExportFailed,
}
