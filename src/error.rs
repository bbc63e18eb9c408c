//! Error types for the DoH transport.

use hyper::StatusCode;
use thiserror::Error;

use crate::summary::QueryStatus;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised during transport construction and query execution.
#[derive(Debug, Error)]
pub enum Error {
    /// The server URL did not parse.
    #[error("invalid server URL: {0}")]
    Url(#[from] url::ParseError),

    /// The server URL uses a scheme other than `https`.
    #[error("bad scheme: {0}")]
    BadScheme(String),

    /// Neither the URL host nor any fallback produced a usable address.
    #[error("no IP addresses for {0}")]
    NoAddresses(String),

    /// The query is too short to carry an ID.
    #[error("query length is {0}")]
    BadQuery(usize),

    /// Transport or I/O failure before or during the HTTP request.
    #[error("failed to send query: {0}")]
    SendFailed(String),

    /// The server answered with a non-200 HTTP status.
    #[error("HTTP request failed: {0}")]
    Http(StatusCode),

    /// The response was syntactically invalid. Reserved.
    #[error("malformed response")]
    BadResponse,

    /// Request construction or other logic failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The query was canceled before it completed.
    #[error("query canceled")]
    Canceled,
}

impl Error {
    /// The status taxonomy classification matching this error. Summaries
    /// always carry the same classification as the returned error.
    pub fn status(&self) -> QueryStatus {
        match self {
            Error::BadQuery(_) => QueryStatus::BadQuery,
            Error::SendFailed(_) => QueryStatus::SendFailed,
            Error::Http(_) => QueryStatus::HttpError,
            Error::BadResponse => QueryStatus::BadResponse,
            Error::Canceled => QueryStatus::Canceled,
            Error::Url(_) | Error::BadScheme(_) | Error::NoAddresses(_) | Error::Internal(_) => {
                QueryStatus::InternalError
            }
        }
    }
}
