use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cert server returned {status} for {url}")]
    HttpStatus {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Timeout: {0}")]
    Timeout(&'static str),

    /// An expected PEM block or token was not found in a cert server response.
    #[error("malformed response: missing {what} in {context}")]
    MalformedResponse {
        what: &'static str,
        context: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true if this error is a connection-level failure that
    /// the next scheduled attempt may not hit again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Error::HttpStatus { status, .. } => status.is_server_error(),
            Error::Ssh(_) | Error::Timeout(_) => true,
            _ => false,
        }
    }

    pub(crate) fn malformed(what: &'static str, context: impl Into<String>) -> Self {
        Error::MalformedResponse {
            what,
            context: context.into(),
        }
    }
}
