use thiserror::Error;

/// The error type used throughout the crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Http request failed: {0}")]
    FromReqwestError(#[from] reqwest::Error),
    #[error("OpenSSL operation failed: {0}")]
    FromOpenSslError(#[from] openssl::error::ErrorStack),
    #[error("Io error: {0}")]
    FromIoError(#[from] std::io::Error),
    #[error("Json conversion failed: {0}")]
    FromSerdeError(#[from] serde_json::Error),
    #[error("Header contained invalid characters: {0}")]
    FromToStrError(#[from] reqwest::header::ToStrError),
    #[error("The server sent an incorrect response")]
    IncorrectResponse,
    #[error("The server did not provide a replay nonce")]
    BadNonce,
    /// A problem reported by the CA, the message is the CA's detail text.
    #[error("{0}")]
    Protocol(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Script failed: {0}")]
    Script(String),
    #[error("Certificate error: {0}")]
    Certificate(String),
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// The process exit code matching this error. Io errors carry the
    /// native os code when there is one.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::FromIoError(e) => e.raw_os_error().unwrap_or(1),
            _ => 1,
        }
    }
}
