use std::time::Duration;

use snafu::Snafu;

/// Error codes returned by the API which callers need to tell apart.
pub mod codes {
    pub const STORAGE_NOT_FOUND: &str = "STORAGE_NOT_FOUND";
    pub const SERVER_NOT_FOUND: &str = "SERVER_NOT_FOUND";
    pub const SERVER_STATE_ILLEGAL: &str = "SERVER_STATE_ILLEGAL";
    pub const STORAGE_STATE_ILLEGAL: &str = "STORAGE_STATE_ILLEGAL";
    pub const STORAGE_DEVICE_LIMIT_REACHED: &str =
        "STORAGE_DEVICE_LIMIT_REACHED";
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
    #[snafu(display("Failed to build HTTP client: {}", source))]
    HttpClient { source: reqwest::Error },
    #[snafu(display("{} {} failed: {}", method, path, source))]
    Request {
        method: String,
        path: String,
        source: reqwest::Error,
    },
    #[snafu(display(
        "{} {} returned {} {}: {}",
        method,
        path,
        status,
        code,
        message
    ))]
    Problem {
        method: String,
        path: String,
        status: u16,
        code: String,
        message: String,
    },
    #[snafu(display(
        "Failed to decode response of {} {}: {}",
        method,
        path,
        source
    ))]
    Decode {
        method: String,
        path: String,
        source: serde_json::Error,
    },
    #[snafu(display(
        "Timed out after {:?} waiting for {} {} to become {}",
        timeout,
        kind,
        uuid,
        state
    ))]
    WaitTimeout {
        kind: &'static str,
        uuid: String,
        state: String,
        timeout: Duration,
    },
}

impl Error {
    /// API error code, when the server answered with a problem document.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Problem {
                code, ..
            } if !code.is_empty() => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Problem {
                status, ..
            } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
            || matches!(
                self.code(),
                Some(codes::STORAGE_NOT_FOUND) | Some(codes::SERVER_NOT_FOUND)
            )
    }
}
