use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errores de la librería.
///
/// Command methods reject with one of these; connection-level failures are
/// only observable through the node's diagnostic events plus the `connected`
/// flag.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid constructor input. Fatal, raised synchronously before any
    /// connection is attempted.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The detected backend generation has no route for the requested
    /// operation. Not retried.
    #[error("endpoint not supported for this version: '{route}'")]
    NotSupported { route: &'static str },

    /// The bound node is disconnected or destroyed. The caller may retry
    /// once the node reconnects.
    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    /// One or more numeric parameters were out of range. Raised before any
    /// I/O; prior state is left untouched.
    #[error("validation failed:\n{}", format_issues(.issues))]
    Validation { issues: Vec<String> },

    /// Unexpected HTTP status or malformed frame. Address, port and
    /// credentials are stripped from the embedded diagnostic text.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket refused or dropped. Drives the reconnect state machine and
    /// only surfaces once retries are exhausted.
    #[error("connection error: {0}")]
    Connection(String),
}

impl Error {
    pub fn validation(issues: Vec<String>) -> Self {
        Error::Validation { issues }
    }

    /// Wraps an HTTP failure with the URL (host, port, credentials in
    /// userinfo) removed from the diagnostic text.
    pub(crate) fn from_http(err: reqwest::Error) -> Self {
        let redacted = err.without_url();
        if redacted.is_connect() || redacted.is_timeout() {
            Error::Connection(redacted.to_string())
        } else {
            Error::Protocol(redacted.to_string())
        }
    }

    pub(crate) fn bad_status(status: reqwest::StatusCode, body: Option<&str>) -> Self {
        match body {
            Some(body) if !body.is_empty() => {
                Error::Protocol(format!("unexpected status {status}: {body}"))
            }
            _ => Error::Protocol(format!("unexpected status {status}")),
        }
    }
}

fn format_issues(issues: &[String]) -> String {
    issues
        .iter()
        .map(|issue| format!("       | - {issue}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn validation_lists_every_issue() {
        let err = Error::validation(vec!["band 0 fuera de rango".into(), "band 3 fuera de rango".into()]);
        let text = err.to_string();
        assert!(text.contains("band 0 fuera de rango"));
        assert!(text.contains("band 3 fuera de rango"));
    }

    #[test]
    fn not_supported_names_the_route() {
        let err = Error::NotSupported { route: "getPlayer" };
        assert_eq!(
            err.to_string(),
            "endpoint not supported for this version: 'getPlayer'"
        );
    }
}
