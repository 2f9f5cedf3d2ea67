//! Error type for venue calls.

use thiserror::Error;

/// Failure of a single remote call to the venue.
#[derive(Error, Debug)]
pub enum VenueError {
    /// Connection, timeout or body read failure
    #[error("Request to {endpoint} failed: {message}")]
    Transport {
        endpoint: &'static str,
        message: String,
        timeout: bool,
    },
    /// Non-2xx response
    #[error("{endpoint} returned HTTP {status} (code: {code:?}): {message}")]
    Api {
        endpoint: &'static str,
        status: u16,
        code: Option<i64>,
        message: String,
    },
    /// 2xx response whose body did not match the expected record
    #[error("Failed to decode {endpoint} response: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },
    /// 2xx response that nonetheless reports the action was not applied
    #[error("{endpoint} rejected the request: {message}")]
    Rejected {
        endpoint: &'static str,
        message: String,
    },
}

impl VenueError {
    /// Endpoint path the failure came from.
    pub fn endpoint(&self) -> &'static str {
        match self {
            VenueError::Transport { endpoint, .. }
            | VenueError::Api { endpoint, .. }
            | VenueError::Decode { endpoint, .. }
            | VenueError::Rejected { endpoint, .. } => endpoint,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            VenueError::Transport { .. } => true,
            VenueError::Api { status, .. } => *status == 429 || *status >= 500,
            VenueError::Decode { .. } | VenueError::Rejected { .. } => false,
        }
    }

    /// Whether the call hit the client timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, VenueError::Transport { timeout: true, .. })
    }

    pub(crate) fn transport(endpoint: &'static str, err: reqwest::Error) -> Self {
        VenueError::Transport {
            endpoint,
            message: err.to_string(),
            timeout: err.is_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let timeout = VenueError::Transport {
            endpoint: "/fapi/v2/account",
            message: "operation timed out".to_string(),
            timeout: true,
        };
        assert!(timeout.is_transient());
        assert!(timeout.is_timeout());

        let throttled = VenueError::Api {
            endpoint: "/sapi/v1/simple-earn/flexible/redeem",
            status: 429,
            code: Some(-1003),
            message: "Too many requests".to_string(),
        };
        assert!(throttled.is_transient());

        let bad_request = VenueError::Api {
            endpoint: "/fapi/v1/positionMargin",
            status: 400,
            code: Some(-4051),
            message: "Isolated balance insufficient.".to_string(),
        };
        assert!(!bad_request.is_transient());
        assert!(!bad_request.is_timeout());
        assert_eq!(bad_request.endpoint(), "/fapi/v1/positionMargin");
    }
}
