use thiserror::Error;

/// Categorized adapter failure.
#[derive(Debug, Error)]
pub enum DownloaderError {
    /// Timeouts, connection resets, 5xx responses, expired RPC sessions.
    /// Retried by the adapter; reported as "offline" past the retry budget.
    #[error("transient failure talking to {endpoint}: {reason}")]
    Transient {
        /// Endpoint or RPC method involved.
        endpoint: String,
        /// Underlying cause.
        reason: String,
    },
    /// The session cookie/token expired and the silent re-login failed.
    #[error("authentication failed or expired for {endpoint}")]
    AuthExpired {
        /// Endpoint or RPC method involved.
        endpoint: String,
    },
    /// 4xx-class remote rejection; never retried.
    #[error("client rejected {endpoint} with status {status}")]
    Permanent {
        /// Endpoint or RPC method involved.
        endpoint: String,
        /// HTTP status code returned.
        status: u16,
    },
    /// The response could not be decoded into the expected shape.
    #[error("protocol error on {endpoint}: {reason}")]
    Protocol {
        /// Endpoint or RPC method involved.
        endpoint: String,
        /// Underlying cause.
        reason: String,
    },
    /// The session was never opened or has been closed.
    #[error("no open session for this client")]
    NotConnected,
    /// A torrent added by payload never surfaced in the client's list.
    #[error("added torrent did not appear in the client (expected hash {hash:?})")]
    AddNotConfirmed {
        /// Hash computed locally from the payload, when available.
        hash: Option<String>,
    },
}

impl DownloaderError {
    /// Whether the failure category is worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Build a transient error from a reqwest failure.
    pub fn from_request(endpoint: &str, err: &reqwest::Error) -> Self {
        Self::Transient {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        }
    }

    /// Classify a non-success HTTP status.
    #[must_use]
    pub fn from_status(endpoint: &str, status: u16) -> Self {
        if status >= 500 || status == 409 {
            Self::Transient {
                endpoint: endpoint.to_string(),
                reason: format!("status {status}"),
            }
        } else if status == 401 || status == 403 {
            Self::AuthExpired {
                endpoint: endpoint.to_string(),
            }
        } else {
            Self::Permanent {
                endpoint: endpoint.to_string(),
                status,
            }
        }
    }
}
