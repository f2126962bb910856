use http::StatusCode;
use thiserror::Error;

/// Unified error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read proxy list {path}: {source}")]
    ProxyListRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // Upstream errors
    #[error("No upstream proxies configured")]
    PoolEmpty,

    #[error("Upstream has no credentials")]
    AuthUnavailable,

    #[error("Failed to connect to upstream {address}: {reason}")]
    DialFailure { address: String, reason: String },

    #[error("Failed to forward request upstream: {0}")]
    ForwardFailure(String),

    // Client errors
    #[error("Proxy authentication failed")]
    Unauthorized,

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Connection does not support hijacking")]
    HijackUnsupported,

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Get the HTTP status code the gateway answers with for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            GatewayError::MalformedRequest(_) => StatusCode::BAD_REQUEST,

            // 403 Forbidden
            GatewayError::Unauthorized => StatusCode::FORBIDDEN,

            // 500 Internal Server Error
            GatewayError::InvalidConfig(_)
            | GatewayError::ProxyListRead { .. }
            | GatewayError::PoolEmpty
            | GatewayError::AuthUnavailable
            | GatewayError::DialFailure { .. }
            | GatewayError::ForwardFailure(_)
            | GatewayError::HijackUnsupported
            | GatewayError::Timeout
            | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for GatewayError {
    fn from(err: url::ParseError) -> Self {
        GatewayError::InvalidConfig(err.to_string())
    }
}
