//! Proxy authentication middleware
//!
//! Gates inbound requests on a single shared Basic credential.

use http::header::PROXY_AUTHORIZATION;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::models::basic_auth;
use crate::proxy::conn::RequestHead;

/// Proxy authentication handler
#[derive(Clone)]
pub struct ProxyAuth {
    /// Expected `Proxy-Authorization` value, `None` when authentication is disabled
    expected: Option<String>,
}

impl ProxyAuth {
    /// Create a new proxy auth handler
    ///
    /// Authentication is only enabled when both the username and password are
    /// non-empty.
    pub fn new(username: &str, password: &str) -> Self {
        if username.is_empty() || password.is_empty() {
            return Self::disabled();
        }

        Self {
            expected: Some(basic_auth(username, password)),
        }
    }

    /// Create a disabled auth handler
    pub fn disabled() -> Self {
        Self { expected: None }
    }

    /// Check if authentication is enabled
    pub fn is_enabled(&self) -> bool {
        self.expected.is_some()
    }

    /// Check a presented `Proxy-Authorization` value
    ///
    /// Only an exact match of the expected header passes.
    pub fn check(&self, presented: Option<&str>) -> Result<()> {
        let Some(expected) = &self.expected else {
            return Ok(());
        };

        match presented {
            Some(value) if value == expected => {
                debug!("Proxy authentication successful");
                Ok(())
            }
            Some(_) => {
                warn!("Proxy authentication failed: credentials mismatch");
                Err(GatewayError::Unauthorized)
            }
            None => {
                warn!("Proxy authentication failed: missing Proxy-Authorization");
                Err(GatewayError::Unauthorized)
            }
        }
    }

    /// Validate the Proxy-Authorization header of a request
    pub fn validate(&self, req: &RequestHead) -> Result<()> {
        self.check(req.header(PROXY_AUTHORIZATION.as_str()))
    }
}
