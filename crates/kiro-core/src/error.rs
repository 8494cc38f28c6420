use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many requests")]
    TooManyRequests,

    #[error("No accounts available")]
    NoAccountsAvailable,

    #[error("No such account: {0}")]
    NoSuchAccount(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// Failures caused by the client side of the request — parse errors,
    /// cancelled connections, oversized bodies. Never recorded against the
    /// selected account.
    #[error("{0}")]
    NonCircuitBreaking(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Short error code string included in client-facing error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::InvalidModel(_) => "INVALID_MODEL",
            GatewayError::Unauthenticated(_) => "UNAUTHENTICATED",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::Conflict(_) => "CONFLICT",
            GatewayError::TooManyRequests => "TOO_MANY_REQUESTS",
            GatewayError::NoAccountsAvailable => "NO_ACCOUNTS_AVAILABLE",
            GatewayError::NoSuchAccount(_) => "NO_SUCH_ACCOUNT",
            GatewayError::RefreshFailed(_) => "REFRESH_FAILED",
            GatewayError::Upstream { .. } => "UPSTREAM_FAILURE",
            GatewayError::NonCircuitBreaking(_) => "REQUEST_FAILED",
            GatewayError::Serialization(_) => "SERIALIZATION_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
        }
    }

    /// HTTP status carried back to the client when the error surfaces
    /// before the response body has started.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::InvalidModel(_) => 400,
            GatewayError::Unauthenticated(_) | GatewayError::RefreshFailed(_) => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::NotFound(_) | GatewayError::NoSuchAccount(_) => 404,
            GatewayError::Conflict(_) => 409,
            GatewayError::TooManyRequests => 429,
            GatewayError::NoAccountsAvailable => 503,
            GatewayError::Upstream { .. } => 502,
            GatewayError::Serialization(_) => 400,
            GatewayError::Config(_)
            | GatewayError::NonCircuitBreaking(_)
            | GatewayError::Io(_) => 500,
        }
    }

    /// Whether this failure should be recorded against the selected account
    /// and fed to its circuit breaker. Client-side input problems and local
    /// errors must not trip an account's breaker.
    pub fn counts_against_account(&self) -> bool {
        matches!(
            self,
            GatewayError::Upstream { .. } | GatewayError::RefreshFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::InvalidModel("x".into()).http_status(), 400);
        assert_eq!(GatewayError::TooManyRequests.http_status(), 429);
        assert_eq!(GatewayError::NoAccountsAvailable.http_status(), 503);
        assert_eq!(GatewayError::Conflict("hash".into()).http_status(), 409);
        assert_eq!(
            GatewayError::Upstream {
                status: 500,
                message: "boom".into()
            }
            .http_status(),
            502
        );
    }

    #[test]
    fn circuit_breaking_classification() {
        assert!(GatewayError::Upstream {
            status: 500,
            message: "".into()
        }
        .counts_against_account());
        assert!(GatewayError::RefreshFailed("timeout".into()).counts_against_account());

        assert!(!GatewayError::InvalidRequest("bad json".into()).counts_against_account());
        assert!(!GatewayError::NonCircuitBreaking("client hung up".into())
            .counts_against_account());
        assert!(!GatewayError::TooManyRequests.counts_against_account());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(GatewayError::NoAccountsAvailable.code(), "NO_ACCOUNTS_AVAILABLE");
        assert_eq!(
            GatewayError::Upstream {
                status: 503,
                message: "".into()
            }
            .code(),
            "UPSTREAM_FAILURE"
        );
    }
}
