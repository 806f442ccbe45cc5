// Error handling module
// Defines the error taxonomy for the session, dispatch and navigation layers

use thiserror::Error;

/// Failure to complete the return leg of the sign-in redirect
///
/// Recovered by the navigation guard, which sends the user back to the
/// public entry route.
#[derive(Error, Debug)]
pub enum AuthExchangeError {
    /// The identity provider returned an error instead of a code
    #[error("Identity provider error: {error}{}", .description.as_deref().map(|d| format!(" ({})", d)).unwrap_or_default())]
    Provider {
        error: String,
        description: Option<String>,
    },

    /// A required parameter is missing from the authorization response
    #[error("Authorization response is missing '{0}'")]
    MissingParameter(&'static str),

    /// No pending sign-in matches the returned state
    #[error("No matching sign-in state found")]
    StateMismatch,

    /// The pending sign-in is too old to complete
    #[error("Sign-in state has expired")]
    StateExpired,

    /// The token endpoint refused the authorization code
    #[error("Token endpoint rejected the code: {status} - {message}")]
    TokenRejected { status: u16, message: String },

    /// Transport failure during the exchange
    #[error("Network error during code exchange: {0}")]
    Network(String),

    /// The provider answered with something we could not use
    #[error("Invalid response from identity provider: {0}")]
    InvalidResponse(String),

    /// Persisted session state could not be read or written
    #[error("Session storage error: {0}")]
    Storage(String),
}

/// Errors raised by the authorized request dispatcher
///
/// `Unauthorized` and `Api` display exactly the message the backend put in
/// the response envelope.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Backend rejected the credential (HTTP 401)
    #[error("{message}")]
    Unauthorized { message: String },

    /// Any other non-success response
    #[error("{message}")]
    Api { status: u16, message: String },

    /// Transport failure
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Success response whose body is not a valid envelope
    #[error("Invalid response body: {0}")]
    Decode(String),

    /// Request body could not be serialized
    #[error("Invalid request body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ApiError {
    /// True when the backend reported the credential as invalid or expired
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// HTTP status of the failed response, if there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized { .. } => Some(401),
            ApiError::Api { status, .. } => Some(*status),
            ApiError::Network(e) => e.status().map(|s| s.as_u16()),
            ApiError::Decode(_) | ApiError::Encode(_) => None,
        }
    }
}

/// Silent renewal failure
#[derive(Error, Debug)]
pub enum RenewError {
    /// The provider will never accept this refresh again
    #[error("Renewal rejected: {0}")]
    Rejected(String),

    /// Worth retrying while the current token is still valid
    #[error("Renewal failed: {0}")]
    Transient(#[from] anyhow::Error),
}

/// Invalid route table configuration
#[derive(Error, Debug, PartialEq)]
pub enum RouteTableError {
    #[error("Invalid route pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Route '{0}' is inside a protected subtree but declares requireAuth = false")]
    PublicRouteInProtectedSubtree(String),

    #[error("Route '{0}' must be public")]
    MustBePublic(String),

    #[error("Route '{0}' is not defined")]
    MissingRoute(String),
}
