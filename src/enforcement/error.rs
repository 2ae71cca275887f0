//! Error types for the enforcement system
//!
//! Platform failures are classified once, at the adapter boundary, so the
//! discipline loop and the quota tracker can branch on the class instead of
//! inspecting HTTP payloads.

use serenity::http::HttpError;
use serenity::model::ModelError;
use thiserror::Error;

/// Discord JSON error code: Unknown Member
const UNKNOWN_MEMBER: isize = 10007;
/// Discord JSON error code: Unknown User
const UNKNOWN_USER: isize = 10013;
/// Discord JSON error code: Target user is not connected to voice
const TARGET_NOT_CONNECTED: isize = 40032;
/// Discord JSON error code: Missing Access
const MISSING_ACCESS: isize = 50001;
/// Discord JSON error code: Missing Permissions
const MISSING_PERMISSIONS: isize = 50013;

/// Classified failure of a platform action
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// The bot lacks the permission or role hierarchy for the action
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The target is not connected to voice or has left the guild
    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    /// Transient rate limit, worth retrying after a pause
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Anything else; not retried
    #[error("Action failed: {0}")]
    Unknown(String),
}

impl ActionError {
    /// Classify an unsuccessful HTTP response by status and Discord error code
    #[must_use]
    pub fn from_response(status: u16, code: isize, message: impl Into<String>) -> Self {
        let message = message.into();
        match (status, code) {
            (429, _) => Self::RateLimited(message),
            (_, MISSING_PERMISSIONS | MISSING_ACCESS) | (403, _) => Self::PermissionDenied(message),
            (_, TARGET_NOT_CONNECTED | UNKNOWN_MEMBER | UNKNOWN_USER) => {
                Self::TargetUnreachable(message)
            }
            _ => Self::Unknown(message),
        }
    }

    /// Short name of the failure class, used as a structured log field
    #[must_use]
    pub fn class(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "permission_denied",
            Self::TargetUnreachable(_) => "target_unreachable",
            Self::RateLimited(_) => "rate_limited",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<serenity::Error> for ActionError {
    fn from(error: serenity::Error) -> Self {
        match &error {
            serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) => Self::from_response(
                response.status_code.as_u16(),
                response.error.code,
                response.error.message.clone(),
            ),
            serenity::Error::Model(
                ModelError::InvalidPermissions { .. } | ModelError::Hierarchy,
            ) => Self::PermissionDenied(error.to_string()),
            _ => Self::Unknown(error.to_string()),
        }
    }
}

/// Result type for platform actions
pub type ActionResult<T> = Result<T, ActionError>;
