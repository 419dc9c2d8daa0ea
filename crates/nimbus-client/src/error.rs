//! Error types for the nimbus client.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Numeric error codes reported by the backend.
///
/// Every [`NimbusError`] resolves to one of these through [`NimbusError::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    OtherCause,
    InternalServerError,
    ConnectionFailed,
    ObjectNotFound,
    InvalidQuery,
    InvalidClassName,
    MissingObjectId,
    InvalidKeyName,
    InvalidPointer,
    InvalidJson,
    CommandUnavailable,
    NotInitialized,
    IncorrectType,
    InvalidChannelName,
    PushMisconfigured,
    ObjectTooLarge,
    OperationForbidden,
    CacheMiss,
    InvalidNestedKey,
    InvalidFileName,
    InvalidAcl,
    Timeout,
    InvalidEmailAddress,
    MissingContentType,
    MissingContentLength,
    InvalidContentLength,
    FileTooLarge,
    FileSaveError,
    DuplicateValue,
    InvalidRoleName,
    ExceededQuota,
    ScriptFailed,
    ValidationError,
    InvalidImageData,
    UnsavedFileError,
    InvalidPushTimeError,
    FileDeleteError,
    RequestLimitExceeded,
    InvalidEventName,
    UsernameMissing,
    PasswordMissing,
    UsernameTaken,
    EmailTaken,
    EmailMissing,
    EmailNotFound,
    SessionMissing,
    MustCreateUserThroughSignup,
    AccountAlreadyLinked,
    InvalidSessionToken,
    LinkedIdMissing,
    InvalidLinkedSession,
    UnsupportedService,
    AggregateError,
    FileReadError,
    XDomainRequest,
    /// A code this client does not know about.
    Unknown(i32),
}

const CODE_TABLE: &[(ErrorCode, i32)] = &[
    (ErrorCode::OtherCause, -1),
    (ErrorCode::InternalServerError, 1),
    (ErrorCode::ConnectionFailed, 100),
    (ErrorCode::ObjectNotFound, 101),
    (ErrorCode::InvalidQuery, 102),
    (ErrorCode::InvalidClassName, 103),
    (ErrorCode::MissingObjectId, 104),
    (ErrorCode::InvalidKeyName, 105),
    (ErrorCode::InvalidPointer, 106),
    (ErrorCode::InvalidJson, 107),
    (ErrorCode::CommandUnavailable, 108),
    (ErrorCode::NotInitialized, 109),
    (ErrorCode::IncorrectType, 111),
    (ErrorCode::InvalidChannelName, 112),
    (ErrorCode::PushMisconfigured, 115),
    (ErrorCode::ObjectTooLarge, 116),
    (ErrorCode::OperationForbidden, 119),
    (ErrorCode::CacheMiss, 120),
    (ErrorCode::InvalidNestedKey, 121),
    (ErrorCode::InvalidFileName, 122),
    (ErrorCode::InvalidAcl, 123),
    (ErrorCode::Timeout, 124),
    (ErrorCode::InvalidEmailAddress, 125),
    (ErrorCode::MissingContentType, 126),
    (ErrorCode::MissingContentLength, 127),
    (ErrorCode::InvalidContentLength, 128),
    (ErrorCode::FileTooLarge, 129),
    (ErrorCode::FileSaveError, 130),
    (ErrorCode::DuplicateValue, 137),
    (ErrorCode::InvalidRoleName, 139),
    (ErrorCode::ExceededQuota, 140),
    (ErrorCode::ScriptFailed, 141),
    (ErrorCode::ValidationError, 142),
    (ErrorCode::InvalidImageData, 150),
    (ErrorCode::UnsavedFileError, 151),
    (ErrorCode::InvalidPushTimeError, 152),
    (ErrorCode::FileDeleteError, 153),
    (ErrorCode::RequestLimitExceeded, 155),
    (ErrorCode::InvalidEventName, 160),
    (ErrorCode::UsernameMissing, 200),
    (ErrorCode::PasswordMissing, 201),
    (ErrorCode::UsernameTaken, 202),
    (ErrorCode::EmailTaken, 203),
    (ErrorCode::EmailMissing, 204),
    (ErrorCode::EmailNotFound, 205),
    (ErrorCode::SessionMissing, 206),
    (ErrorCode::MustCreateUserThroughSignup, 207),
    (ErrorCode::AccountAlreadyLinked, 208),
    (ErrorCode::InvalidSessionToken, 209),
    (ErrorCode::LinkedIdMissing, 250),
    (ErrorCode::InvalidLinkedSession, 251),
    (ErrorCode::UnsupportedService, 252),
    (ErrorCode::AggregateError, 600),
    (ErrorCode::FileReadError, 601),
    (ErrorCode::XDomainRequest, 602),
];

impl ErrorCode {
    /// The numeric value sent over the wire.
    pub fn as_i32(self) -> i32 {
        if let ErrorCode::Unknown(code) = self {
            return code;
        }
        CODE_TABLE
            .iter()
            .find(|(known, _)| *known == self)
            .map(|(_, code)| *code)
            .unwrap_or(-1)
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        CODE_TABLE
            .iter()
            .find(|(_, value)| *value == code)
            .map(|(known, _)| *known)
            .unwrap_or(ErrorCode::Unknown(code))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i32::deserialize(deserializer).map(ErrorCode::from)
    }
}

/// Errors that can occur when talking to the backend.
///
/// Transport and JSON sources are held in `Arc` so an error can be handed
/// to every continuation of a resolved [`crate::Deferred`].
#[derive(Debug, Clone, Error)]
pub enum NimbusError {
    /// Error reported by the backend.
    #[error("service error {code}: {message}")]
    Service { code: ErrorCode, message: String },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(Arc<reqwest::Error>),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// Response did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// An outbound HTTP request finished with a non-success status.
    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Input rejected before any request was made.
    #[error("{message}")]
    Invalid { code: ErrorCode, message: String },

    /// Several operations of a batch failed.
    #[error("{} of the batched operations failed", errors.len())]
    Aggregate { errors: Vec<NimbusError> },

    /// A resolver was used after the deferred result already settled.
    #[error("deferred result already resolved")]
    AlreadyResolved,

    /// Every resolver was dropped while the deferred result was pending.
    #[error("deferred result abandoned before resolution")]
    Abandoned,
}

impl NimbusError {
    /// Build a local validation error.
    pub fn invalid(code: ErrorCode, message: impl Into<String>) -> Self {
        NimbusError::Invalid {
            code,
            message: message.into(),
        }
    }

    /// The numeric error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            NimbusError::Service { code, .. } | NimbusError::Invalid { code, .. } => *code,
            NimbusError::Http(e) if e.is_timeout() => ErrorCode::Timeout,
            NimbusError::Http(_) => ErrorCode::ConnectionFailed,
            NimbusError::Json(_) => ErrorCode::InvalidJson,
            NimbusError::InvalidResponse(_) => ErrorCode::OtherCause,
            NimbusError::RateLimited { .. } => ErrorCode::RequestLimitExceeded,
            NimbusError::HttpStatus { .. } => ErrorCode::ScriptFailed,
            NimbusError::Aggregate { .. } => ErrorCode::AggregateError,
            NimbusError::AlreadyResolved | NimbusError::Abandoned => ErrorCode::OtherCause,
        }
    }

    /// The human-readable message for this failure.
    pub fn message(&self) -> String {
        match self {
            NimbusError::Service { message, .. } | NimbusError::Invalid { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for NimbusError {
    fn from(err: reqwest::Error) -> Self {
        NimbusError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for NimbusError {
    fn from(err: serde_json::Error) -> Self {
        NimbusError::Json(Arc::new(err))
    }
}

/// Error body returned by the backend.
#[derive(Debug, Deserialize)]
pub(crate) struct ServiceErrorBody {
    pub code: i32,
    pub error: String,
}

impl From<ServiceErrorBody> for NimbusError {
    fn from(body: ServiceErrorBody) -> Self {
        NimbusError::Service {
            code: ErrorCode::from(body.code),
            message: body.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip_through_integer() {
        for (code, value) in CODE_TABLE {
            assert_eq!(code.as_i32(), *value);
            assert_eq!(ErrorCode::from(*value), *code);
        }
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let code = ErrorCode::from(9999);
        assert_eq!(code, ErrorCode::Unknown(9999));
        assert_eq!(code.as_i32(), 9999);
    }

    #[test]
    fn test_code_serializes_as_integer() {
        let json = serde_json::to_string(&ErrorCode::DuplicateValue).unwrap();
        assert_eq!(json, "137");
        let decoded: ErrorCode = serde_json::from_str("209").unwrap();
        assert_eq!(decoded, ErrorCode::InvalidSessionToken);
    }

    #[test]
    fn test_service_error_carries_code_and_message() {
        let err: NimbusError = ServiceErrorBody {
            code: 101,
            error: "object not found for get".to_string(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::ObjectNotFound);
        assert_eq!(err.message(), "object not found for get");
    }

    #[test]
    fn test_json_error_maps_to_invalid_json() {
        let err: NimbusError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.code(), ErrorCode::InvalidJson);
    }

    #[test]
    fn test_rate_limited_display() {
        let err = NimbusError::RateLimited {
            retry_after_secs: Some(30),
        };
        assert_eq!(err.to_string(), "rate limited (retry after 30s)");
        assert_eq!(err.code(), ErrorCode::RequestLimitExceeded);
    }
}
