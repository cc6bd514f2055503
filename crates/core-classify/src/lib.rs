//! Provider error taxonomy and classification for Tether
//!
//! # Overview
//!
//! Cloud-storage providers surface failures as loosely structured strings and
//! HTTP status codes. This crate maps a raw provider error into a closed
//! [`ErrorKind`] taxonomy that the rest of the engine can act on: the health
//! state machine keys its transition table on it, and the recovery engine
//! keys its retry strategy on it.
//!
//! # Classification model
//!
//! Classification is an ordered rule list, checked most-specific-first with
//! first-match-wins semantics. The ordering is load-bearing: "refresh token
//! expired" must win over the generic "token expired" even though both
//! patterns are present in the message. Substring rules are consulted before
//! HTTP status fallbacks, because the message text is always more specific
//! than the status class. Anything unmatched is [`ErrorKind::UnknownError`].
//!
//! # Example
//!
//! ```
//! use tether_core_classify::{classify, ErrorKind};
//!
//! let kind = classify("invalid_grant: refresh token has expired", Some(400));
//! assert_eq!(kind, ErrorKind::InvalidRefreshToken);
//! assert!(kind.metadata().requires_reconnection);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Closed set of provider-facing failure categories.
///
/// Operational signals (rate limiting, refresh races) are deliberately NOT
/// part of this enum; they are control flow, not provider failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The access token is expired; a refresh may resolve it
    TokenExpired,
    /// The refresh token itself is expired or revoked
    InvalidRefreshToken,
    /// The granted scopes no longer cover the operation
    InsufficientPermissions,
    /// Provider API request quota exhausted
    ApiQuotaExceeded,
    /// The user's storage allocation is full
    StorageQuotaExceeded,
    /// Connection-level network failure
    NetworkError,
    /// Provider backend is down or timing out
    ServiceUnavailable,
    /// Client id/secret or token rejected outright
    InvalidCredentials,
    /// Remote file or folder does not exist
    FileNotFound,
    /// Access to a specific folder was denied
    FolderAccessDenied,
    /// Provider rejected the file's type
    InvalidFileType,
    /// File exceeds the provider's size limit
    FileTooLarge,
    /// Provider rejected the file's content as malformed
    InvalidFileContent,
    /// Nothing matched
    UnknownError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TokenExpired => "token_expired",
            ErrorKind::InvalidRefreshToken => "invalid_refresh_token",
            ErrorKind::InsufficientPermissions => "insufficient_permissions",
            ErrorKind::ApiQuotaExceeded => "api_quota_exceeded",
            ErrorKind::StorageQuotaExceeded => "storage_quota_exceeded",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::InvalidCredentials => "invalid_credentials",
            ErrorKind::FileNotFound => "file_not_found",
            ErrorKind::FolderAccessDenied => "folder_access_denied",
            ErrorKind::InvalidFileType => "invalid_file_type",
            ErrorKind::FileTooLarge => "file_too_large",
            ErrorKind::InvalidFileContent => "invalid_file_content",
            ErrorKind::UnknownError => "unknown_error",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = UnknownErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token_expired" => Ok(ErrorKind::TokenExpired),
            "invalid_refresh_token" => Ok(ErrorKind::InvalidRefreshToken),
            "insufficient_permissions" => Ok(ErrorKind::InsufficientPermissions),
            "api_quota_exceeded" => Ok(ErrorKind::ApiQuotaExceeded),
            "storage_quota_exceeded" => Ok(ErrorKind::StorageQuotaExceeded),
            "network_error" => Ok(ErrorKind::NetworkError),
            "service_unavailable" => Ok(ErrorKind::ServiceUnavailable),
            "invalid_credentials" => Ok(ErrorKind::InvalidCredentials),
            "file_not_found" => Ok(ErrorKind::FileNotFound),
            "folder_access_denied" => Ok(ErrorKind::FolderAccessDenied),
            "invalid_file_type" => Ok(ErrorKind::InvalidFileType),
            "file_too_large" => Ok(ErrorKind::FileTooLarge),
            "invalid_file_content" => Ok(ErrorKind::InvalidFileContent),
            "unknown_error" => Ok(ErrorKind::UnknownError),
            other => Err(UnknownErrorKind(other.to_string())),
        }
    }
}

/// Parse error for [`ErrorKind`]
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown error kind: {0}")]
pub struct UnknownErrorKind(pub String);

/// Static handling metadata attached to every [`ErrorKind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindMetadata {
    /// Whether automatic retry can plausibly resolve this failure
    pub is_retryable: bool,
    /// Whether only a user-supplied fresh credential can resolve it
    pub requires_reconnection: bool,
    /// Baseline delay before the next automatic attempt
    pub default_backoff: Duration,
}

impl ErrorKind {
    /// Handling metadata for this kind.
    ///
    /// The table is total: every kind has exactly one entry.
    pub fn metadata(&self) -> KindMetadata {
        match self {
            ErrorKind::TokenExpired => KindMetadata {
                is_retryable: true,
                requires_reconnection: true,
                default_backoff: Duration::ZERO,
            },
            ErrorKind::InvalidRefreshToken => KindMetadata {
                is_retryable: false,
                requires_reconnection: true,
                default_backoff: Duration::ZERO,
            },
            ErrorKind::InsufficientPermissions => KindMetadata {
                is_retryable: false,
                requires_reconnection: true,
                default_backoff: Duration::ZERO,
            },
            ErrorKind::ApiQuotaExceeded => KindMetadata {
                is_retryable: true,
                requires_reconnection: false,
                default_backoff: Duration::from_secs(3600),
            },
            ErrorKind::StorageQuotaExceeded => KindMetadata {
                is_retryable: false,
                requires_reconnection: false,
                default_backoff: Duration::from_secs(3600),
            },
            ErrorKind::NetworkError => KindMetadata {
                is_retryable: true,
                requires_reconnection: false,
                default_backoff: Duration::from_secs(30),
            },
            ErrorKind::ServiceUnavailable => KindMetadata {
                is_retryable: true,
                requires_reconnection: false,
                default_backoff: Duration::from_secs(60),
            },
            ErrorKind::InvalidCredentials => KindMetadata {
                is_retryable: false,
                requires_reconnection: true,
                default_backoff: Duration::ZERO,
            },
            ErrorKind::FileNotFound => KindMetadata {
                is_retryable: false,
                requires_reconnection: false,
                default_backoff: Duration::ZERO,
            },
            ErrorKind::FolderAccessDenied => KindMetadata {
                is_retryable: false,
                requires_reconnection: false,
                default_backoff: Duration::ZERO,
            },
            ErrorKind::InvalidFileType => KindMetadata {
                is_retryable: false,
                requires_reconnection: false,
                default_backoff: Duration::ZERO,
            },
            ErrorKind::FileTooLarge => KindMetadata {
                is_retryable: false,
                requires_reconnection: false,
                default_backoff: Duration::ZERO,
            },
            ErrorKind::InvalidFileContent => KindMetadata {
                is_retryable: false,
                requires_reconnection: false,
                default_backoff: Duration::ZERO,
            },
            ErrorKind::UnknownError => KindMetadata {
                is_retryable: true,
                requires_reconnection: false,
                default_backoff: Duration::from_secs(15),
            },
        }
    }

    /// Whether automatic retry can plausibly resolve this failure
    pub fn is_retryable(&self) -> bool {
        self.metadata().is_retryable
    }

    /// Whether only a user-supplied fresh credential can resolve it
    pub fn requires_reconnection(&self) -> bool {
        self.metadata().requires_reconnection
    }
}

/// A single classification rule: all needles must appear in the
/// lowercased message for the rule to match.
struct Rule {
    needles: &'static [&'static str],
    kind: ErrorKind,
}

/// Ordered rule list. Most-specific rules first; first match wins.
///
/// This is an explicit ordered slice, not a map: when several patterns could
/// match the same message, position in this list decides.
const RULES: &[Rule] = &[
    // Refresh-token failures must be recognized before generic token failures
    Rule {
        needles: &["invalid_grant"],
        kind: ErrorKind::InvalidRefreshToken,
    },
    Rule {
        needles: &["refresh token", "expired"],
        kind: ErrorKind::InvalidRefreshToken,
    },
    Rule {
        needles: &["refresh token", "revoked"],
        kind: ErrorKind::InvalidRefreshToken,
    },
    Rule {
        needles: &["invalid refresh token"],
        kind: ErrorKind::InvalidRefreshToken,
    },
    Rule {
        needles: &["token", "expired"],
        kind: ErrorKind::TokenExpired,
    },
    Rule {
        needles: &["token", "revoked"],
        kind: ErrorKind::InvalidCredentials,
    },
    // Storage quota before API quota: "storage quota exceeded" contains "quota"
    Rule {
        needles: &["storagequotaexceeded"],
        kind: ErrorKind::StorageQuotaExceeded,
    },
    Rule {
        needles: &["storage", "quota"],
        kind: ErrorKind::StorageQuotaExceeded,
    },
    Rule {
        needles: &["storage", "full"],
        kind: ErrorKind::StorageQuotaExceeded,
    },
    Rule {
        needles: &["userratelimitexceeded"],
        kind: ErrorKind::ApiQuotaExceeded,
    },
    Rule {
        needles: &["ratelimitexceeded"],
        kind: ErrorKind::ApiQuotaExceeded,
    },
    Rule {
        needles: &["rate limit"],
        kind: ErrorKind::ApiQuotaExceeded,
    },
    Rule {
        needles: &["quota"],
        kind: ErrorKind::ApiQuotaExceeded,
    },
    Rule {
        needles: &["too many requests"],
        kind: ErrorKind::ApiQuotaExceeded,
    },
    Rule {
        needles: &["insufficient", "permission"],
        kind: ErrorKind::InsufficientPermissions,
    },
    Rule {
        needles: &["insufficient", "scope"],
        kind: ErrorKind::InsufficientPermissions,
    },
    Rule {
        needles: &["folder", "access"],
        kind: ErrorKind::FolderAccessDenied,
    },
    Rule {
        needles: &["folder", "denied"],
        kind: ErrorKind::FolderAccessDenied,
    },
    Rule {
        needles: &["permission denied"],
        kind: ErrorKind::InsufficientPermissions,
    },
    Rule {
        needles: &["access denied"],
        kind: ErrorKind::InsufficientPermissions,
    },
    Rule {
        needles: &["file", "not found"],
        kind: ErrorKind::FileNotFound,
    },
    Rule {
        needles: &["filenotfound"],
        kind: ErrorKind::FileNotFound,
    },
    Rule {
        needles: &["file too large"],
        kind: ErrorKind::FileTooLarge,
    },
    Rule {
        needles: &["size limit", "exceeded"],
        kind: ErrorKind::FileTooLarge,
    },
    Rule {
        needles: &["unsupported", "type"],
        kind: ErrorKind::InvalidFileType,
    },
    Rule {
        needles: &["invalid file type"],
        kind: ErrorKind::InvalidFileType,
    },
    Rule {
        needles: &["invalid mime"],
        kind: ErrorKind::InvalidFileType,
    },
    Rule {
        needles: &["invalid file content"],
        kind: ErrorKind::InvalidFileContent,
    },
    Rule {
        needles: &["corrupt"],
        kind: ErrorKind::InvalidFileContent,
    },
    Rule {
        needles: &["malformed"],
        kind: ErrorKind::InvalidFileContent,
    },
    Rule {
        needles: &["invalid_client"],
        kind: ErrorKind::InvalidCredentials,
    },
    Rule {
        needles: &["invalid credentials"],
        kind: ErrorKind::InvalidCredentials,
    },
    Rule {
        needles: &["unauthorized"],
        kind: ErrorKind::InvalidCredentials,
    },
    // Timeouts are transient provider-side conditions, not hard failures
    Rule {
        needles: &["timed out"],
        kind: ErrorKind::ServiceUnavailable,
    },
    Rule {
        needles: &["timeout"],
        kind: ErrorKind::ServiceUnavailable,
    },
    Rule {
        needles: &["service unavailable"],
        kind: ErrorKind::ServiceUnavailable,
    },
    Rule {
        needles: &["backend error"],
        kind: ErrorKind::ServiceUnavailable,
    },
    Rule {
        needles: &["internal error"],
        kind: ErrorKind::ServiceUnavailable,
    },
    Rule {
        needles: &["internal server error"],
        kind: ErrorKind::ServiceUnavailable,
    },
    Rule {
        needles: &["connection refused"],
        kind: ErrorKind::NetworkError,
    },
    Rule {
        needles: &["connection reset"],
        kind: ErrorKind::NetworkError,
    },
    Rule {
        needles: &["dns"],
        kind: ErrorKind::NetworkError,
    },
    Rule {
        needles: &["unreachable"],
        kind: ErrorKind::NetworkError,
    },
    Rule {
        needles: &["network"],
        kind: ErrorKind::NetworkError,
    },
    Rule {
        needles: &["could not resolve host"],
        kind: ErrorKind::NetworkError,
    },
];

/// Classify a raw provider error into an [`ErrorKind`].
///
/// Substring rules are consulted first (ordered, first match wins); the HTTP
/// status is only a fallback for messages carrying no recognizable text.
pub fn classify(message: &str, http_status: Option<u16>) -> ErrorKind {
    let haystack = message.to_lowercase();

    for rule in RULES {
        if rule.needles.iter().all(|n| haystack.contains(n)) {
            return rule.kind;
        }
    }

    if let Some(status) = http_status {
        return classify_status(status);
    }

    ErrorKind::UnknownError
}

/// Fallback classification from an HTTP status code alone
fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 => ErrorKind::InvalidCredentials,
        403 => ErrorKind::InsufficientPermissions,
        404 => ErrorKind::FileNotFound,
        413 => ErrorKind::FileTooLarge,
        429 => ErrorKind::ApiQuotaExceeded,
        500..=504 => ErrorKind::ServiceUnavailable,
        _ => ErrorKind::UnknownError,
    }
}
