use thiserror::Error;

/// Subkinds for 401/403 responses, distinguished by the server-supplied message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// Request timestamp fell outside the exchange's clock-skew window.
    ClockSkew,
    InvalidCredentials,
    IpNotAllowed,
    Other,
}

impl std::fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ClockSkew => "signature expired",
            Self::InvalidCredentials => "invalid API key",
            Self::IpNotAllowed => "IP not whitelisted",
            Self::Other => "authentication failed",
        };
        f.write_str(s)
    }
}

/// Order rejection reasons the exchange reports inside 400-class bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderRejectionKind {
    InsufficientMargin,
    SizeExceedsAvailable,
    RiskLimitsBreached,
    InvalidContract,
    ImmediateLiquidation,
    OutOfBankruptcy,
    PostOnlyViolation,
}

impl std::fmt::Display for OrderRejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InsufficientMargin => "insufficient margin",
            Self::SizeExceedsAvailable => "order size exceeds available",
            Self::RiskLimitsBreached => "risk limits breached",
            Self::InvalidContract => "invalid contract",
            Self::ImmediateLiquidation => "immediate liquidation",
            Self::OutOfBankruptcy => "out of bankruptcy",
            Self::PostOnlyViolation => "post-only violation",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum DeltaError {
    #[error("authentication error ({kind}): {message}")]
    Auth {
        kind: AuthErrorKind,
        message: String,
    },

    #[error("rate limited: {message} (retry after {retry_after:?}s)")]
    RateLimited {
        retry_after: Option<u64>,
        message: String,
    },

    #[error("order rejected ({kind}): {message}")]
    OrderRejected {
        kind: OrderRejectionKind,
        message: String,
    },

    #[error("request error (status {status}): {message}")]
    Request { status: u16, message: String },

    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response (status {status}): {message}")]
    Unknown { status: u16, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("configuration error: {0}")]
    Config(#[from] crate::core::config::ConfigError),

    // Streaming side
    #[error("websocket connect failed: {0}")]
    ConnectFailure(String),

    #[error("websocket authentication failed: {0}")]
    AuthFailure(String),

    #[error("websocket transport error: {0}")]
    Transport(String),

    #[error("websocket not connected")]
    NotConnected,

    #[error("gave up reconnecting after {0} attempts")]
    MaxReconnectAttemptsExceeded(u32),
}

const ORDER_REJECTION_SUBSTRINGS: &[(&str, OrderRejectionKind)] = &[
    ("insufficient_margin", OrderRejectionKind::InsufficientMargin),
    (
        "order_size_exceed_available",
        OrderRejectionKind::SizeExceedsAvailable,
    ),
    ("risk_limits_breached", OrderRejectionKind::RiskLimitsBreached),
    ("invalid_contract", OrderRejectionKind::InvalidContract),
    (
        "immediate_liquidation",
        OrderRejectionKind::ImmediateLiquidation,
    ),
    ("out_of_bankruptcy", OrderRejectionKind::OutOfBankruptcy),
    (
        "immediate_execution_post_only",
        OrderRejectionKind::PostOnlyViolation,
    ),
    (
        "self_matching_disrupted_post_only",
        OrderRejectionKind::PostOnlyViolation,
    ),
];

/// Map an HTTP failure onto the error taxonomy.
///
/// `message` is the server-supplied error message (response body `message`
/// field, or the raw body when no structured message is present);
/// `retry_after` is the parsed `retry-after` header for 429 responses.
pub fn classify_http(status: u16, message: &str, retry_after: Option<u64>) -> DeltaError {
    match status {
        401 | 403 => {
            let kind = if message.contains("signature expired") {
                AuthErrorKind::ClockSkew
            } else if message.contains("Invalid API Key") {
                AuthErrorKind::InvalidCredentials
            } else if message.contains("IP not whitelisted") {
                AuthErrorKind::IpNotAllowed
            } else {
                AuthErrorKind::Other
            };
            DeltaError::Auth {
                kind,
                message: message.to_string(),
            }
        }
        429 => DeltaError::RateLimited {
            retry_after,
            message: message.to_string(),
        },
        400 | 404 | 405 | 406 | 409 | 412 | 422 => {
            for (needle, kind) in ORDER_REJECTION_SUBSTRINGS {
                if message.contains(needle) {
                    return DeltaError::OrderRejected {
                        kind: *kind,
                        message: message.to_string(),
                    };
                }
            }
            DeltaError::Request {
                status,
                message: message.to_string(),
            }
        }
        500 => DeltaError::Server {
            status,
            message: message.to_string(),
        },
        _ => DeltaError::Unknown {
            status,
            message: message.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_subkinds() {
        for status in [401, 403] {
            assert!(matches!(
                classify_http(status, "signature expired for request", None),
                DeltaError::Auth {
                    kind: AuthErrorKind::ClockSkew,
                    ..
                }
            ));
            assert!(matches!(
                classify_http(status, "Invalid API Key", None),
                DeltaError::Auth {
                    kind: AuthErrorKind::InvalidCredentials,
                    ..
                }
            ));
            assert!(matches!(
                classify_http(status, "IP not whitelisted", None),
                DeltaError::Auth {
                    kind: AuthErrorKind::IpNotAllowed,
                    ..
                }
            ));
            assert!(matches!(
                classify_http(status, "something else entirely", None),
                DeltaError::Auth {
                    kind: AuthErrorKind::Other,
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        match classify_http(429, "too many requests", Some(7)) {
            DeltaError::RateLimited { retry_after, .. } => assert_eq!(retry_after, Some(7)),
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_order_rejection_subkinds() {
        let cases = [
            ("insufficient_margin", OrderRejectionKind::InsufficientMargin),
            (
                "order_size_exceed_available",
                OrderRejectionKind::SizeExceedsAvailable,
            ),
            ("risk_limits_breached", OrderRejectionKind::RiskLimitsBreached),
            ("invalid_contract", OrderRejectionKind::InvalidContract),
            (
                "immediate_liquidation",
                OrderRejectionKind::ImmediateLiquidation,
            ),
            ("out_of_bankruptcy", OrderRejectionKind::OutOfBankruptcy),
            (
                "immediate_execution_post_only",
                OrderRejectionKind::PostOnlyViolation,
            ),
            (
                "self_matching_disrupted_post_only",
                OrderRejectionKind::PostOnlyViolation,
            ),
        ];

        for (needle, expected) in cases {
            let message = format!("error: {}", needle);
            match classify_http(400, &message, None) {
                DeltaError::OrderRejected { kind, .. } => assert_eq!(kind, expected),
                other => panic!("expected OrderRejected for {}, got {:?}", needle, other),
            }
        }
    }

    #[test]
    fn test_request_error_fallback() {
        for status in [400, 404, 405, 406, 409, 412, 422] {
            assert!(matches!(
                classify_http(status, "unrecognized failure", None),
                DeltaError::Request { .. }
            ));
        }
    }

    #[test]
    fn test_server_and_unknown() {
        assert!(matches!(
            classify_http(500, "internal", None),
            DeltaError::Server { status: 500, .. }
        ));
        assert!(matches!(
            classify_http(502, "bad gateway", None),
            DeltaError::Unknown { status: 502, .. }
        ));
        assert!(matches!(
            classify_http(418, "teapot", None),
            DeltaError::Unknown { .. }
        ));
    }
}
