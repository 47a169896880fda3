//! Payment Error Types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Payment-related errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Bad input, rejected before any I/O
    #[error("Validation error: {0}")]
    Validation(String),

    /// Store unavailable or constraint violated
    #[error("Storage error: {0}")]
    Storage(String),

    /// Outbound charge call failed
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Webhook payload could not be decoded
    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// Webhook signature missing or invalid
    #[error("Webhook signature invalid: {0}")]
    Signature(String),

    /// Lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// Subscription activation failed after the payment was completed
    #[error("Activation error: {0}")]
    Activation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PaymentError {
    /// Whether the operation may be repeated by whoever drives retries
    /// (gateway redelivery or an operator). Gateway errors are excluded: a
    /// repeated charge could move money twice.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PaymentError::Storage(_) | PaymentError::Activation(_))
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::Validation(_) => "VALIDATION_ERROR",
            PaymentError::Storage(_) => "STORAGE_ERROR",
            PaymentError::Gateway(_) => "GATEWAY_ERROR",
            PaymentError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            PaymentError::Signature(_) => "INVALID_SIGNATURE",
            PaymentError::NotFound(_) => "NOT_FOUND",
            PaymentError::Activation(_) => "ACTIVATION_ERROR",
            PaymentError::Config(_) => "PAYMENTS_DISABLED",
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            PaymentError::Validation(msg) => format!("Invalid request: {msg}"),
            PaymentError::Gateway(_) => "Payment processing failed. Please try again later.".into(),
            PaymentError::MalformedPayload(_) => "Malformed notification.".into(),
            PaymentError::Signature(_) => "Invalid signature.".into(),
            PaymentError::NotFound(what) => format!("{what} not found."),
            PaymentError::Config(_) => "Service configuration error.".into(),
            _ => "An error occurred processing your request.".into(),
        }
    }
}

impl From<sqlx::Error> for PaymentError {
    fn from(err: sqlx::Error) -> Self {
        PaymentError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_errors_are_not_retryable() {
        assert!(!PaymentError::Gateway("timeout".into()).is_retryable());
        assert!(PaymentError::Storage("locked".into()).is_retryable());
    }

    #[test]
    fn test_not_found_message() {
        let err = PaymentError::NotFound("Payment 7".into());
        assert_eq!(err.user_message(), "Payment 7 not found.");
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
