use thiserror::Error;
use uuid::Uuid;

use super::models::MessageStatus;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Message not found: {0}")]
    MessageNotFound(Uuid),
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Message cannot be delivered: {0}")]
    Undeliverable(String),
    #[error("Delivery failed: {0}")]
    SendFailed(String),
    #[error("Delivery attempts exhausted for message {message_id} after {attempts} attempts")]
    AttemptsExhausted { message_id: Uuid, attempts: u32 },
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] anyhow::Error),
}

impl DomainError {
    /// Whether the queue should schedule another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DomainError::SendFailed(_) | DomainError::StorageUnavailable(_)
        )
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(DomainError::SendFailed("smtp timeout".into()).is_retryable());
        assert!(DomainError::StorageUnavailable(anyhow::anyhow!("pool closed")).is_retryable());
        assert!(!DomainError::InvalidTimezone("Mars/Olympus".into()).is_retryable());
        assert!(!DomainError::Undeliverable("no address".into()).is_retryable());
        assert!(
            !DomainError::InvalidTransition {
                from: MessageStatus::Delivered,
                to: MessageStatus::Scheduled,
            }
            .is_retryable()
        );
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = DomainError::InvalidTransition {
            from: MessageStatus::Cancelled,
            to: MessageStatus::Delivered,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition: cancelled -> delivered"
        );
    }
}
