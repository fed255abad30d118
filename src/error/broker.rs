use thiserror::Error;

use super::DeliveryError;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Ошибки публичных операций брокера.
///
/// Все варианты возвращаются синхронно вызывающей стороне; фоновые
/// сбои доставки деградируют в dead-letter и событие, а не в панику.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("topic already exists: {0}")]
    TopicExists(String),

    #[error("queue already exists: {0}")]
    QueueExists(String),

    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("queue {0} is exclusive and already has a consumer")]
    ExclusiveConsumer(String),

    #[error("message carries no replyTo subject")]
    MissingReplyTo,

    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("message ttl expired before send")]
    MessageExpired,

    #[error("invalid subject pattern: {0}")]
    InvalidPattern(String),

    #[error("request timed out")]
    Timeout,

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("broker is shut down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        assert_eq!(
            BrokerError::TopicNotFound("news".into()).to_string(),
            "topic not found: news"
        );
        assert_eq!(
            BrokerError::PayloadTooLarge {
                size: 2048,
                limit: 1024
            }
            .to_string(),
            "payload of 2048 bytes exceeds limit of 1024"
        );
        assert_eq!(BrokerError::Timeout.to_string(), "request timed out");
    }

    #[test]
    fn test_delivery_conversion() {
        let err: BrokerError = DeliveryError::AgentNotFound("a-1".into()).into();
        assert!(matches!(err, BrokerError::Delivery(_)));
        assert_eq!(err.to_string(), "delivery failed: no agent registered for id a-1");
    }
}
