/// In-process message broker: topics, queues, patterns, guarantees.
pub mod broker;
/// Broker configuration loading.
pub mod config;
/// Agent directory: message receivers and actor mailboxes.
pub mod directory;
/// Common error types: broker operations, delivery failures.
pub mod error;
/// Console logging setup.
pub mod logging;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// Broker facade and its collaborators.
pub use broker::{
    Broker, BrokerEvent, ConsumeHandler, ConsumeOptions, ConsumerHandle, DeliveryGuarantee,
    DuplicateCheck, EventListener, GuaranteeKind, IdentityCodec, Message, MessageKind,
    MessageMetadata, MetricsSnapshot, PatternHandler, PayloadCodec, QueueConfig, QueueStats,
    RetentionPolicy, RetryPolicy, TopicHandler, TopicStats, TopicSubscription,
};
/// Runtime settings with environment overrides.
pub use config::Settings;
/// Agent-side delivery surface.
pub use directory::{ActorMailbox, Agent, AgentDirectory};
/// Operation errors and result types.
pub use error::{BrokerError, BrokerResult, DeliveryError};
/// Logging API.
pub use logging::{init_logging, LoggingConfig};
