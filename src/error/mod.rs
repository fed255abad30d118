pub mod broker;
pub mod delivery;

pub use broker::{BrokerError, BrokerResult};
pub use delivery::DeliveryError;
