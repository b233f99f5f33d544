//! Broker Gateway (C1, C2): session management and subscription tracking.

pub mod protocol;
pub mod session;
pub mod subscriptions;

pub use session::{BrokerGatewayError, BrokerRequest, BrokerSession, RequestHandlers};
pub use subscriptions::{SubscriptionKey, SubscriptionKind, SubscriptionRegistry};
