pub mod core;
pub mod rest;
pub mod ws;

pub use self::core::config::{ConfigError, DeltaConfig};
pub use self::core::errors::{AuthErrorKind, DeltaError, OrderRejectionKind};
pub use self::core::types::*;
pub use rest::DeltaRestClient;
pub use ws::{ConnectionState, DeltaWsSession, OrderBook};
