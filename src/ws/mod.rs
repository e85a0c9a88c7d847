pub mod book;
pub mod codec;
pub mod events;
pub mod session;
pub mod transport;

pub use book::OrderBook;
pub use events::PriceUpdate;
pub use session::{ConnectionState, DeltaWsSession};
pub use transport::{TungsteniteConnector, WsConnector, WsSink, WsStream};
