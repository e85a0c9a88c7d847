use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::core::types::{
    MarginSnapshot, OrderSnapshot, PortfolioMarginSnapshot, PositionSnapshot, ProductSymbol,
    TickerSnapshot,
};
use crate::ws::book::OrderBook;
use crate::ws::session::ConnectionState;

const CHANNEL_CAPACITY: usize = 256;

/// A single price point for a symbol, carried by the mark and spot streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceUpdate {
    pub symbol: ProductSymbol,
    pub price: Decimal,
}

/// Fixed, closed set of typed event channels.
///
/// One broadcast channel per event kind; subscribers receive clones of the
/// published values and detach by dropping the receiver. Publishing never
/// blocks the session: a subscriber that falls behind loses the oldest
/// events instead of applying backpressure.
pub struct EventBus {
    ticker: broadcast::Sender<TickerSnapshot>,
    orderbook: broadcast::Sender<OrderBook>,
    position: broadcast::Sender<PositionSnapshot>,
    order: broadcast::Sender<OrderSnapshot>,
    margin: broadcast::Sender<MarginSnapshot>,
    portfolio_margin: broadcast::Sender<PortfolioMarginSnapshot>,
    mark_price: broadcast::Sender<PriceUpdate>,
    spot_price: broadcast::Sender<PriceUpdate>,
    funding_rate: broadcast::Sender<Value>,
    uncached: broadcast::Sender<Value>,
    error: broadcast::Sender<String>,
    state: broadcast::Sender<ConnectionState>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            ticker: broadcast::channel(CHANNEL_CAPACITY).0,
            orderbook: broadcast::channel(CHANNEL_CAPACITY).0,
            position: broadcast::channel(CHANNEL_CAPACITY).0,
            order: broadcast::channel(CHANNEL_CAPACITY).0,
            margin: broadcast::channel(CHANNEL_CAPACITY).0,
            portfolio_margin: broadcast::channel(CHANNEL_CAPACITY).0,
            mark_price: broadcast::channel(CHANNEL_CAPACITY).0,
            spot_price: broadcast::channel(CHANNEL_CAPACITY).0,
            funding_rate: broadcast::channel(CHANNEL_CAPACITY).0,
            uncached: broadcast::channel(CHANNEL_CAPACITY).0,
            error: broadcast::channel(CHANNEL_CAPACITY).0,
            state: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe_ticker(&self) -> broadcast::Receiver<TickerSnapshot> {
        self.ticker.subscribe()
    }

    pub fn subscribe_orderbook(&self) -> broadcast::Receiver<OrderBook> {
        self.orderbook.subscribe()
    }

    pub fn subscribe_position(&self) -> broadcast::Receiver<PositionSnapshot> {
        self.position.subscribe()
    }

    pub fn subscribe_order(&self) -> broadcast::Receiver<OrderSnapshot> {
        self.order.subscribe()
    }

    pub fn subscribe_margin(&self) -> broadcast::Receiver<MarginSnapshot> {
        self.margin.subscribe()
    }

    pub fn subscribe_portfolio_margin(&self) -> broadcast::Receiver<PortfolioMarginSnapshot> {
        self.portfolio_margin.subscribe()
    }

    pub fn subscribe_mark_price(&self) -> broadcast::Receiver<PriceUpdate> {
        self.mark_price.subscribe()
    }

    pub fn subscribe_spot_price(&self) -> broadcast::Receiver<PriceUpdate> {
        self.spot_price.subscribe()
    }

    pub fn subscribe_funding_rate(&self) -> broadcast::Receiver<Value> {
        self.funding_rate.subscribe()
    }

    /// Raw frames from channel types the session forwards without caching
    /// (user trades, MMP triggers, candlesticks, announcements and so on).
    pub fn subscribe_uncached(&self) -> broadcast::Receiver<Value> {
        self.uncached.subscribe()
    }

    pub fn subscribe_error(&self) -> broadcast::Receiver<String> {
        self.error.subscribe()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    // Send errors only mean nobody is listening; that is fine.

    pub(crate) fn publish_ticker(&self, ticker: TickerSnapshot) {
        let _ = self.ticker.send(ticker);
    }

    pub(crate) fn publish_orderbook(&self, book: OrderBook) {
        let _ = self.orderbook.send(book);
    }

    pub(crate) fn publish_position(&self, position: PositionSnapshot) {
        let _ = self.position.send(position);
    }

    pub(crate) fn publish_order(&self, order: OrderSnapshot) {
        let _ = self.order.send(order);
    }

    pub(crate) fn publish_margin(&self, margin: MarginSnapshot) {
        let _ = self.margin.send(margin);
    }

    pub(crate) fn publish_portfolio_margin(&self, pm: PortfolioMarginSnapshot) {
        let _ = self.portfolio_margin.send(pm);
    }

    pub(crate) fn publish_mark_price(&self, update: PriceUpdate) {
        let _ = self.mark_price.send(update);
    }

    pub(crate) fn publish_spot_price(&self, update: PriceUpdate) {
        let _ = self.spot_price.send(update);
    }

    pub(crate) fn publish_funding_rate(&self, payload: Value) {
        let _ = self.funding_rate.send(payload);
    }

    pub(crate) fn publish_uncached(&self, payload: Value) {
        let _ = self.uncached.send(payload);
    }

    pub(crate) fn publish_error(&self, message: String) {
        let _ = self.error.send(message);
    }

    pub(crate) fn publish_state(&self, state: ConnectionState) {
        let _ = self.state.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_ticker();

        let ticker = TickerSnapshot {
            symbol: ProductSymbol::from("BTCUSD"),
            ..TickerSnapshot::default()
        };
        bus.publish_ticker(ticker);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.symbol.as_str(), "BTCUSD");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish_error("nobody listening".to_string());
    }

    #[tokio::test]
    async fn test_dropping_receiver_detaches() {
        let bus = EventBus::new();
        let rx = bus.subscribe_error();
        drop(rx);
        bus.publish_error("after detach".to_string());
        assert_eq!(bus.error.receiver_count(), 0);
    }
}
