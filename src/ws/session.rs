use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::config::DeltaConfig;
use crate::core::errors::DeltaError;
use crate::core::types::{
    MarginSnapshot, OrderSnapshot, PortfolioMarginSnapshot, PositionSnapshot, PriceLevel,
    ProductSymbol, TickerSnapshot,
};
use crate::rest::signer::RequestSigner;
use crate::ws::book::OrderBook;
use crate::ws::codec::{
    auth_message, decode_event, ping_message, subscribe_message, unsubscribe_message, L2Action,
    WsEvent,
};
use crate::ws::events::{EventBus, PriceUpdate};
use crate::ws::transport::{TungsteniteConnector, WsConnector, WsSink, WsStream};

pub const CHANNEL_TICKER: &str = "v2/ticker";
pub const CHANNEL_ORDERBOOK: &str = "l2_orderbook";
pub const CHANNEL_L2_UPDATES: &str = "l2_updates";
pub const CHANNEL_MARK_PRICE: &str = "mark_price";
pub const CHANNEL_SPOT_PRICE: &str = "spot_price";
pub const CHANNEL_FUNDING_RATE: &str = "funding_rate";
pub const CHANNEL_POSITIONS: &str = "positions";
pub const CHANNEL_ORDERS: &str = "orders";
pub const CHANNEL_MARGINS: &str = "margins";
pub const CHANNEL_PORTFOLIO_MARGINS: &str = "portfolio_margins";

/// Lifecycle of the streaming session, published on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct Caches {
    tickers: HashMap<ProductSymbol, TickerSnapshot>,
    orderbooks: HashMap<ProductSymbol, OrderBook>,
    positions: HashMap<String, PositionSnapshot>,
    orders: HashMap<String, OrderSnapshot>,
    margins: HashMap<i64, MarginSnapshot>,
    portfolio_margins: HashMap<i64, PortfolioMarginSnapshot>,
}

/// Channels requested by the caller, replayed after every reconnect.
/// Public channels are replayed as soon as the socket opens; private
/// channels wait for a successful auth acknowledgement.
#[derive(Default)]
struct SubscriptionSet {
    public: BTreeMap<String, Vec<String>>,
    private: BTreeSet<String>,
}

enum PumpEnd {
    Closed,
    AuthRejected,
}

struct SessionInner {
    ws_url: String,
    signer: Option<RequestSigner>,
    heartbeat_interval: Duration,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
    connector: Box<dyn WsConnector>,
    state: RwLock<ConnectionState>,
    caches: RwLock<Caches>,
    subscriptions: Mutex<SubscriptionSet>,
    events: EventBus,
    sink: AsyncMutex<Option<Box<dyn WsSink>>>,
    transport_open: AtomicBool,
    stopped: AtomicBool,
}

/// Stateful streaming session against the exchange websocket.
///
/// `connect` spawns a background driver that owns the socket: it opens the
/// transport, authenticates when credentials are present, subscribes the
/// retained channel set, pumps inbound frames into the caches and event
/// bus, sends heartbeats, and reconnects with a bounded attempt budget
/// when the connection drops. The handle itself stays cheap to share.
pub struct DeltaWsSession {
    inner: Arc<SessionInner>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl DeltaWsSession {
    pub fn new(config: &DeltaConfig) -> Self {
        Self::with_connector(config, Box::new(TungsteniteConnector::default()))
    }

    /// Build a session over an injected transport factory. Production code
    /// uses [`DeltaWsSession::new`]; tests use this to script the socket.
    pub fn with_connector(config: &DeltaConfig, connector: Box<dyn WsConnector>) -> Self {
        let signer = config
            .has_credentials()
            .then(|| RequestSigner::new(config.api_key.clone(), config.api_secret.clone()));

        Self {
            inner: Arc::new(SessionInner {
                ws_url: config.ws_url.clone(),
                signer,
                heartbeat_interval: config.heartbeat_interval,
                reconnect_delay: config.reconnect_delay,
                max_reconnect_attempts: config.max_reconnect_attempts,
                connector,
                state: RwLock::new(ConnectionState::Disconnected),
                caches: RwLock::new(Caches::default()),
                subscriptions: Mutex::new(SubscriptionSet::default()),
                events: EventBus::new(),
                sink: AsyncMutex::new(None),
                transport_open: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Start the background driver. Calling this while a driver is already
    /// running is a no-op; after `stop` or a terminal `Failed` state it
    /// starts a fresh connection cycle.
    pub fn connect(&self) {
        let mut driver = self.driver.lock().expect("driver lock poisoned");
        if let Some(handle) = driver.as_ref() {
            if !handle.is_finished() {
                debug!("connect called while driver already running");
                return;
            }
        }
        self.inner.stopped.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        *driver = Some(tokio::spawn(run_driver(inner)));
    }

    /// Tear the session down. Idempotent; the retained subscription set and
    /// caches survive so a later `connect` resumes where it left off.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let handle = self
            .driver
            .lock()
            .expect("driver lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        if let Some(mut sink) = self.inner.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        self.inner.transport_open.store(false, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read().expect("state lock poisoned")
    }

    /// Whether the transport is currently open.
    pub fn is_ready(&self) -> bool {
        self.inner.transport_open.load(Ordering::SeqCst)
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    /// Channel names currently in the retained set, public then private.
    pub fn subscriptions(&self) -> Vec<String> {
        let subs = self
            .inner
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned");
        subs.public
            .keys()
            .cloned()
            .chain(subs.private.iter().cloned())
            .collect()
    }

    // --- channel subscriptions ---

    pub async fn subscribe_ticker(&self, symbols: &[&str]) -> Result<(), DeltaError> {
        self.inner.subscribe_public(CHANNEL_TICKER, symbols).await
    }

    pub async fn subscribe_orderbook(&self, symbols: &[&str]) -> Result<(), DeltaError> {
        self.inner
            .subscribe_public(CHANNEL_ORDERBOOK, symbols)
            .await
    }

    pub async fn subscribe_l2_updates(&self, symbols: &[&str]) -> Result<(), DeltaError> {
        self.inner
            .subscribe_public(CHANNEL_L2_UPDATES, symbols)
            .await
    }

    pub async fn subscribe_mark_price(&self, symbols: &[&str]) -> Result<(), DeltaError> {
        self.inner
            .subscribe_public(CHANNEL_MARK_PRICE, symbols)
            .await
    }

    pub async fn subscribe_spot_price(&self, symbols: &[&str]) -> Result<(), DeltaError> {
        self.inner
            .subscribe_public(CHANNEL_SPOT_PRICE, symbols)
            .await
    }

    pub async fn subscribe_funding_rate(&self, symbols: &[&str]) -> Result<(), DeltaError> {
        self.inner
            .subscribe_public(CHANNEL_FUNDING_RATE, symbols)
            .await
    }

    pub async fn subscribe_positions(&self) -> Result<(), DeltaError> {
        self.inner.subscribe_private(CHANNEL_POSITIONS).await
    }

    pub async fn subscribe_orders(&self) -> Result<(), DeltaError> {
        self.inner.subscribe_private(CHANNEL_ORDERS).await
    }

    pub async fn subscribe_margins(&self) -> Result<(), DeltaError> {
        self.inner.subscribe_private(CHANNEL_MARGINS).await
    }

    pub async fn subscribe_portfolio_margins(&self) -> Result<(), DeltaError> {
        self.inner
            .subscribe_private(CHANNEL_PORTFOLIO_MARGINS)
            .await
    }

    /// Drop a channel from the retained set and, if the socket is open,
    /// tell the exchange to stop sending it.
    pub async fn unsubscribe(&self, channel: &str) -> Result<(), DeltaError> {
        self.inner.unsubscribe(channel).await
    }

    pub async fn unsubscribe_ticker(&self) -> Result<(), DeltaError> {
        self.inner.unsubscribe(CHANNEL_TICKER).await
    }

    pub async fn unsubscribe_orderbook(&self) -> Result<(), DeltaError> {
        self.inner.unsubscribe(CHANNEL_ORDERBOOK).await
    }

    pub async fn unsubscribe_l2_updates(&self) -> Result<(), DeltaError> {
        self.inner.unsubscribe(CHANNEL_L2_UPDATES).await
    }

    pub async fn unsubscribe_mark_price(&self) -> Result<(), DeltaError> {
        self.inner.unsubscribe(CHANNEL_MARK_PRICE).await
    }

    pub async fn unsubscribe_spot_price(&self) -> Result<(), DeltaError> {
        self.inner.unsubscribe(CHANNEL_SPOT_PRICE).await
    }

    pub async fn unsubscribe_funding_rate(&self) -> Result<(), DeltaError> {
        self.inner.unsubscribe(CHANNEL_FUNDING_RATE).await
    }

    pub async fn unsubscribe_positions(&self) -> Result<(), DeltaError> {
        self.inner.unsubscribe(CHANNEL_POSITIONS).await
    }

    pub async fn unsubscribe_orders(&self) -> Result<(), DeltaError> {
        self.inner.unsubscribe(CHANNEL_ORDERS).await
    }

    pub async fn unsubscribe_margins(&self) -> Result<(), DeltaError> {
        self.inner.unsubscribe(CHANNEL_MARGINS).await
    }

    pub async fn unsubscribe_portfolio_margins(&self) -> Result<(), DeltaError> {
        self.inner.unsubscribe(CHANNEL_PORTFOLIO_MARGINS).await
    }

    // --- event bus ---

    pub fn on_ticker(&self) -> broadcast::Receiver<TickerSnapshot> {
        self.inner.events.subscribe_ticker()
    }

    pub fn on_orderbook(&self) -> broadcast::Receiver<OrderBook> {
        self.inner.events.subscribe_orderbook()
    }

    pub fn on_position(&self) -> broadcast::Receiver<PositionSnapshot> {
        self.inner.events.subscribe_position()
    }

    pub fn on_order(&self) -> broadcast::Receiver<OrderSnapshot> {
        self.inner.events.subscribe_order()
    }

    pub fn on_margin(&self) -> broadcast::Receiver<MarginSnapshot> {
        self.inner.events.subscribe_margin()
    }

    pub fn on_portfolio_margin(&self) -> broadcast::Receiver<PortfolioMarginSnapshot> {
        self.inner.events.subscribe_portfolio_margin()
    }

    pub fn on_mark_price(&self) -> broadcast::Receiver<PriceUpdate> {
        self.inner.events.subscribe_mark_price()
    }

    pub fn on_spot_price(&self) -> broadcast::Receiver<PriceUpdate> {
        self.inner.events.subscribe_spot_price()
    }

    pub fn on_funding_rate(&self) -> broadcast::Receiver<serde_json::Value> {
        self.inner.events.subscribe_funding_rate()
    }

    /// Raw frames from channel types the session does not cache: user
    /// trades, MMP triggers, candlesticks, product updates, announcements
    /// and the 30-minute TWAP spot price.
    pub fn on_uncached(&self) -> broadcast::Receiver<serde_json::Value> {
        self.inner.events.subscribe_uncached()
    }

    pub fn on_error(&self) -> broadcast::Receiver<String> {
        self.inner.events.subscribe_error()
    }

    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.events.subscribe_state()
    }

    // --- cache reads ---

    pub fn latest_tickers(&self) -> Vec<TickerSnapshot> {
        self.inner
            .caches
            .read()
            .expect("caches lock poisoned")
            .tickers
            .values()
            .cloned()
            .collect()
    }

    pub fn latest_ticker(&self, symbol: &str) -> Option<TickerSnapshot> {
        self.inner
            .caches
            .read()
            .expect("caches lock poisoned")
            .tickers
            .get(&ProductSymbol::from(symbol))
            .cloned()
    }

    pub fn latest_orderbook(&self, symbol: &str) -> Option<OrderBook> {
        self.inner
            .caches
            .read()
            .expect("caches lock poisoned")
            .orderbooks
            .get(&ProductSymbol::from(symbol))
            .cloned()
    }

    pub fn latest_positions(&self) -> Vec<PositionSnapshot> {
        self.inner
            .caches
            .read()
            .expect("caches lock poisoned")
            .positions
            .values()
            .cloned()
            .collect()
    }

    pub fn latest_orders(&self) -> Vec<OrderSnapshot> {
        self.inner
            .caches
            .read()
            .expect("caches lock poisoned")
            .orders
            .values()
            .cloned()
            .collect()
    }

    pub fn latest_margins(&self) -> Vec<MarginSnapshot> {
        self.inner
            .caches
            .read()
            .expect("caches lock poisoned")
            .margins
            .values()
            .cloned()
            .collect()
    }

    pub fn latest_portfolio_margins(&self) -> Vec<PortfolioMarginSnapshot> {
        self.inner
            .caches
            .read()
            .expect("caches lock poisoned")
            .portfolio_margins
            .values()
            .cloned()
            .collect()
    }
}

impl SessionInner {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().expect("state lock poisoned");
        if *state == next {
            return;
        }
        debug!(from = %*state, to = %next, "connection state change");
        *state = next;
        drop(state);
        self.events.publish_state(next);
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.read().expect("state lock poisoned")
    }

    async fn send(&self, text: String) -> Result<(), DeltaError> {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink.send(text).await,
            None => Err(DeltaError::NotConnected),
        }
    }

    /// Record the subscription, then push it out if the socket is open.
    /// While disconnected the retained set alone is updated; the driver
    /// replays it on the next successful connect.
    async fn subscribe_public(&self, channel: &str, symbols: &[&str]) -> Result<(), DeltaError> {
        let symbols: Vec<String> = symbols.iter().map(ToString::to_string).collect();
        {
            let mut subs = self
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            subs.public.insert(channel.to_string(), symbols.clone());
        }
        if !self.transport_open.load(Ordering::SeqCst) {
            debug!(channel, "not connected; subscription retained for replay");
            return Ok(());
        }
        self.send(subscribe_message(channel, &symbols)).await
    }

    async fn subscribe_private(&self, channel: &str) -> Result<(), DeltaError> {
        if self.signer.is_none() {
            return Err(DeltaError::Auth {
                kind: crate::core::errors::AuthErrorKind::InvalidCredentials,
                message: format!("{} requires API credentials", channel),
            });
        }
        {
            let mut subs = self
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            subs.private.insert(channel.to_string());
        }
        // Private channels only flow after a successful auth ack; until
        // then the retained set carries the request.
        if self.current_state() != ConnectionState::Authenticated {
            debug!(channel, "not authenticated; subscription retained for replay");
            return Ok(());
        }
        self.send(subscribe_message(channel, &all_symbols())).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), DeltaError> {
        let was_retained = {
            let mut subs = self
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            subs.public.remove(channel).is_some() || subs.private.remove(channel)
        };
        if !was_retained {
            debug!(channel, "unsubscribe for channel not in retained set");
        }
        if !self.transport_open.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.send(unsubscribe_message(channel)).await
    }

    /// Open the transport, fire the auth request, subscribe the retained
    /// public set, and hand the read half back to the driver.
    async fn establish(&self) -> Result<Box<dyn WsStream>, DeltaError> {
        let (mut sink, stream) = self.connector.connect(&self.ws_url).await?;
        self.set_state(ConnectionState::Connected);

        // Auth is fire and forget; the ack arrives as a frame on the
        // stream. Market data does not wait for it.
        if let Some(signer) = &self.signer {
            let timestamp = RequestSigner::unix_timestamp()?;
            sink.send(auth_message(signer, timestamp)?).await?;
            self.set_state(ConnectionState::Authenticating);
        } else {
            info!("no credentials configured; private channels unavailable");
        }

        let public = {
            let mut subs = self
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            // Default market data channels, unless the caller already
            // narrowed them to specific symbols.
            subs.public
                .entry(CHANNEL_TICKER.to_string())
                .or_insert_with(all_symbols);
            subs.public
                .entry(CHANNEL_ORDERBOOK.to_string())
                .or_insert_with(all_symbols);
            subs.public.clone()
        };
        for (channel, symbols) in &public {
            sink.send(subscribe_message(channel, symbols)).await?;
        }

        *self.sink.lock().await = Some(sink);
        self.transport_open.store(true, Ordering::SeqCst);
        Ok(stream)
    }

    async fn teardown_transport(&self) {
        self.transport_open.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    /// Drive one established connection until it ends: heartbeats on a
    /// fixed interval, inbound frames decoded and dispatched.
    async fn pump(&self, stream: &mut Box<dyn WsStream>) -> PumpEnd {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.send(ping_message()).await {
                        warn!(error = %e, "heartbeat send failed");
                        return PumpEnd::Closed;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        None => {
                            info!("websocket closed by peer");
                            return PumpEnd::Closed;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket read failed");
                            self.events.publish_error(e.to_string());
                            return PumpEnd::Closed;
                        }
                        Some(Ok(text)) => match decode_event(&text) {
                            Ok(WsEvent::AuthAck { success: false, message }) => {
                                error!(message, "websocket authentication rejected");
                                self.events.publish_error(message);
                                return PumpEnd::AuthRejected;
                            }
                            Ok(event) => self.handle_event(event).await,
                            Err(e) => debug!(error = %e, "dropping undecodable frame"),
                        },
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: WsEvent) {
        match event {
            WsEvent::Ticker(ticker) => {
                {
                    let mut caches = self.caches.write().expect("caches lock poisoned");
                    caches.tickers.insert(ticker.symbol.clone(), ticker.clone());
                }
                self.events.publish_ticker(ticker);
            }
            WsEvent::OrderBookSnapshot { symbol, bids, asks } => {
                let book = {
                    let mut caches = self.caches.write().expect("caches lock poisoned");
                    let book = caches
                        .orderbooks
                        .entry(symbol.clone())
                        .or_insert_with(|| OrderBook::new(symbol));
                    book.apply_snapshot(bids, asks);
                    book.clone()
                };
                self.events.publish_orderbook(book);
            }
            WsEvent::L2Update {
                symbol,
                action: L2Action::Snapshot,
                bids,
                asks,
                ..
            } => {
                let bids = bids
                    .iter()
                    .map(|d| PriceLevel::new(d.price(), d.size()))
                    .collect();
                let asks = asks
                    .iter()
                    .map(|d| PriceLevel::new(d.price(), d.size()))
                    .collect();
                let book = {
                    let mut caches = self.caches.write().expect("caches lock poisoned");
                    let book = caches
                        .orderbooks
                        .entry(symbol.clone())
                        .or_insert_with(|| OrderBook::new(symbol));
                    book.apply_snapshot(bids, asks);
                    book.clone()
                };
                self.events.publish_orderbook(book);
            }
            WsEvent::L2Update {
                symbol,
                action: L2Action::Update,
                bids,
                asks,
                checksum,
            } => {
                let applied = {
                    let mut caches = self.caches.write().expect("caches lock poisoned");
                    match caches.orderbooks.get_mut(&symbol) {
                        Some(book) => {
                            let verified = book.apply_update(&bids, &asks, checksum);
                            Some((book.clone(), verified))
                        }
                        None => {
                            debug!(symbol = %symbol, "l2 update for unknown book");
                            None
                        }
                    }
                };
                match applied {
                    Some((book, true)) => self.events.publish_orderbook(book),
                    Some((_, false)) => {
                        warn!(symbol = %symbol, "orderbook checksum mismatch; resyncing");
                        self.resync_l2(&symbol).await;
                    }
                    None => {}
                }
            }
            WsEvent::MarkPrice { symbol, mark_price } => {
                {
                    let mut caches = self.caches.write().expect("caches lock poisoned");
                    let ticker = caches
                        .tickers
                        .entry(symbol.clone())
                        .or_insert_with(|| TickerSnapshot {
                            symbol: symbol.clone(),
                            ..TickerSnapshot::default()
                        });
                    ticker.mark_price = Some(mark_price);
                }
                self.events.publish_mark_price(PriceUpdate {
                    symbol,
                    price: mark_price,
                });
            }
            WsEvent::SpotPrice { symbol, spot_price } => {
                {
                    let mut caches = self.caches.write().expect("caches lock poisoned");
                    let ticker = caches
                        .tickers
                        .entry(symbol.clone())
                        .or_insert_with(|| TickerSnapshot {
                            symbol: symbol.clone(),
                            ..TickerSnapshot::default()
                        });
                    ticker.spot_price = Some(spot_price);
                }
                self.events.publish_spot_price(PriceUpdate {
                    symbol,
                    price: spot_price,
                });
            }
            WsEvent::FundingRate(payload) => self.events.publish_funding_rate(payload),
            WsEvent::Position(position) => {
                {
                    let mut caches = self.caches.write().expect("caches lock poisoned");
                    caches
                        .positions
                        .insert(position.cache_key(), position.clone());
                }
                self.events.publish_position(position);
            }
            WsEvent::Order(order) => {
                {
                    let mut caches = self.caches.write().expect("caches lock poisoned");
                    caches.orders.insert(order.cache_key(), order.clone());
                }
                self.events.publish_order(order);
            }
            WsEvent::Margin(margin) => {
                {
                    let mut caches = self.caches.write().expect("caches lock poisoned");
                    caches.margins.insert(margin.cache_key(), margin.clone());
                }
                self.events.publish_margin(margin);
            }
            WsEvent::PortfolioMargin(pm) => {
                {
                    let mut caches = self.caches.write().expect("caches lock poisoned");
                    caches.portfolio_margins.insert(pm.cache_key(), pm.clone());
                }
                self.events.publish_portfolio_margin(pm);
            }
            WsEvent::AuthAck { success: true, .. } => {
                info!("websocket authenticated");
                self.set_state(ConnectionState::Authenticated);
                self.subscribe_private_channels().await;
            }
            // Rejections are intercepted in pump before dispatch.
            WsEvent::AuthAck { success: false, .. } => {}
            WsEvent::ServerError(message) => {
                warn!(message, "server reported error");
                self.events.publish_error(message);
            }
            WsEvent::Uncached(payload) => self.events.publish_uncached(payload),
            WsEvent::Pong | WsEvent::Ignored => {}
        }
    }

    /// Retarget the delta stream at one symbol to receive a fresh snapshot.
    /// Deliberately bypasses the retained set: the caller's subscription is
    /// unchanged, this is session-internal repair.
    async fn resync_l2(&self, symbol: &ProductSymbol) {
        if let Err(e) = self.send(unsubscribe_message(CHANNEL_L2_UPDATES)).await {
            warn!(error = %e, "resync unsubscribe failed");
            return;
        }
        if let Err(e) = self
            .send(subscribe_message(
                CHANNEL_L2_UPDATES,
                &[symbol.as_str().to_string()],
            ))
            .await
        {
            warn!(error = %e, "resync resubscribe failed");
        }
    }

    async fn subscribe_private_channels(&self) {
        let private: Vec<String> = {
            let mut subs = self
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            // Positions, orders and portfolio margins always flow once
            // authenticated; other private channels ride along when retained.
            for channel in [CHANNEL_POSITIONS, CHANNEL_ORDERS, CHANNEL_PORTFOLIO_MARGINS] {
                subs.private.insert(channel.to_string());
            }
            subs.private.iter().cloned().collect()
        };
        for channel in private {
            if let Err(e) = self.send(subscribe_message(&channel, &all_symbols())).await {
                warn!(channel, error = %e, "private subscribe failed");
            }
        }
    }
}

fn all_symbols() -> Vec<String> {
    vec!["all".to_string()]
}

/// Connection loop: establish, pump, reconnect with a bounded budget.
/// The attempt counter resets only when a connection actually opens, so a
/// flapping endpoint cannot stay in the retry loop forever.
async fn run_driver(inner: Arc<SessionInner>) {
    let mut attempts: u32 = 0;
    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            inner.set_state(ConnectionState::Disconnected);
            return;
        }
        inner.set_state(ConnectionState::Connecting);
        match inner.establish().await {
            Ok(mut stream) => {
                attempts = 0;
                match inner.pump(&mut stream).await {
                    PumpEnd::Closed => {}
                    PumpEnd::AuthRejected => {
                        warn!("authentication rejected; dropping connection");
                    }
                }
                inner.teardown_transport().await;
                inner.set_state(ConnectionState::Disconnected);
            }
            Err(e) => {
                warn!(error = %e, "websocket connect failed");
                inner.events.publish_error(e.to_string());
                inner.teardown_transport().await;
            }
        }

        if inner.stopped.load(Ordering::SeqCst) {
            inner.set_state(ConnectionState::Disconnected);
            return;
        }
        if attempts >= inner.max_reconnect_attempts {
            error!(
                attempts = inner.max_reconnect_attempts,
                "reconnect budget exhausted; giving up"
            );
            inner
                .events
                .publish_error(DeltaError::MaxReconnectAttemptsExceeded(attempts).to_string());
            inner.set_state(ConnectionState::Failed);
            return;
        }
        attempts += 1;
        info!(
            attempt = attempts,
            max = inner.max_reconnect_attempts,
            delay = ?inner.reconnect_delay,
            "reconnecting"
        );
        inner.set_state(ConnectionState::Reconnecting);
        tokio::time::sleep(inner.reconnect_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Authenticated.to_string(), "authenticated");
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_subscriptions_empty_without_requests() {
        let config = DeltaConfig::read_only();
        let session = DeltaWsSession::new(&config);
        assert!(session.subscriptions().is_empty());
        assert!(!session.is_ready());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_retains_while_disconnected() {
        let config = DeltaConfig::read_only();
        let session = DeltaWsSession::new(&config);
        session.subscribe_ticker(&["BTCUSD"]).await.unwrap();
        session.subscribe_l2_updates(&["ETHUSD"]).await.unwrap();
        let subs = session.subscriptions();
        assert!(subs.contains(&"v2/ticker".to_string()));
        assert!(subs.contains(&"l2_updates".to_string()));
    }

    #[tokio::test]
    async fn test_private_subscribe_requires_credentials() {
        let config = DeltaConfig::read_only();
        let session = DeltaWsSession::new(&config);
        let err = session.subscribe_positions().await.unwrap_err();
        assert!(matches!(err, DeltaError::Auth { .. }));
        assert!(session.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_from_retained_set() {
        let config = DeltaConfig::read_only();
        let session = DeltaWsSession::new(&config);
        session.subscribe_ticker(&["BTCUSD"]).await.unwrap();
        session.unsubscribe(CHANNEL_TICKER).await.unwrap();
        assert!(session.subscriptions().is_empty());
    }
}
