use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Product symbol as Delta reports it (e.g. `BTCUSD`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductSymbol(pub String);

impl ProductSymbol {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProductSymbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProductSymbol {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Standard Delta REST envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub result: T,
}

/// One price level of the L2 book. Prices and sizes keep the exchange's
/// string rendering (scale included) so checksum input is reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    #[serde(with = "rust_decimal::serde::str", alias = "limit_price")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// One `[price, size]` delta from an `l2_updates` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelDelta(
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
);

impl LevelDelta {
    pub fn price(&self) -> Decimal {
        self.0
    }

    pub fn size(&self) -> Decimal {
        self.1
    }
}

/// Order placement request forwarded verbatim to `POST /v2/orders`.
/// Business-field validation is the caller's job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderRequest {
    pub product_id: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    pub side: OrderSide,
    pub order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_in_force: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    #[default]
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    #[default]
    LimitOrder,
    MarketOrder,
}

/// Edit request for `PUT /v2/orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditOrderRequest {
    pub id: i64,
    pub product_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
}

/// Cancel request for `DELETE /v2/orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrderRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub product_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

/// Filter for `DELETE /v2/orders/cancel_all`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelAllFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_types: Option<Vec<String>>,
}

/// Latest ticker state for a symbol. Mark and spot prices arrive on their
/// own channels and are merged into the cached entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: ProductSymbol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Latest position state, replaced wholesale per inbound update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub product_symbol: ProductSymbol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl: Option<Decimal>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PositionSnapshot {
    /// Natural cache key: the position id when present, the product symbol
    /// otherwise.
    pub fn cache_key(&self) -> String {
        self.position_id
            .map_or_else(|| self.product_symbol.0.clone(), |id| id.to_string())
    }
}

/// Latest order state, replaced wholesale per inbound update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub product_symbol: ProductSymbol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<OrderSide>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unfilled_size: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl OrderSnapshot {
    /// Natural cache key: client order id when the caller supplied one,
    /// otherwise the exchange order id.
    pub fn cache_key(&self) -> String {
        self.client_order_id.clone().unwrap_or_else(|| {
            self.order_id
                .map(|id| id.to_string())
                .unwrap_or_default()
        })
    }
}

/// Latest per-asset margin state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarginSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_balance: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_margin: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_margin: Option<Decimal>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl MarginSnapshot {
    pub fn cache_key(&self) -> i64 {
        self.account_id.or(self.user_id).unwrap_or_default()
    }
}

/// Account-level risk aggregate, including the liquidation-risk flag and
/// margin shortfall amount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioMarginSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liquidation_risk: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin_shortfall: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portfolio_margin: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_margin: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_margin: Option<Decimal>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PortfolioMarginSnapshot {
    pub fn cache_key(&self) -> i64 {
        self.account_id.or(self.user_id).unwrap_or_default()
    }
}
