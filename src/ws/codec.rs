use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::core::errors::DeltaError;
use crate::core::types::{
    LevelDelta, MarginSnapshot, OrderSnapshot, PortfolioMarginSnapshot, PositionSnapshot,
    PriceLevel, ProductSymbol, TickerSnapshot,
};
use crate::rest::signer::RequestSigner;

// --- outbound envelopes ---

pub fn auth_message(signer: &RequestSigner, timestamp: u64) -> Result<String, DeltaError> {
    let signature = signer.sign_ws(timestamp)?;
    Ok(json!({
        "type": "auth",
        "payload": {
            "api-key": signer.api_key(),
            "signature": signature,
            "timestamp": timestamp,
        }
    })
    .to_string())
}

pub fn subscribe_message(channel: &str, symbols: &[String]) -> String {
    json!({
        "type": "subscribe",
        "payload": {
            "channels": [{ "name": channel, "symbols": symbols }]
        }
    })
    .to_string()
}

pub fn unsubscribe_message(channel: &str) -> String {
    json!({
        "type": "unsubscribe",
        "payload": {
            "channels": [{ "name": channel }]
        }
    })
    .to_string()
}

pub fn ping_message() -> String {
    json!({ "type": "ping" }).to_string()
}

// --- inbound events ---

/// The closed set of inbound message kinds the session reacts to. Channel
/// types the session accepts but does not cache decode to `Ignored`.
#[derive(Debug, Clone)]
pub enum WsEvent {
    Ticker(TickerSnapshot),
    OrderBookSnapshot {
        symbol: ProductSymbol,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    },
    L2Update {
        symbol: ProductSymbol,
        action: L2Action,
        bids: Vec<LevelDelta>,
        asks: Vec<LevelDelta>,
        checksum: Option<u32>,
    },
    MarkPrice {
        symbol: ProductSymbol,
        mark_price: rust_decimal::Decimal,
    },
    SpotPrice {
        symbol: ProductSymbol,
        spot_price: rust_decimal::Decimal,
    },
    FundingRate(Value),
    Position(PositionSnapshot),
    Order(OrderSnapshot),
    Margin(MarginSnapshot),
    PortfolioMargin(PortfolioMarginSnapshot),
    AuthAck { success: bool, message: String },
    ServerError(String),
    /// Channel types the session forwards without maintaining a cache
    /// (user trades, MMP triggers, candlesticks, announcements and the
    /// like). The raw frame is carried through.
    Uncached(Value),
    Pong,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Action {
    Snapshot,
    Update,
}

#[derive(Deserialize)]
struct L2UpdatesFrame {
    symbol: ProductSymbol,
    action: String,
    #[serde(default)]
    bids: Vec<LevelDelta>,
    #[serde(default)]
    asks: Vec<LevelDelta>,
    #[serde(default)]
    cs: Option<u32>,
}

#[derive(Deserialize)]
struct L2SnapshotFrame {
    symbol: ProductSymbol,
    #[serde(default)]
    buy: Vec<PriceLevel>,
    #[serde(default)]
    sell: Vec<PriceLevel>,
}

#[derive(Deserialize)]
struct PriceFrame {
    symbol: ProductSymbol,
    #[serde(default)]
    mark_price: Option<rust_decimal::Decimal>,
    #[serde(default)]
    spot_price: Option<rust_decimal::Decimal>,
    #[serde(default)]
    price: Option<rust_decimal::Decimal>,
}

/// Decode one inbound text frame into a [`WsEvent`].
///
/// Unknown `type` discriminators are accepted and ignored rather than
/// treated as errors; only malformed JSON or a missing discriminator is a
/// decode failure.
pub fn decode_event(text: &str) -> Result<WsEvent, DeltaError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| DeltaError::Deserialization(format!("websocket frame: {}", e)))?;

    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DeltaError::Deserialization("frame without type field".to_string()))?;

    let event = match message_type {
        "ticker" => WsEvent::Ticker(from_value(value)?),
        "l2_orderbook" => {
            let frame: L2SnapshotFrame = from_value(value)?;
            WsEvent::OrderBookSnapshot {
                symbol: frame.symbol,
                bids: frame.buy,
                asks: frame.sell,
            }
        }
        "l2_updates" => {
            let frame: L2UpdatesFrame = from_value(value)?;
            let action = match frame.action.as_str() {
                "snapshot" => L2Action::Snapshot,
                "update" => L2Action::Update,
                other => {
                    debug!(action = other, "ignoring l2_updates with unknown action");
                    return Ok(WsEvent::Ignored);
                }
            };
            WsEvent::L2Update {
                symbol: frame.symbol,
                action,
                bids: frame.bids,
                asks: frame.asks,
                checksum: frame.cs,
            }
        }
        "mark_price" => {
            let frame: PriceFrame = from_value(value)?;
            match frame.mark_price.or(frame.price) {
                Some(mark_price) => WsEvent::MarkPrice {
                    symbol: frame.symbol,
                    mark_price,
                },
                None => WsEvent::Ignored,
            }
        }
        "spot_price" | "v2/spot_price" => {
            let frame: PriceFrame = from_value(value)?;
            match frame.spot_price.or(frame.price) {
                Some(spot_price) => WsEvent::SpotPrice {
                    symbol: frame.symbol,
                    spot_price,
                },
                None => WsEvent::Ignored,
            }
        }
        "funding_rate" => WsEvent::FundingRate(value),
        "positions" => WsEvent::Position(from_value(value)?),
        "orders" => WsEvent::Order(from_value(value)?),
        "margins" => WsEvent::Margin(from_value(value)?),
        "portfolio_margins" => WsEvent::PortfolioMargin(from_value(value)?),
        "auth_ack" => {
            let success = value
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            WsEvent::AuthAck { success, message }
        }
        "error" => {
            let message = value
                .pointer("/payload/message")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown websocket error")
                .to_string();
            WsEvent::ServerError(message)
        }
        "pong" => WsEvent::Pong,
        // Accepted channel types with no cache; the raw frame is forwarded.
        "candlesticks" | "spot_30mtwap_price" | "product_updates" | "announcements"
        | "v2/user_trades" | "mmp_trigger" => WsEvent::Uncached(value),
        // Subscription acks carry nothing the session acts on.
        "subscriptions" => WsEvent::Ignored,
        other => {
            debug!(message_type = other, "unhandled message type");
            WsEvent::Ignored
        }
    };

    Ok(event)
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, DeltaError> {
    serde_json::from_value(value)
        .map_err(|e| DeltaError::Deserialization(format!("websocket payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    fn signer() -> RequestSigner {
        RequestSigner::new(
            Secret::new("key".to_string()),
            Secret::new("secret".to_string()),
        )
    }

    #[test]
    fn test_auth_message_shape() {
        let text = auth_message(&signer(), 1_700_000_000).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "auth");
        assert_eq!(value["payload"]["api-key"], "key");
        assert_eq!(value["payload"]["timestamp"], 1_700_000_000);
        let signature = value["payload"]["signature"].as_str().unwrap();
        assert_eq!(signature, signer().sign_ws(1_700_000_000).unwrap());
    }

    #[test]
    fn test_subscribe_message_shape() {
        let text = subscribe_message("v2/ticker", &["BTCUSD".to_string()]);
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["payload"]["channels"][0]["name"], "v2/ticker");
        assert_eq!(value["payload"]["channels"][0]["symbols"][0], "BTCUSD");
    }

    #[test]
    fn test_unsubscribe_message_has_no_symbols() {
        let text = unsubscribe_message("l2_updates");
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "unsubscribe");
        assert_eq!(value["payload"]["channels"][0]["name"], "l2_updates");
        assert!(value["payload"]["channels"][0].get("symbols").is_none());
    }

    #[test]
    fn test_decode_ticker() {
        let event =
            decode_event(r#"{"type":"ticker","symbol":"BTCUSD","price":"65000.5"}"#).unwrap();
        match event {
            WsEvent::Ticker(ticker) => {
                assert_eq!(ticker.symbol.as_str(), "BTCUSD");
                assert_eq!(ticker.price.unwrap().to_string(), "65000.5");
            }
            other => panic!("expected ticker, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_l2_update_with_checksum() {
        let event = decode_event(
            r#"{"type":"l2_updates","symbol":"BTCUSD","action":"update","bids":[["99","0"]],"asks":[],"cs":123}"#,
        )
        .unwrap();
        match event {
            WsEvent::L2Update {
                symbol,
                action,
                bids,
                checksum,
                ..
            } => {
                assert_eq!(symbol.as_str(), "BTCUSD");
                assert_eq!(action, L2Action::Update);
                assert_eq!(bids.len(), 1);
                assert!(bids[0].size().is_zero());
                assert_eq!(checksum, Some(123));
            }
            other => panic!("expected l2 update, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_orderbook_snapshot_maps_buy_sell() {
        let event = decode_event(
            r#"{"type":"l2_orderbook","symbol":"BTCUSD","buy":[{"price":"100","size":"1"}],"sell":[{"price":"101","size":"2"}]}"#,
        )
        .unwrap();
        match event {
            WsEvent::OrderBookSnapshot { bids, asks, .. } => {
                assert_eq!(bids.len(), 1);
                assert_eq!(asks.len(), 1);
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_auth_ack() {
        let ok = decode_event(r#"{"type":"auth_ack","success":true}"#).unwrap();
        assert!(matches!(ok, WsEvent::AuthAck { success: true, .. }));

        let failed =
            decode_event(r#"{"type":"auth_ack","success":false,"message":"bad key"}"#).unwrap();
        match failed {
            WsEvent::AuthAck { success, message } => {
                assert!(!success);
                assert_eq!(message, "bad key");
            }
            other => panic!("expected auth_ack, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_event() {
        let event =
            decode_event(r#"{"type":"error","payload":{"message":"subscription refused"}}"#)
                .unwrap();
        match event {
            WsEvent::ServerError(message) => assert_eq!(message, "subscription refused"),
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_ignored_not_error() {
        assert!(matches!(
            decode_event(r#"{"type":"brand_new_channel","data":1}"#).unwrap(),
            WsEvent::Ignored
        ));
        assert!(matches!(
            decode_event(r#"{"type":"subscriptions"}"#).unwrap(),
            WsEvent::Ignored
        ));
    }

    #[test]
    fn test_uncached_types_forward_the_raw_frame() {
        let event =
            decode_event(r#"{"type":"mmp_trigger","user_id":7,"frozen_till":123}"#).unwrap();
        match event {
            WsEvent::Uncached(payload) => {
                assert_eq!(payload["type"], "mmp_trigger");
                assert_eq!(payload["user_id"], 7);
            }
            other => panic!("expected uncached frame, got {:?}", other),
        }
        assert!(matches!(
            decode_event(r#"{"type":"v2/user_trades","symbol":"BTCUSD"}"#).unwrap(),
            WsEvent::Uncached(_)
        ));
        assert!(matches!(
            decode_event(r#"{"type":"announcements"}"#).unwrap(),
            WsEvent::Uncached(_)
        ));
    }

    #[test]
    fn test_malformed_frame_is_an_error() {
        assert!(decode_event("not json").is_err());
        assert!(decode_event(r#"{"no_type":true}"#).is_err());
    }
}
