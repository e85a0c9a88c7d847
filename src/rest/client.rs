use reqwest::{Client, Method, Response};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{instrument, trace, warn};

use crate::core::config::DeltaConfig;
use crate::core::errors::{classify_http, AuthErrorKind, DeltaError};
use crate::core::types::{CancelAllFilter, CancelOrderRequest, EditOrderRequest, OrderRequest};
use crate::rest::signer::RequestSigner;

/// Bounded retry for the two idempotent public GETs; everything else
/// surfaces `RateLimited` to the caller untouched.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Signed REST client for the Delta Exchange v2 API.
///
/// Every signed call carries `api-key`, `signature` and `timestamp` headers
/// where the signature is HMAC-SHA256 over
/// `method + timestamp + path + query + body`. Non-2xx responses map to the
/// [`DeltaError`] taxonomy via [`classify_http`]; business-field validation
/// stays with the caller.
pub struct DeltaRestClient {
    client: Client,
    base_url: String,
    signer: Option<RequestSigner>,
}

impl std::fmt::Debug for DeltaRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaRestClient")
            .field("base_url", &self.base_url)
            .field("has_signer", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl DeltaRestClient {
    pub fn new(config: &DeltaConfig) -> Result<Self, DeltaError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("delta-connect/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeltaError::Network(format!("failed to build HTTP client: {}", e)))?;

        let signer = config
            .has_credentials()
            .then(|| RequestSigner::new(config.api_key.clone(), config.api_secret.clone()));

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            signer,
        })
    }

    // --- public market data ---

    /// `GET /v2/products` (public). Retries on 429 up to the bounded limit.
    #[instrument(skip(self))]
    pub async fn get_products(&self) -> Result<Value, DeltaError> {
        retry_rate_limited(MAX_RATE_LIMIT_RETRIES, || {
            self.request(Method::GET, "/v2/products", String::new(), None, false)
        })
        .await
    }

    /// `GET /v2/tickers/{symbol}` (public). Retries on 429 up to the bounded limit.
    #[instrument(skip(self))]
    pub async fn get_ticker(&self, symbol: &str) -> Result<Value, DeltaError> {
        let path = format!("/v2/tickers/{}", symbol);
        retry_rate_limited(MAX_RATE_LIMIT_RETRIES, || {
            self.request(Method::GET, &path, String::new(), None, false)
        })
        .await
    }

    /// `GET /v2/l2orderbook/{symbol}` (public, no retry).
    #[instrument(skip(self))]
    pub async fn get_orderbook(&self, symbol: &str) -> Result<Value, DeltaError> {
        let path = format!("/v2/l2orderbook/{}", symbol);
        self.request(Method::GET, &path, String::new(), None, false)
            .await
    }

    // --- order management ---

    #[instrument(skip(self, order))]
    pub async fn place_order(&self, order: &OrderRequest) -> Result<Value, DeltaError> {
        self.signed_json(Method::POST, "/v2/orders", order).await
    }

    #[instrument(skip(self, order))]
    pub async fn edit_order(&self, order: &EditOrderRequest) -> Result<Value, DeltaError> {
        self.signed_json(Method::PUT, "/v2/orders", order).await
    }

    /// `DELETE /v2/orders` carries the order reference in the request body.
    #[instrument(skip(self, order))]
    pub async fn cancel_order(&self, order: &CancelOrderRequest) -> Result<Value, DeltaError> {
        self.signed_json(Method::DELETE, "/v2/orders", order).await
    }

    #[instrument(skip(self, orders))]
    pub async fn place_batch_orders(&self, orders: &[OrderRequest]) -> Result<Value, DeltaError> {
        self.signed_json(Method::POST, "/v2/orders/batch", orders)
            .await
    }

    #[instrument(skip(self, orders))]
    pub async fn edit_batch_orders(
        &self,
        orders: &[EditOrderRequest],
    ) -> Result<Value, DeltaError> {
        self.signed_json(Method::PUT, "/v2/orders/batch", orders)
            .await
    }

    #[instrument(skip(self, orders))]
    pub async fn cancel_batch_orders(
        &self,
        orders: &[CancelOrderRequest],
    ) -> Result<Value, DeltaError> {
        self.signed_json(Method::DELETE, "/v2/orders/batch", orders)
            .await
    }

    /// Bracket payloads are forwarded verbatim; the exchange validates them.
    #[instrument(skip(self, order))]
    pub async fn place_bracket_order(&self, order: &Value) -> Result<Value, DeltaError> {
        self.signed_json(Method::POST, "/v2/orders/bracket", order)
            .await
    }

    #[instrument(skip(self, order))]
    pub async fn edit_bracket_order(&self, order: &Value) -> Result<Value, DeltaError> {
        self.signed_json(Method::PUT, "/v2/orders/bracket", order)
            .await
    }

    /// `DELETE /v2/orders/cancel_all`; with no filter the signature covers
    /// an empty body and none is sent.
    #[instrument(skip(self, filter))]
    pub async fn cancel_all_orders(
        &self,
        filter: Option<&CancelAllFilter>,
    ) -> Result<Value, DeltaError> {
        match filter {
            Some(f) => self.signed_json(Method::DELETE, "/v2/orders/cancel_all", f).await,
            None => {
                self.request(Method::DELETE, "/v2/orders/cancel_all", String::new(), None, true)
                    .await
            }
        }
    }

    // --- account state ---

    #[instrument(skip(self))]
    pub async fn get_positions(&self) -> Result<Value, DeltaError> {
        self.request(Method::GET, "/v2/positions", String::new(), None, true)
            .await
    }

    #[instrument(skip(self))]
    pub async fn close_all_positions(&self) -> Result<Value, DeltaError> {
        self.request(
            Method::POST,
            "/v2/positions/close_all",
            String::new(),
            None,
            true,
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn set_leverage(
        &self,
        product_id: i64,
        leverage: rust_decimal::Decimal,
    ) -> Result<Value, DeltaError> {
        let body = serde_json::json!({ "product_id": product_id, "leverage": leverage });
        self.signed_json(Method::POST, "/v2/positions/change_leverage", &body)
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_balances(&self) -> Result<Value, DeltaError> {
        self.request(Method::GET, "/v2/wallet/balances", String::new(), None, true)
            .await
    }

    /// Option chain: `GET /v2/tickers?product_type=option&underlying_asset=X[&expiry=Y]`.
    #[instrument(skip(self))]
    pub async fn get_option_chain(
        &self,
        underlying_asset: &str,
        expiry: Option<&str>,
    ) -> Result<Value, DeltaError> {
        let mut query = format!("product_type=option&underlying_asset={}", underlying_asset);
        if let Some(expiry) = expiry {
            query.push_str("&expiry=");
            query.push_str(expiry);
        }
        self.request(Method::GET, "/v2/tickers", query, None, true)
            .await
    }

    #[instrument(skip(self, params))]
    pub async fn get_order_history(
        &self,
        params: &[(&str, &str)],
    ) -> Result<Value, DeltaError> {
        self.request(
            Method::GET,
            "/v2/orders/history",
            build_query(params),
            None,
            true,
        )
        .await
    }

    #[instrument(skip(self, params))]
    pub async fn get_fills(&self, params: &[(&str, &str)]) -> Result<Value, DeltaError> {
        self.request(Method::GET, "/v2/fills", build_query(params), None, true)
            .await
    }

    #[instrument(skip(self, params))]
    pub async fn get_wallet_transactions(
        &self,
        params: &[(&str, &str)],
    ) -> Result<Value, DeltaError> {
        self.request(
            Method::GET,
            "/v2/wallet/transactions",
            build_query(params),
            None,
            true,
        )
        .await
    }

    // --- heartbeat (deadman switch) ---

    #[instrument(skip(self, heartbeat))]
    pub async fn create_heartbeat(&self, heartbeat: &Value) -> Result<Value, DeltaError> {
        self.signed_json(Method::POST, "/v2/heartbeat/create", heartbeat)
            .await
    }

    #[instrument(skip(self, heartbeat))]
    pub async fn ack_heartbeat(&self, heartbeat: &Value) -> Result<Value, DeltaError> {
        self.signed_json(Method::POST, "/v2/heartbeat", heartbeat)
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_heartbeat(&self, heartbeat_id: Option<&str>) -> Result<Value, DeltaError> {
        let query = heartbeat_id
            .map(|id| format!("heartbeat_id={}", id))
            .unwrap_or_default();
        self.request(Method::GET, "/v2/heartbeat", query, None, true)
            .await
    }

    // --- market maker protection ---

    #[instrument(skip(self, mmp_config))]
    pub async fn update_mmp(&self, mmp_config: &Value) -> Result<Value, DeltaError> {
        self.signed_json(Method::PUT, "/v2/users/update_mmp", mmp_config)
            .await
    }

    #[instrument(skip(self, mmp_config))]
    pub async fn reset_mmp(&self, mmp_config: &Value) -> Result<Value, DeltaError> {
        self.signed_json(Method::PUT, "/v2/users/reset_mmp", mmp_config)
            .await
    }

    // --- internals ---

    async fn signed_json<T: serde::Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &T,
    ) -> Result<Value, DeltaError> {
        let body = serde_json::to_string(body)
            .map_err(|e| DeltaError::Serialization(format!("request body: {}", e)))?;
        self.request(method, path, String::new(), Some(body), true)
            .await
    }

    /// Build, optionally sign, and send one request. `query` and `body` are
    /// the exact strings transmitted, so the signature covers them verbatim.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: String,
        body: Option<String>,
        signed: bool,
    ) -> Result<Value, DeltaError> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let body_text = body.unwrap_or_default();
        let mut request = self.client.request(method.clone(), &url);

        if signed {
            let signer = self.signer.as_ref().ok_or_else(|| DeltaError::Auth {
                kind: AuthErrorKind::InvalidCredentials,
                message: "credentials required for signed request".to_string(),
            })?;
            let timestamp = RequestSigner::unix_timestamp()?;
            let signature = signer.sign(method.as_str(), path, &query, &body_text, timestamp)?;
            request = request
                .header("api-key", signer.api_key())
                .header("signature", signature)
                .header("timestamp", timestamp.to_string());
        }

        if !body_text.is_empty() {
            request = request
                .header("Content-Type", "application/json")
                .body(body_text);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeltaError::Network(format!("request failed: {}", e)))?;

        Self::handle_response(response).await
    }

    async fn handle_response(response: Response) -> Result<Value, DeltaError> {
        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());

        let text = response
            .text()
            .await
            .map_err(|e| DeltaError::Network(format!("failed to read response body: {}", e)))?;

        trace!(status = %status, "response body: {}", text);

        if status.is_success() {
            serde_json::from_str(&text)
                .map_err(|e| DeltaError::Deserialization(format!("response body: {}", e)))
        } else {
            let message = extract_error_message(&text);
            Err(classify_http(status.as_u16(), &message, retry_after))
        }
    }
}

/// Pull the server's error message out of a failure body, falling back to
/// the raw text when it isn't the usual `{success, error: {code, message}}`
/// envelope.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.pointer("/error/message"))
                .or_else(|| v.pointer("/error/code"))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

/// Re-issue `op` while it reports `RateLimited`, waiting the server's
/// `retry-after` (default 5 s) between attempts, at most `max_retries`
/// times. After exhaustion the rate-limit error is surfaced.
async fn retry_rate_limited<F, Fut>(max_retries: u32, mut op: F) -> Result<Value, DeltaError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, DeltaError>>,
{
    let mut attempts = 0u32;
    loop {
        match op().await {
            Err(DeltaError::RateLimited {
                retry_after,
                message,
            }) if attempts < max_retries => {
                attempts += 1;
                let delay = retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                warn!(
                    attempt = attempts,
                    delay_secs = delay,
                    "rate limited: {}, retrying",
                    message
                );
                sleep(Duration::from_secs(delay)).await;
            }
            other => return other,
        }
    }
}

fn build_query(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_extract_error_message() {
        assert_eq!(
            extract_error_message(r#"{"success":false,"error":{"code":"insufficient_margin","message":"insufficient_margin for order"}}"#),
            "insufficient_margin for order"
        );
        assert_eq!(
            extract_error_message(r#"{"message":"Invalid API Key"}"#),
            "Invalid API Key"
        );
        assert_eq!(
            extract_error_message(r#"{"success":false,"error":{"code":"invalid_contract"}}"#),
            "invalid_contract"
        );
        assert_eq!(extract_error_message("plain text body"), "plain text body");
    }

    #[test]
    fn test_build_query() {
        assert_eq!(build_query(&[]), "");
        assert_eq!(
            build_query(&[("product_id", "27"), ("page_size", "50")]),
            "product_id=27&page_size=50"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_then_reissues() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result = retry_rate_limited(MAX_RATE_LIMIT_RETRIES, || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(DeltaError::RateLimited {
                    retry_after: Some(2),
                    message: "slow down".to_string(),
                }),
                _ => Ok(Value::Bool(true)),
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // The second issue happens only after the advertised retry-after.
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_bounded() {
        let calls = AtomicU32::new(0);

        let result = retry_rate_limited(MAX_RATE_LIMIT_RETRIES, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DeltaError::RateLimited {
                retry_after: Some(1),
                message: "still limited".to_string(),
            })
        })
        .await;

        assert!(matches!(result, Err(DeltaError::RateLimited { .. })));
        // Initial attempt plus the bounded retries, then surface the error.
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RATE_LIMIT_RETRIES + 1);
    }

    #[tokio::test]
    async fn test_non_rate_limit_errors_pass_through() {
        let calls = AtomicU32::new(0);

        let result = retry_rate_limited(MAX_RATE_LIMIT_RETRIES, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DeltaError::Server {
                status: 500,
                message: "boom".to_string(),
            })
        })
        .await;

        assert!(matches!(result, Err(DeltaError::Server { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_signed_request_without_credentials_fails_fast() {
        let config = crate::core::config::DeltaConfig::read_only();
        let client = DeltaRestClient::new(&config).unwrap();
        let result = client.get_positions().await;
        assert!(matches!(
            result,
            Err(DeltaError::Auth {
                kind: AuthErrorKind::InvalidCredentials,
                ..
            })
        ));
    }
}
