//! Binance USDⓈ-M Futures REST client.

use crate::config::BinanceConfig;
use crate::exchange::error::ExchangeError;
use crate::exchange::traits::ExchangeAdapter;
use crate::exchange::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";
const RECV_WINDOW_MS: u64 = 5000;

/// Binance Futures client covering regular and conditional (algo) orders.
pub struct BinanceClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

impl BinanceClient {
    /// Create a new Binance client from configuration.
    pub fn new(config: &BinanceConfig, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = match &config.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if config.testnet => FUTURES_TESTNET_URL.to_string(),
            None => FUTURES_BASE_URL.to_string(),
        };

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url,
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> Result<String, ExchangeError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ExchangeError::Auth(format!("invalid secret key: {e}")))?;
        mac.update(query_string.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    fn encode(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Send a signed request and decode the JSON body.
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Self::timestamp().to_string()));

        let query = Self::encode(&params);
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        Self::decode(response).await
    }

    /// Send an unsigned request and decode the JSON body.
    async fn public<T: DeserializeOwned>(&self, path: &str) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let error = match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(api) if !matches!(status.as_u16(), 429 | 418) && !status.is_server_error() => {
                    ExchangeError::from_api(api.code, &api.msg)
                }
                _ => ExchangeError::from_http_status(status.as_u16(), &body),
            };
            debug!(status = status.as_u16(), error = %error, "Exchange returned error");
            return Err(error);
        }

        serde_json::from_str(&body).map_err(|e| ExchangeError::Decode(format!("{e}: {body}")))
    }

    fn lookup_params<'a>(
        symbol: &str,
        lookup: &OrderLookup,
        id_key: &'a str,
        client_key: &'a str,
    ) -> Vec<(&'a str, String)> {
        let mut params = vec![("symbol", symbol.to_string())];
        match lookup {
            OrderLookup::ExchangeId(id) => params.push((id_key, id.clone())),
            OrderLookup::ClientId(id) => params.push((client_key, id.clone())),
        }
        params
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceClient {
    #[instrument(skip(self, request), fields(symbol = %request.symbol, client_order_id = %request.client_order_id))]
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderSnapshot, ExchangeError> {
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", request.kind.wire_type().as_param().to_string()),
            ("quantity", request.quantity.normalize().to_string()),
        ];
        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        if request.kind.is_conditional() {
            let trigger = request.trigger_price.ok_or_else(|| ExchangeError::Rejected {
                code: 0,
                message: "conditional order without trigger price".to_string(),
            })?;
            params.push(("algoType", "CONDITIONAL".to_string()));
            params.push(("triggerPrice", trigger.normalize().to_string()));
            params.push(("workingType", "MARK_PRICE".to_string()));
            params.push(("clientAlgoId", request.client_order_id.clone()));

            debug!(?request, "Placing conditional order");
            let response: AlgoOrderResponse =
                self.signed(Method::POST, "/fapi/v1/algoOrder", params).await?;
            return Ok(response.into());
        }

        if let Some(price) = request.price {
            params.push(("price", price.normalize().to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }
        params.push(("newClientOrderId", request.client_order_id.clone()));
        params.push(("newOrderRespType", "RESULT".to_string()));

        debug!(?request, "Placing order");
        let response: OrderResponse = self.signed(Method::POST, "/fapi/v1/order", params).await?;
        Ok(response.into())
    }

    #[instrument(skip(self))]
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let params = vec![("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        let response: OrderResponse = self.signed(Method::DELETE, "/fapi/v1/order", params).await?;
        Ok(response.into())
    }

    #[instrument(skip(self))]
    async fn cancel_algo_order(
        &self,
        symbol: &str,
        algo_id: &str,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let params = vec![("symbol", symbol.to_string()), ("algoId", algo_id.to_string())];
        let response: AlgoOrderResponse = self
            .signed(Method::DELETE, "/fapi/v1/algoOrder", params)
            .await?;
        Ok(response.into())
    }

    #[instrument(skip(self))]
    async fn get_order(
        &self,
        symbol: &str,
        lookup: &OrderLookup,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let params = Self::lookup_params(symbol, lookup, "orderId", "origClientOrderId");
        let response: OrderResponse = self.signed(Method::GET, "/fapi/v1/order", params).await?;
        Ok(response.into())
    }

    #[instrument(skip(self))]
    async fn get_algo_order(
        &self,
        symbol: &str,
        lookup: &OrderLookup,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let params = Self::lookup_params(symbol, lookup, "algoId", "clientAlgoId");
        let response: AlgoOrderResponse = self
            .signed(Method::GET, "/fapi/v1/algoOrder", params)
            .await?;
        Ok(response.into())
    }

    #[instrument(skip(self))]
    async fn get_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PositionInfo>, ExchangeError> {
        let params = symbol
            .map(|s| vec![("symbol", s.to_string())])
            .unwrap_or_default();
        let positions: Vec<PositionRisk> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", params)
            .await?;

        Ok(positions
            .into_iter()
            .map(PositionInfo::from)
            .filter(|p| !p.quantity.is_zero())
            .collect())
    }

    #[instrument(skip(self))]
    async fn set_margin_type(
        &self,
        symbol: &str,
        margin_type: MarginType,
    ) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("marginType", margin_type.as_param().to_string()),
        ];
        let _: serde_json::Value = self
            .signed(Method::POST, "/fapi/v1/marginType", params)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        let info: FuturesExchangeInfo = self.public("/fapi/v1/exchangeInfo").await?;
        let entry = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| ExchangeError::Rejected {
                code: -1121,
                message: format!("Invalid symbol: {symbol}"),
            })?;

        if entry.status != "TRADING" {
            warn!(%symbol, status = %entry.status, "Symbol is not in TRADING status");
        }

        SymbolFilters::from_raw(symbol, &entry.filters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> BinanceClient {
        let config = BinanceConfig {
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            testnet: true,
            base_url: Some(server.uri()),
        };
        BinanceClient::new(&config, Duration::from_secs(5)).unwrap()
    }

    fn market_request() -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            quantity: dec!(0.010),
            price: None,
            trigger_price: None,
            reduce_only: false,
            client_order_id: "os-alpha-1-E".to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_client_id_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"code": -4116, "msg": "ClientOrderId is duplicated."})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .create_order(&market_request())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::DuplicateClientOrderId(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_ambiguous() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .create_order(&market_request())
            .await
            .unwrap_err();
        assert!(err.is_ambiguous());
    }

    #[tokio::test]
    async fn test_conditional_cancel_uses_algo_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/fapi/v1/algoOrder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "algoId": 3001,
                "clientAlgoId": "os-alpha-1-SL",
                "symbol": "BTCUSDT",
                "side": "SELL",
                "orderType": "STOP_MARKET",
                "algoStatus": "CANCELED",
                "quantity": "0.010",
                "triggerPrice": "49000"
            })))
            .mount(&server)
            .await;

        let snapshot = client_for(&server)
            .cancel_algo_order("BTCUSDT", "3001")
            .await
            .unwrap();
        assert_eq!(snapshot.state, ExchangeOrderState::Cancelled);
        assert_eq!(snapshot.exchange_order_id, "3001");
    }

    #[tokio::test]
    async fn test_margin_blocked_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/marginType"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": -4047,
                "msg": "Margin type cannot be changed if there exists open orders."
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .set_margin_type("BTCUSDT", MarginType::Isolated)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::MarginChangeBlocked(_)));
    }

    #[tokio::test]
    async fn test_symbol_filters_from_exchange_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/exchangeInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "symbols": [{
                    "symbol": "DOGEUSDT",
                    "status": "TRADING",
                    "filters": [
                        {"filterType": "PRICE_FILTER", "tickSize": "0.000010"},
                        {"filterType": "LOT_SIZE", "stepSize": "1", "minQty": "1", "maxQty": "10000000"},
                        {"filterType": "MIN_NOTIONAL", "notional": "5"}
                    ]
                }]
            })))
            .mount(&server)
            .await;

        let filters = client_for(&server)
            .get_symbol_filters("DOGEUSDT")
            .await
            .unwrap();
        assert_eq!(filters.min_notional, dec!(5));
        assert_eq!(filters.step_size, dec!(1));
    }
}
