// =============================================================================
// Binance USDⓈ-M Futures REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the service and Binance servers.
//
// Conditional (SL/TP) orders go through the algo-order endpoints; plain
// MARKET orders and cancellations use the classic order endpoints. Both
// channels are exposed separately on the port so cleanup can cancel each
// order via the channel it came from.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::debug;
use uuid::Uuid;

use crate::error::VenueError;
use crate::types::Direction;

use super::{
    ConditionalKind, ExchangeInfo, OpenOrder, OrderAck, OrderBook, OrderChannel, OrderStatus,
    PositionInfo, SymbolFilters, VenueClient, VenueResult, WorkingType,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const MAINNET_URL: &str = "https://fapi.binance.com";
const TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Binance futures REST client for a single user account.
#[derive(Clone)]
pub struct BinanceFutures {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceFutures {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in query params).
    /// * `secret`  — secret key used exclusively for HMAC signing.
    /// * `testnet` — route requests to the futures testnet host.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build reqwest client");

        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL }.to_string();
        debug!(base_url = %base_url, "BinanceFutures client initialised");

        Self {
            secret: secret.into(),
            base_url,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
        signed: bool,
    ) -> VenueResult<serde_json::Value> {
        let qs = if signed {
            self.signed_query(params)
        } else {
            params.to_string()
        };

        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, qs)
        };

        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| VenueError::from_http(&e))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VenueError::transient(format!("malformed venue response: {e}")))?;

        if !status.is_success() {
            let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
            let msg = body.get("msg").and_then(|v| v.as_str()).unwrap_or("");
            return Err(VenueError::from_binance(status.as_u16(), code, msg));
        }

        Ok(body)
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn json_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }

    fn parse_book_side(val: &serde_json::Value) -> Vec<(f64, f64)> {
        val.as_array()
            .map(|levels| {
                levels
                    .iter()
                    .filter_map(|l| {
                        let arr = l.as_array()?;
                        Some((Self::json_f64(arr.first()?), Self::json_f64(arr.get(1)?)))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parse_open_order(o: &serde_json::Value, channel: OrderChannel) -> OpenOrder {
        let id_key = match channel {
            OrderChannel::Classic => "orderId",
            OrderChannel::Algo => "algoId",
        };
        let order_type = o
            .get("algoType")
            .and_then(|v| v.as_str())
            .filter(|t| *t != "CONDITIONAL")
            .or_else(|| o.get("type").and_then(|v| v.as_str()))
            .unwrap_or("")
            .to_string();

        OpenOrder {
            id: o.get(id_key).and_then(|v| v.as_u64()).unwrap_or(0),
            order_type,
            trigger_price: o
                .get("stopPrice")
                .or_else(|| o.get("triggerPrice"))
                .map(Self::json_f64)
                .filter(|p| *p > 0.0),
            channel,
        }
    }
}

#[async_trait]
impl VenueClient for BinanceFutures {
    async fn mark_price(&self, symbol: &str) -> VenueResult<f64> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/premiumIndex",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;
        Ok(Self::json_f64(&body["markPrice"]))
    }

    async fn order_book(&self, symbol: &str, depth: u32) -> VenueResult<OrderBook> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/depth",
                &format!("symbol={symbol}&limit={depth}"),
                false,
            )
            .await?;
        Ok(OrderBook {
            bids: Self::parse_book_side(&body["bids"]),
            asks: Self::parse_book_side(&body["asks"]),
        })
    }

    async fn exchange_info(&self) -> VenueResult<ExchangeInfo> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/exchangeInfo", "", false)
            .await?;

        let mut info = ExchangeInfo::default();
        let symbols = body["symbols"].as_array().cloned().unwrap_or_default();
        for s in &symbols {
            let Some(sym) = s.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            let mut filters = SymbolFilters {
                tick_size: 0.0,
                step_size: 0.0,
                min_qty: 0.0,
                min_notional: 0.0,
                min_price: 0.0,
                max_price: f64::MAX,
            };
            for f in s["filters"].as_array().map(|a| a.as_slice()).unwrap_or(&[]) {
                match f.get("filterType").and_then(|v| v.as_str()) {
                    Some("PRICE_FILTER") => {
                        filters.tick_size = Self::json_f64(&f["tickSize"]);
                        filters.min_price = Self::json_f64(&f["minPrice"]);
                        let max = Self::json_f64(&f["maxPrice"]);
                        if max > 0.0 {
                            filters.max_price = max;
                        }
                    }
                    Some("LOT_SIZE") => {
                        filters.step_size = Self::json_f64(&f["stepSize"]);
                        filters.min_qty = Self::json_f64(&f["minQty"]);
                    }
                    Some("MIN_NOTIONAL") => {
                        filters.min_notional = Self::json_f64(&f["notional"]);
                    }
                    _ => {}
                }
            }
            info.symbols.insert(sym.to_string(), filters);
        }

        debug!(count = info.symbols.len(), "exchange info fetched");
        Ok(info)
    }

    async fn leverage_bracket(&self, symbol: &str) -> VenueResult<u32> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/leverageBracket",
                &format!("symbol={symbol}"),
                true,
            )
            .await?;

        // Response is a one-element array for a single symbol; the first
        // bracket carries the highest initial leverage.
        let bracket = body
            .as_array()
            .and_then(|a| a.first())
            .map(|v| &v["brackets"])
            .and_then(|b| b.as_array())
            .and_then(|a| a.first())
            .and_then(|b| b.get("initialLeverage"))
            .and_then(|v| v.as_u64());

        bracket.map(|l| l as u32).ok_or_else(|| {
            VenueError::transient(format!("leverage bracket missing for {symbol}"))
        })
    }

    async fn account_usdt_free(&self) -> VenueResult<f64> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v2/balance", "", true)
            .await?;

        let free = body
            .as_array()
            .and_then(|assets| {
                assets
                    .iter()
                    .find(|a| a.get("asset").and_then(|v| v.as_str()) == Some("USDT"))
            })
            .map(|a| Self::json_f64(&a["availableBalance"]))
            .unwrap_or(0.0);

        Ok(free)
    }

    async fn positions(&self, symbol: Option<&str>) -> VenueResult<Vec<PositionInfo>> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let body = self
            .request(reqwest::Method::GET, "/fapi/v2/positionRisk", &params, true)
            .await?;

        let positions = body
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|p| PositionInfo {
                        symbol: p
                            .get("symbol")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        position_amt: Self::json_f64(&p["positionAmt"]),
                        entry_price: Self::json_f64(&p["entryPrice"]),
                        unrealized_pnl: Self::json_f64(&p["unRealizedProfit"]),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(positions)
    }

    async fn open_orders(&self, symbol: &str) -> VenueResult<Vec<OpenOrder>> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/openOrders",
                &format!("symbol={symbol}"),
                true,
            )
            .await?;

        Ok(body
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|o| Self::parse_open_order(o, OrderChannel::Classic))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn open_conditional_orders(&self, symbol: &str) -> VenueResult<Vec<OpenOrder>> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/openAlgoOrders",
                &format!("symbol={symbol}"),
                true,
            )
            .await?;

        // Either `{"openOrders": [...]}` or a bare list depending on the
        // API revision.
        let orders = body
            .get("openOrders")
            .and_then(|v| v.as_array())
            .cloned()
            .or_else(|| body.as_array().cloned())
            .unwrap_or_default();

        Ok(orders
            .iter()
            .map(|o| Self::parse_open_order(o, OrderChannel::Algo))
            .collect())
    }

    async fn create_market(
        &self,
        symbol: &str,
        side: Direction,
        quantity: Option<f64>,
        reduce_only: bool,
        close_position: bool,
    ) -> VenueResult<OrderAck> {
        let client_id = Uuid::new_v4().simple().to_string();
        let mut params = format!(
            "symbol={symbol}&side={}&type=MARKET&newClientOrderId=x-{client_id}",
            side.as_str()
        );
        if close_position {
            params.push_str("&closePosition=true");
        } else if let Some(qty) = quantity {
            params.push_str(&format!("&quantity={qty}"));
        }
        if reduce_only && !close_position {
            params.push_str("&reduceOnly=true");
        }

        let body = self
            .request(reqwest::Method::POST, "/fapi/v1/order", &params, true)
            .await?;

        debug!(symbol, side = %side, quantity, close_position, "market order placed");
        Ok(OrderAck {
            order_id: body["orderId"].as_u64().unwrap_or(0),
        })
    }

    async fn create_conditional(
        &self,
        symbol: &str,
        side: Direction,
        kind: ConditionalKind,
        trigger_price: f64,
        working_type: WorkingType,
    ) -> VenueResult<OrderAck> {
        let params = format!(
            "symbol={symbol}&side={}&algoType=CONDITIONAL&type={}&triggerPrice={trigger_price}&closePosition=true&workingType={}",
            side.as_str(),
            kind.as_str(),
            working_type.as_str()
        );

        let body = self
            .request(reqwest::Method::POST, "/fapi/v1/algoOrder", &params, true)
            .await?;

        debug!(symbol, kind = kind.as_str(), trigger_price, "conditional order placed");
        Ok(OrderAck {
            order_id: body
                .get("algoId")
                .or_else(|| body.get("orderId"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> VenueResult<()> {
        self.request(
            reqwest::Method::DELETE,
            "/fapi/v1/order",
            &format!("symbol={symbol}&orderId={order_id}"),
            true,
        )
        .await?;
        Ok(())
    }

    async fn cancel_conditional(&self, symbol: &str, algo_id: u64) -> VenueResult<()> {
        self.request(
            reqwest::Method::DELETE,
            "/fapi/v1/algoOrder",
            &format!("symbol={symbol}&algoId={algo_id}"),
            true,
        )
        .await?;
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> VenueResult<()> {
        self.request(
            reqwest::Method::POST,
            "/fapi/v1/leverage",
            &format!("symbol={symbol}&leverage={leverage}"),
            true,
        )
        .await?;
        Ok(())
    }

    async fn get_order(&self, symbol: &str, order_id: u64) -> VenueResult<OrderStatus> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/order",
                &format!("symbol={symbol}&orderId={order_id}"),
                true,
            )
            .await?;

        Ok(OrderStatus::parse(
            body.get("status").and_then(|v| v.as_str()).unwrap_or(""),
        ))
    }
}

impl std::fmt::Debug for BinanceFutures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFutures")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testnet_toggle_selects_host() {
        let live = BinanceFutures::new("k", "s", false);
        let test = BinanceFutures::new("k", "s", true);
        assert!(format!("{live:?}").contains("fapi.binance.com"));
        assert!(format!("{test:?}").contains("testnet.binancefuture.com"));
    }

    #[test]
    fn debug_never_exposes_the_secret() {
        let c = BinanceFutures::new("key", "supersecret", false);
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("supersecret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let c = BinanceFutures::new("k", "secret", false);
        let sig = c.sign("symbol=BTCUSDT&timestamp=1000");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, c.sign("symbol=BTCUSDT&timestamp=1000"));
        assert!(sig.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn parse_open_order_reads_both_channels() {
        let classic = serde_json::json!({
            "orderId": 42, "type": "STOP_MARKET", "stopPrice": "49500.0"
        });
        let o = BinanceFutures::parse_open_order(&classic, OrderChannel::Classic);
        assert_eq!(o.id, 42);
        assert!(o.is_stop());
        assert_eq!(o.trigger_price, Some(49500.0));

        let algo = serde_json::json!({
            "algoId": 7, "algoType": "CONDITIONAL", "type": "TAKE_PROFIT_MARKET",
            "triggerPrice": "51010.0"
        });
        let o = BinanceFutures::parse_open_order(&algo, OrderChannel::Algo);
        assert_eq!(o.id, 7);
        assert!(o.is_take_profit());
        assert_eq!(o.channel, OrderChannel::Algo);
    }
}
