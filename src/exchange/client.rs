//! Binance REST API client.

use crate::config::BinanceConfig;
use crate::exchange::error::VenueError;
use crate::exchange::traits::{MarginVenue, VenueResult};
use crate::exchange::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";
const SPOT_BASE_URL: &str = "https://api.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";

/// Pause between attempts of a retried GET.
const RETRY_DELAY: Duration = Duration::from_millis(1500);

const FUTURES_ACCOUNT: &str = "/fapi/v2/account";
const POSITION_MARGIN: &str = "/fapi/v1/positionMargin";
const SPOT_ACCOUNT: &str = "/api/v3/account";
const FLEXIBLE_POSITION: &str = "/sapi/v1/simple-earn/flexible/position";
const FLEXIBLE_REDEEM: &str = "/sapi/v1/simple-earn/flexible/redeem";
const LOAN_ONGOING_ORDERS: &str = "/sapi/v2/loan/flexible/ongoing/orders";
const LOAN_BORROW: &str = "/sapi/v2/loan/flexible/borrow";
const FUTURES_TRANSFER: &str = "/sapi/v1/futures/transfer";

#[derive(Debug, Clone, Copy)]
enum Api {
    Futures,
    Spot,
}

/// Binance API client covering the futures, spot, earn and loan endpoints
/// the shield needs.
pub struct BinanceClient {
    http: Client,
    api_key: String,
    secret_key: String,
    futures_base_url: String,
    spot_base_url: String,
    recv_window_ms: u64,
    get_attempts: u32,
}

impl BinanceClient {
    /// Create a new Binance client from configuration.
    pub fn new(config: &BinanceConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let (default_futures, default_spot) = if config.testnet {
            (FUTURES_TESTNET_URL, SPOT_TESTNET_URL)
        } else {
            (FUTURES_BASE_URL, SPOT_BASE_URL)
        };

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            futures_base_url: config
                .futures_base_url
                .clone()
                .unwrap_or_else(|| default_futures.to_string()),
            spot_base_url: config
                .spot_base_url
                .clone()
                .unwrap_or_else(|| default_spot.to_string()),
            recv_window_ms: config.recv_window_ms,
            get_attempts: config.get_attempts.max(1),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn base_url(&self, api: Api) -> &str {
        match api {
            Api::Futures => &self.futures_base_url,
            Api::Spot => &self.spot_base_url,
        }
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let mut query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "recvWindow={}&timestamp={}",
            self.recv_window_ms,
            Self::timestamp()
        ));

        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    /// Send a signed request and decode the response body.
    ///
    /// GET requests are retried on transport failures up to `get_attempts`;
    /// mutations are sent exactly once.
    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        api: Api,
        endpoint: &'static str,
        params: &[(&str, String)],
    ) -> VenueResult<T> {
        let attempts = if method == Method::GET {
            self.get_attempts
        } else {
            1
        };

        let mut attempt = 1;
        loop {
            // Timestamp is part of the signature, so re-sign every attempt.
            let url = format!(
                "{}{}?{}",
                self.base_url(api),
                endpoint,
                self.signed_query(params)
            );

            let result = self
                .http
                .request(method.clone(), &url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) if attempt < attempts => {
                    warn!(endpoint, attempt, error = %e, "Request failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
                Err(e) => return Err(VenueError::transport(endpoint, e)),
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| VenueError::transport(endpoint, e))?;

            if !status.is_success() {
                let parsed = serde_json::from_str::<ApiErrorBody>(&body).ok();
                return Err(VenueError::Api {
                    endpoint,
                    status: status.as_u16(),
                    code: parsed.as_ref().map(|b| b.code),
                    message: parsed.map(|b| b.msg).unwrap_or(body),
                });
            }

            debug!(endpoint, %status, "Signed request completed");

            return serde_json::from_str(&body)
                .map_err(|source| VenueError::Decode { endpoint, source });
        }
    }
}

fn amount_param(amount: Decimal) -> String {
    amount.normalize().to_string()
}

#[async_trait]
impl MarginVenue for BinanceClient {
    #[instrument(skip(self))]
    async fn get_positions(&self) -> VenueResult<Vec<Position>> {
        let account: FuturesAccount = self
            .signed_request(Method::GET, Api::Futures, FUTURES_ACCOUNT, &[])
            .await?;
        Ok(account.positions)
    }

    #[instrument(skip(self))]
    async fn get_liquid_balance(&self, asset: &str) -> VenueResult<Decimal> {
        let account: SpotAccount = self
            .signed_request(
                Method::GET,
                Api::Spot,
                SPOT_ACCOUNT,
                &[("omitZeroBalances", "true".to_string())],
            )
            .await?;
        Ok(account.free(asset))
    }

    #[instrument(skip(self))]
    async fn get_redeemable_position(
        &self,
        asset: &str,
        product_id: &str,
    ) -> VenueResult<Option<RedeemablePosition>> {
        let page: Page<RedeemablePosition> = self
            .signed_request(
                Method::GET,
                Api::Spot,
                FLEXIBLE_POSITION,
                &[
                    ("asset", asset.to_string()),
                    ("productId", product_id.to_string()),
                ],
            )
            .await?;
        Ok(page.rows.into_iter().find(|row| row.product_id == product_id))
    }

    #[instrument(skip(self))]
    async fn redeem_redeemable(
        &self,
        product_id: &str,
        amount: Decimal,
        destination: AccountType,
    ) -> VenueResult<()> {
        let response: RedeemResponse = self
            .signed_request(
                Method::POST,
                Api::Spot,
                FLEXIBLE_REDEEM,
                &[
                    ("productId", product_id.to_string()),
                    ("amount", amount_param(amount)),
                    ("destAccount", destination.to_string()),
                ],
            )
            .await?;

        if !response.success {
            return Err(VenueError::Rejected {
                endpoint: FLEXIBLE_REDEEM,
                message: format!("redemption of {} {} not accepted", amount, product_id),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_loan_status(
        &self,
        collateral_asset: &str,
        loan_asset: &str,
    ) -> VenueResult<Option<LoanStatus>> {
        let page: Page<LoanStatus> = self
            .signed_request(
                Method::GET,
                Api::Spot,
                LOAN_ONGOING_ORDERS,
                &[
                    ("collateralCoin", collateral_asset.to_string()),
                    ("loanCoin", loan_asset.to_string()),
                ],
            )
            .await?;
        Ok(page.rows.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn borrow(
        &self,
        loan_asset: &str,
        amount: Decimal,
        collateral_asset: &str,
    ) -> VenueResult<()> {
        let response: BorrowResponse = self
            .signed_request(
                Method::POST,
                Api::Spot,
                LOAN_BORROW,
                &[
                    ("loanCoin", loan_asset.to_string()),
                    ("loanAmount", amount_param(amount)),
                    ("collateralCoin", collateral_asset.to_string()),
                ],
            )
            .await?;

        if response.status.eq_ignore_ascii_case("failed") {
            return Err(VenueError::Rejected {
                endpoint: LOAN_BORROW,
                message: format!("borrow of {} {} failed", response.loan_amount, loan_asset),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn transfer_between_accounts(
        &self,
        asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> VenueResult<()> {
        let response: TransferResponse = self
            .signed_request(
                Method::POST,
                Api::Spot,
                FUTURES_TRANSFER,
                &[
                    ("asset", asset.to_string()),
                    ("amount", amount_param(amount)),
                    ("type", direction.code().to_string()),
                ],
            )
            .await?;
        debug!(tran_id = response.tran_id, "Futures transfer accepted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_isolated_margin(
        &self,
        symbol: &str,
        amount: Decimal,
        direction: MarginDirection,
    ) -> VenueResult<()> {
        let response: PositionMarginResponse = self
            .signed_request(
                Method::POST,
                Api::Futures,
                POSITION_MARGIN,
                &[
                    ("symbol", symbol.to_string()),
                    ("amount", amount_param(amount)),
                    ("type", direction.code().to_string()),
                ],
            )
            .await?;

        if response.code != 200 {
            return Err(VenueError::Rejected {
                endpoint: POSITION_MARGIN,
                message: format!("code {}: {}", response.code, response.msg),
            });
        }
        Ok(())
    }
}
