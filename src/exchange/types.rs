//! Type definitions for Binance API responses and venue-level records.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Quote currencies that settle USDⓈ-M isolated margin.
pub const SETTLEMENT_ASSETS: [&str; 2] = ["USDT", "USDC"];

/// Futures position as reported by `/fapi/v2/account`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub isolated_wallet: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub initial_margin: Decimal,
    #[serde(rename = "unrealizedProfit", with = "rust_decimal::serde::str")]
    pub unrealized_pnl: Decimal,
    #[serde(rename = "positionAmt", with = "rust_decimal::serde::str")]
    pub position_amount: Decimal,
    /// False for cross-margin positions
    #[serde(default = "default_isolated")]
    pub isolated: bool,
}

fn default_isolated() -> bool {
    true
}

impl Position {
    /// Surplus (positive) or deficit (negative) of isolated margin.
    ///
    /// `isolated_wallet - initial_margin + unrealized_pnl`
    pub fn margin_slack(&self) -> Decimal {
        self.isolated_wallet - self.initial_margin + self.unrealized_pnl
    }

    /// Whether the position carries any size.
    pub fn is_open(&self) -> bool {
        !self.position_amount.is_zero()
    }

    /// Asset the position's isolated margin is denominated in.
    pub fn settlement_asset(&self) -> Option<&'static str> {
        SETTLEMENT_ASSETS
            .iter()
            .copied()
            .find(|quote| self.symbol.ends_with(quote) && self.symbol.len() > quote.len())
    }
}

/// Futures account snapshot (`/fapi/v2/account`); only positions are consumed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesAccount {
    pub positions: Vec<Position>,
}

/// Spot account snapshot (`/api/v3/account`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotAccount {
    pub balances: Vec<SpotBalance>,
}

impl SpotAccount {
    /// Free balance for an asset, zero if the venue omitted it.
    pub fn free(&self, asset: &str) -> Decimal {
        self.balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotBalance {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub free: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub locked: Decimal,
}

/// Paginated `{ rows, total }` envelope used by the SAPI earn and loan endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub rows: Vec<T>,
    #[serde(default)]
    pub total: u64,
}

/// Simple Earn flexible product holding.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemablePosition {
    pub product_id: String,
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount: Decimal,
    #[serde(default = "default_can_redeem")]
    pub can_redeem: bool,
}

fn default_can_redeem() -> bool {
    true
}

/// Ongoing flexible loan for a (loan coin, collateral coin) pair.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanStatus {
    pub loan_coin: String,
    pub collateral_coin: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_debt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub collateral_amount: Decimal,
    #[serde(rename = "currentLTV", with = "rust_decimal::serde::str")]
    pub current_ltv: Decimal,
}

impl LoanStatus {
    /// LTV added per unit of debt, derived from the current loan.
    ///
    /// `None` when there is no debt to derive it from.
    pub fn ltv_per_unit(&self) -> Option<Decimal> {
        if self.total_debt <= Decimal::ZERO || self.current_ltv <= Decimal::ZERO {
            return None;
        }
        Some(self.current_ltv / self.total_debt)
    }
}

/// Acknowledgement from `/sapi/v1/simple-earn/flexible/redeem`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemResponse {
    #[serde(default)]
    pub redeem_id: Option<u64>,
    pub success: bool,
}

/// Acknowledgement from `/sapi/v2/loan/flexible/borrow`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowResponse {
    pub loan_coin: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub loan_amount: Decimal,
    pub status: String,
}

/// Acknowledgement from `/sapi/v1/futures/transfer`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub tran_id: u64,
}

/// Acknowledgement from `/fapi/v1/positionMargin`.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionMarginResponse {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

/// Error body returned by Binance on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

/// Direction of a spot ⇄ USDⓈ-M futures wallet transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferDirection {
    SpotToFutures,
    FuturesToSpot,
}

impl TransferDirection {
    /// Binance `type` parameter for `/sapi/v1/futures/transfer`.
    pub fn code(&self) -> u8 {
        match self {
            TransferDirection::SpotToFutures => 1,
            TransferDirection::FuturesToSpot => 2,
        }
    }
}

/// Whether isolated margin is being added to or removed from a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarginDirection {
    Add,
    Reduce,
}

impl MarginDirection {
    /// Binance `type` parameter for `/fapi/v1/positionMargin`.
    pub fn code(&self) -> u8 {
        match self {
            MarginDirection::Add => 1,
            MarginDirection::Reduce => 2,
        }
    }
}

/// Destination wallet for earn redemptions. Margin is only ever collected in spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountType {
    Spot,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Spot => "SPOT",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(symbol: &str, wallet: Decimal, initial: Decimal, pnl: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            isolated_wallet: wallet,
            initial_margin: initial,
            unrealized_pnl: pnl,
            position_amount: dec!(1),
            isolated: true,
        }
    }

    #[test]
    fn test_margin_slack() {
        let pos = position("BTCUSDT", dec!(120), dec!(100), dec!(-35));
        assert_eq!(pos.margin_slack(), dec!(-15));
    }

    #[test]
    fn test_settlement_asset_from_quote() {
        assert_eq!(position("ETHUSDT", dec!(0), dec!(0), dec!(0)).settlement_asset(), Some("USDT"));
        assert_eq!(position("ETHUSDC", dec!(0), dec!(0), dec!(0)).settlement_asset(), Some("USDC"));
        assert_eq!(position("ETHBTC", dec!(0), dec!(0), dec!(0)).settlement_asset(), None);
        assert_eq!(position("USDT", dec!(0), dec!(0), dec!(0)).settlement_asset(), None);
    }

    #[test]
    fn test_decode_futures_account() {
        let body = r#"{
            "totalWalletBalance": "1000.0",
            "positions": [
                {
                    "symbol": "BTCUSDT",
                    "initialMargin": "520.1",
                    "maintMargin": "20.8",
                    "unrealizedProfit": "-30.5",
                    "isolatedWallet": "510.0",
                    "positionAmt": "0.020",
                    "isolated": true,
                    "leverage": "5"
                },
                {
                    "symbol": "ETHUSDT",
                    "initialMargin": "0",
                    "unrealizedProfit": "0.00000000",
                    "isolatedWallet": "0",
                    "positionAmt": "0.000",
                    "isolated": false
                }
            ]
        }"#;

        let account: FuturesAccount = serde_json::from_str(body).unwrap();
        assert_eq!(account.positions.len(), 2);

        let btc = &account.positions[0];
        assert_eq!(btc.margin_slack(), dec!(-40.6));
        assert!(btc.is_open());
        assert!(btc.isolated);
        assert!(!account.positions[1].is_open());
    }

    #[test]
    fn test_decode_position_missing_field_fails() {
        let body = r#"{ "symbol": "BTCUSDT", "initialMargin": "1", "positionAmt": "1" }"#;
        assert!(serde_json::from_str::<Position>(body).is_err());
    }

    #[test]
    fn test_decode_loan_page() {
        let body = r#"{
            "rows": [{
                "loanCoin": "USDT",
                "totalDebt": "1000",
                "collateralCoin": "BTC",
                "collateralAmount": "0.05",
                "currentLTV": "0.4"
            }],
            "total": 1
        }"#;

        let page: Page<LoanStatus> = serde_json::from_str(body).unwrap();
        let loan = &page.rows[0];
        assert_eq!(loan.current_ltv, dec!(0.4));
        assert_eq!(loan.ltv_per_unit(), Some(dec!(0.0004)));
    }

    #[test]
    fn test_ltv_per_unit_without_debt() {
        let loan = LoanStatus {
            loan_coin: "USDT".to_string(),
            collateral_coin: "BTC".to_string(),
            total_debt: Decimal::ZERO,
            collateral_amount: dec!(0.05),
            current_ltv: Decimal::ZERO,
        };
        assert_eq!(loan.ltv_per_unit(), None);
    }

    #[test]
    fn test_spot_free_balance() {
        let body = r#"{ "balances": [
            { "asset": "BTC", "free": "0.1", "locked": "0" },
            { "asset": "USDT", "free": "250.5", "locked": "10" }
        ] }"#;
        let account: SpotAccount = serde_json::from_str(body).unwrap();
        assert_eq!(account.free("USDT"), dec!(250.5));
        assert_eq!(account.free("USDC"), Decimal::ZERO);
    }

    #[test]
    fn test_direction_codes() {
        assert_eq!(TransferDirection::SpotToFutures.code(), 1);
        assert_eq!(TransferDirection::FuturesToSpot.code(), 2);
        assert_eq!(MarginDirection::Add.code(), 1);
        assert_eq!(MarginDirection::Reduce.code(), 2);
        assert_eq!(AccountType::Spot.to_string(), "SPOT");
    }
}
