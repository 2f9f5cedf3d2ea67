//! In-memory venue for dry runs and tests.
//!
//! `once --dry-run` mirrors the live account into a [`MockVenue`] and runs a
//! tick against the copy.
//!
//! Simulates the spot wallet, USDⓈ-M futures wallet, isolated positions,
//! Simple Earn flexible holdings and flexible loans closely enough that a
//! patrol tick observes the effects of its own transfers.

use super::error::VenueError;
use crate::config::CapitalConfig;
use super::traits::{MarginVenue, VenueResult};
use super::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Venue operation, used for call logs and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Positions,
    LiquidBalance,
    RedeemablePosition,
    Redeem,
    LoanStatus,
    Borrow,
    Transfer,
    IsolatedMargin,
}

impl Endpoint {
    fn label(&self) -> &'static str {
        match self {
            Endpoint::Positions => "mock/positions",
            Endpoint::LiquidBalance => "mock/liquid_balance",
            Endpoint::RedeemablePosition => "mock/redeemable_position",
            Endpoint::Redeem => "mock/redeem",
            Endpoint::LoanStatus => "mock/loan_status",
            Endpoint::Borrow => "mock/borrow",
            Endpoint::Transfer => "mock/transfer",
            Endpoint::IsolatedMargin => "mock/isolated_margin",
        }
    }
}

/// A recorded call against the mock venue.
#[derive(Debug, Clone, PartialEq)]
pub enum VenueCall {
    GetPositions,
    GetLiquidBalance {
        asset: String,
    },
    GetRedeemablePosition {
        asset: String,
        product_id: String,
    },
    Redeem {
        product_id: String,
        amount: Decimal,
    },
    GetLoanStatus {
        collateral_asset: String,
        loan_asset: String,
    },
    Borrow {
        loan_asset: String,
        amount: Decimal,
    },
    Transfer {
        asset: String,
        amount: Decimal,
        direction: TransferDirection,
    },
    IsolatedMargin {
        symbol: String,
        amount: Decimal,
        direction: MarginDirection,
    },
}

impl VenueCall {
    /// Whether this call changes venue state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            VenueCall::Redeem { .. }
                | VenueCall::Borrow { .. }
                | VenueCall::Transfer { .. }
                | VenueCall::IsolatedMargin { .. }
        )
    }
}

/// Simulated account state.
#[derive(Debug, Default, Clone)]
pub struct MockVenueState {
    pub positions: Vec<Position>,
    pub spot: HashMap<String, Decimal>,
    pub futures_wallet: HashMap<String, Decimal>,
    /// Flexible holdings keyed by product id
    pub earn: HashMap<String, RedeemablePosition>,
    /// Ongoing loans keyed by (collateral, loan) coin
    pub loans: HashMap<(String, String), LoanStatus>,
    pub calls: Vec<VenueCall>,
    /// Remaining injected failures per endpoint
    failures: HashMap<Endpoint, u32>,
    /// Symbols whose isolated margin changes are rejected
    rejected_symbols: Vec<String>,
}

/// Mock venue that simulates Binance wallet and margin behaviour.
pub struct MockVenue {
    state: RwLock<MockVenueState>,
}

impl Default for MockVenue {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVenue {
    /// Create an empty venue.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MockVenueState::default()),
        }
    }

    /// Add an isolated position.
    pub fn with_position(
        mut self,
        symbol: &str,
        isolated_wallet: Decimal,
        initial_margin: Decimal,
        unrealized_pnl: Decimal,
        position_amount: Decimal,
    ) -> Self {
        self.state.get_mut().positions.push(Position {
            symbol: symbol.to_string(),
            isolated_wallet,
            initial_margin,
            unrealized_pnl,
            position_amount,
            isolated: true,
        });
        self
    }

    /// Set the free spot balance for an asset.
    pub fn with_spot_balance(mut self, asset: &str, amount: Decimal) -> Self {
        self.state.get_mut().spot.insert(asset.to_string(), amount);
        self
    }

    /// Add a flexible savings holding.
    pub fn with_earn_position(mut self, asset: &str, product_id: &str, amount: Decimal) -> Self {
        self.state.get_mut().earn.insert(
            product_id.to_string(),
            RedeemablePosition {
                product_id: product_id.to_string(),
                asset: asset.to_string(),
                total_amount: amount,
                can_redeem: true,
            },
        );
        self
    }

    /// Add an ongoing flexible loan.
    pub fn with_loan(
        mut self,
        collateral_asset: &str,
        loan_asset: &str,
        total_debt: Decimal,
        current_ltv: Decimal,
    ) -> Self {
        self.state.get_mut().loans.insert(
            (collateral_asset.to_string(), loan_asset.to_string()),
            LoanStatus {
                loan_coin: loan_asset.to_string(),
                collateral_coin: collateral_asset.to_string(),
                total_debt,
                collateral_amount: Decimal::ZERO,
                current_ltv,
            },
        );
        self
    }

    /// Copy the account state of another venue for a dry run.
    ///
    /// Reads positions and, per settlement asset, the spot balance, the
    /// configured flexible holding and the loan against the configured
    /// collateral. Only read calls are made against `source`.
    pub async fn mirror(source: &dyn MarginVenue, capital: &CapitalConfig) -> VenueResult<Self> {
        let mut state = MockVenueState {
            positions: source.get_positions().await?,
            ..MockVenueState::default()
        };

        for asset in SETTLEMENT_ASSETS {
            state
                .spot
                .insert(asset.to_string(), source.get_liquid_balance(asset).await?);

            if let Some(product_id) = capital.earn_products.get(asset) {
                if let Some(holding) = source.get_redeemable_position(asset, product_id).await? {
                    state.earn.insert(product_id.clone(), holding);
                }
            }

            let collateral = &capital.collateral_asset;
            if let Some(loan) = source.get_loan_status(collateral, asset).await? {
                state
                    .loans
                    .insert((collateral.clone(), asset.to_string()), loan);
            }
        }

        info!(
            positions = state.positions.len(),
            earn_holdings = state.earn.len(),
            loans = state.loans.len(),
            "Mirrored venue state"
        );

        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Fail the next `times` calls to `endpoint` with a timeout.
    pub async fn fail_next(&self, endpoint: Endpoint, times: u32) {
        self.state.write().await.failures.insert(endpoint, times);
    }

    /// Fail every call to `endpoint`.
    pub async fn fail_always(&self, endpoint: Endpoint) {
        self.fail_next(endpoint, u32::MAX).await;
    }

    /// Reject isolated margin changes on `symbol`.
    pub async fn reject_margin_for(&self, symbol: &str) {
        self.state
            .write()
            .await
            .rejected_symbols
            .push(symbol.to_string());
    }

    /// Snapshot of the simulated state.
    pub async fn snapshot(&self) -> MockVenueState {
        self.state.read().await.clone()
    }

    /// Calls recorded so far, in order.
    pub async fn calls(&self) -> Vec<VenueCall> {
        self.state.read().await.calls.clone()
    }

    /// Calls that changed venue state, in order.
    pub async fn mutations(&self) -> Vec<VenueCall> {
        self.calls()
            .await
            .into_iter()
            .filter(VenueCall::is_mutation)
            .collect()
    }

    /// Free spot balance for an asset.
    pub async fn spot_balance(&self, asset: &str) -> Decimal {
        self.state
            .read()
            .await
            .spot
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Futures wallet balance for an asset.
    pub async fn futures_balance(&self, asset: &str) -> Decimal {
        self.state
            .read()
            .await
            .futures_wallet
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Current state of a position.
    pub async fn position(&self, symbol: &str) -> Option<Position> {
        self.state
            .read()
            .await
            .positions
            .iter()
            .find(|p| p.symbol == symbol)
            .cloned()
    }

    /// Record the call and consume an injected failure, if any.
    fn enter(state: &mut MockVenueState, endpoint: Endpoint, call: VenueCall) -> VenueResult<()> {
        state.calls.push(call);

        if let Some(remaining) = state.failures.get_mut(&endpoint) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(VenueError::Transport {
                    endpoint: endpoint.label(),
                    message: "operation timed out".to_string(),
                    timeout: true,
                });
            }
        }
        Ok(())
    }

    fn rejected(endpoint: Endpoint, message: String) -> VenueError {
        VenueError::Rejected {
            endpoint: endpoint.label(),
            message,
        }
    }
}

fn debit(
    wallet: &mut HashMap<String, Decimal>,
    asset: &str,
    amount: Decimal,
    endpoint: Endpoint,
) -> VenueResult<()> {
    let balance = wallet.entry(asset.to_string()).or_insert(Decimal::ZERO);
    if *balance < amount {
        return Err(MockVenue::rejected(
            endpoint,
            format!("insufficient {}: have {}, need {}", asset, balance, amount),
        ));
    }
    *balance -= amount;
    Ok(())
}

fn credit(wallet: &mut HashMap<String, Decimal>, asset: &str, amount: Decimal) {
    *wallet.entry(asset.to_string()).or_insert(Decimal::ZERO) += amount;
}

#[async_trait]
impl MarginVenue for MockVenue {
    async fn get_positions(&self) -> VenueResult<Vec<Position>> {
        let mut state = self.state.write().await;
        Self::enter(&mut state, Endpoint::Positions, VenueCall::GetPositions)?;
        Ok(state.positions.clone())
    }

    async fn get_liquid_balance(&self, asset: &str) -> VenueResult<Decimal> {
        let mut state = self.state.write().await;
        Self::enter(
            &mut state,
            Endpoint::LiquidBalance,
            VenueCall::GetLiquidBalance {
                asset: asset.to_string(),
            },
        )?;
        Ok(state.spot.get(asset).copied().unwrap_or(Decimal::ZERO))
    }

    async fn get_redeemable_position(
        &self,
        asset: &str,
        product_id: &str,
    ) -> VenueResult<Option<RedeemablePosition>> {
        let mut state = self.state.write().await;
        Self::enter(
            &mut state,
            Endpoint::RedeemablePosition,
            VenueCall::GetRedeemablePosition {
                asset: asset.to_string(),
                product_id: product_id.to_string(),
            },
        )?;
        Ok(state
            .earn
            .get(product_id)
            .filter(|p| p.asset == asset)
            .cloned())
    }

    async fn redeem_redeemable(
        &self,
        product_id: &str,
        amount: Decimal,
        destination: AccountType,
    ) -> VenueResult<()> {
        let mut state = self.state.write().await;
        Self::enter(
            &mut state,
            Endpoint::Redeem,
            VenueCall::Redeem {
                product_id: product_id.to_string(),
                amount,
            },
        )?;

        let holding = state
            .earn
            .get_mut(product_id)
            .ok_or_else(|| Self::rejected(Endpoint::Redeem, format!("no holding in {}", product_id)))?;
        if holding.total_amount < amount {
            return Err(Self::rejected(
                Endpoint::Redeem,
                format!("redeem {} exceeds holding {}", amount, holding.total_amount),
            ));
        }
        holding.total_amount -= amount;
        let asset = holding.asset.clone();

        if destination == AccountType::Spot {
            credit(&mut state.spot, &asset, amount);
        }

        debug!(%product_id, %amount, %destination, "Mock flexible redemption");
        Ok(())
    }

    async fn get_loan_status(
        &self,
        collateral_asset: &str,
        loan_asset: &str,
    ) -> VenueResult<Option<LoanStatus>> {
        let mut state = self.state.write().await;
        Self::enter(
            &mut state,
            Endpoint::LoanStatus,
            VenueCall::GetLoanStatus {
                collateral_asset: collateral_asset.to_string(),
                loan_asset: loan_asset.to_string(),
            },
        )?;
        Ok(state
            .loans
            .get(&(collateral_asset.to_string(), loan_asset.to_string()))
            .cloned())
    }

    async fn borrow(
        &self,
        loan_asset: &str,
        amount: Decimal,
        collateral_asset: &str,
    ) -> VenueResult<()> {
        let mut state = self.state.write().await;
        Self::enter(
            &mut state,
            Endpoint::Borrow,
            VenueCall::Borrow {
                loan_asset: loan_asset.to_string(),
                amount,
            },
        )?;

        let loan = state
            .loans
            .get_mut(&(collateral_asset.to_string(), loan_asset.to_string()))
            .ok_or_else(|| {
                Self::rejected(
                    Endpoint::Borrow,
                    format!("no {} loan against {}", loan_asset, collateral_asset),
                )
            })?;

        let ltv_per_unit = loan.ltv_per_unit().unwrap_or(Decimal::ZERO);
        loan.total_debt += amount;
        loan.current_ltv += amount * ltv_per_unit;
        let ltv = loan.current_ltv;

        credit(&mut state.spot, loan_asset, amount);

        info!(%loan_asset, %amount, ltv = %ltv, "Mock flexible loan borrow");
        Ok(())
    }

    async fn transfer_between_accounts(
        &self,
        asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> VenueResult<()> {
        let mut state = self.state.write().await;
        Self::enter(
            &mut state,
            Endpoint::Transfer,
            VenueCall::Transfer {
                asset: asset.to_string(),
                amount,
                direction,
            },
        )?;

        match direction {
            TransferDirection::SpotToFutures => {
                debit(&mut state.spot, asset, amount, Endpoint::Transfer)?;
                credit(&mut state.futures_wallet, asset, amount);
            }
            TransferDirection::FuturesToSpot => {
                debit(&mut state.futures_wallet, asset, amount, Endpoint::Transfer)?;
                credit(&mut state.spot, asset, amount);
            }
        }
        Ok(())
    }

    async fn set_isolated_margin(
        &self,
        symbol: &str,
        amount: Decimal,
        direction: MarginDirection,
    ) -> VenueResult<()> {
        let mut state = self.state.write().await;
        Self::enter(
            &mut state,
            Endpoint::IsolatedMargin,
            VenueCall::IsolatedMargin {
                symbol: symbol.to_string(),
                amount,
                direction,
            },
        )?;

        if state.rejected_symbols.iter().any(|s| s == symbol) {
            return Err(Self::rejected(
                Endpoint::IsolatedMargin,
                format!("margin change on {} rejected", symbol),
            ));
        }

        let index = state
            .positions
            .iter()
            .position(|p| p.symbol == symbol)
            .ok_or_else(|| {
                Self::rejected(Endpoint::IsolatedMargin, format!("no position in {}", symbol))
            })?;
        let asset = state.positions[index]
            .settlement_asset()
            .unwrap_or("USDT")
            .to_string();

        match direction {
            MarginDirection::Add => {
                debit(&mut state.futures_wallet, &asset, amount, Endpoint::IsolatedMargin)?;
                state.positions[index].isolated_wallet += amount;
            }
            MarginDirection::Reduce => {
                let slack = state.positions[index].margin_slack();
                if amount > slack {
                    return Err(Self::rejected(
                        Endpoint::IsolatedMargin,
                        format!("reduce {} exceeds removable {}", amount, slack),
                    ));
                }
                state.positions[index].isolated_wallet -= amount;
                credit(&mut state.futures_wallet, &asset, amount);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_add_margin_moves_funds_through_futures_wallet() {
        let venue = MockVenue::new()
            .with_position("BTCUSDT", dec!(100), dec!(120), dec!(0), dec!(0.01))
            .with_spot_balance("USDT", dec!(50));

        venue
            .transfer_between_accounts("USDT", dec!(30), TransferDirection::SpotToFutures)
            .await
            .unwrap();
        venue
            .set_isolated_margin("BTCUSDT", dec!(30), MarginDirection::Add)
            .await
            .unwrap();

        assert_eq!(venue.spot_balance("USDT").await, dec!(20));
        assert_eq!(venue.futures_balance("USDT").await, Decimal::ZERO);
        let pos = venue.position("BTCUSDT").await.unwrap();
        assert_eq!(pos.margin_slack(), dec!(10));
    }

    #[tokio::test]
    async fn test_transfer_rejects_overdraw() {
        let venue = MockVenue::new().with_spot_balance("USDT", dec!(10));
        let err = venue
            .transfer_between_accounts("USDT", dec!(11), TransferDirection::SpotToFutures)
            .await
            .unwrap_err();
        assert!(matches!(err, VenueError::Rejected { .. }));
        assert_eq!(venue.spot_balance("USDT").await, dec!(10));
    }

    #[tokio::test]
    async fn test_borrow_tracks_ltv() {
        let venue = MockVenue::new().with_loan("BTC", "USDT", dec!(1000), dec!(0.4));
        venue.borrow("USDT", dec!(500), "BTC").await.unwrap();

        let loan = venue.get_loan_status("BTC", "USDT").await.unwrap().unwrap();
        assert_eq!(loan.total_debt, dec!(1500));
        assert_eq!(loan.current_ltv, dec!(0.6));
        assert_eq!(venue.spot_balance("USDT").await, dec!(500));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let venue = MockVenue::new();
        venue.fail_next(Endpoint::Positions, 1).await;

        assert!(venue.get_positions().await.unwrap_err().is_transient());
        assert!(venue.get_positions().await.is_ok());
        assert_eq!(venue.calls().await.len(), 2);
        assert!(venue.mutations().await.is_empty());
    }

    #[tokio::test]
    async fn test_mirror_copies_state_with_reads_only() {
        let source = MockVenue::new()
            .with_position("BTCUSDT", dec!(100), dec!(600), dec!(0), dec!(0.1))
            .with_spot_balance("USDT", dec!(250))
            .with_earn_position("USDT", "USDT001", dec!(300))
            .with_earn_position("USDC", "USDC001", dec!(40))
            .with_loan("BTC", "USDT", dec!(1000), dec!(0.4));

        let mirrored = MockVenue::mirror(&source, &CapitalConfig::default())
            .await
            .unwrap();
        let state = mirrored.snapshot().await;

        assert_eq!(state.positions.len(), 1);
        assert_eq!(mirrored.spot_balance("USDT").await, dec!(250));
        assert_eq!(mirrored.spot_balance("USDC").await, Decimal::ZERO);
        // only products in the capital config are copied
        assert!(state.earn.contains_key("USDT001"));
        assert!(!state.earn.contains_key("USDC001"));
        assert!(state
            .loans
            .contains_key(&("BTC".to_string(), "USDT".to_string())));
        assert!(state.calls.is_empty());
        assert!(source.mutations().await.is_empty());
    }

    #[tokio::test]
    async fn test_mirror_fails_with_source() {
        let source = MockVenue::new();
        source.fail_next(Endpoint::LoanStatus, 1).await;

        let err = MockVenue::mirror(&source, &CapitalConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.endpoint(), "mock/loan_status");
    }
}
