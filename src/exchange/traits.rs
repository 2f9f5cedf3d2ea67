//! Venue-agnostic interface consumed by the margin engine.
//!
//! Every remote read and mutation the shield performs goes through
//! [`MarginVenue`], so the scanner, collector, adjuster and patrol loop can
//! run against the live Binance client or an in-memory venue alike.

use crate::exchange::error::VenueError;
use crate::exchange::types::{
    AccountType, LoanStatus, MarginDirection, Position, RedeemablePosition, TransferDirection,
};
use async_trait::async_trait;
use rust_decimal::Decimal;

pub type VenueResult<T> = std::result::Result<T, VenueError>;

/// Typed remote calls against a margin trading venue.
///
/// Calls are awaited one at a time by the patrol loop; implementations do not
/// need to be reentrant across a tick, only `Send + Sync` to live in a task.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarginVenue: Send + Sync {
    /// All futures positions, including flat ones.
    async fn get_positions(&self) -> VenueResult<Vec<Position>>;

    /// Free spot balance for `asset` (zero when the venue omits it).
    async fn get_liquid_balance(&self, asset: &str) -> VenueResult<Decimal>;

    /// Flexible savings holding for `asset` under `product_id`, if any.
    async fn get_redeemable_position(
        &self,
        asset: &str,
        product_id: &str,
    ) -> VenueResult<Option<RedeemablePosition>>;

    /// Redeem `amount` of a flexible product into `destination`.
    ///
    /// Rate-limited upstream to one call every three seconds per account.
    async fn redeem_redeemable(
        &self,
        product_id: &str,
        amount: Decimal,
        destination: AccountType,
    ) -> VenueResult<()>;

    /// Ongoing flexible loan of `loan_asset` against `collateral_asset`, if any.
    async fn get_loan_status(
        &self,
        collateral_asset: &str,
        loan_asset: &str,
    ) -> VenueResult<Option<LoanStatus>>;

    /// Borrow `amount` of `loan_asset` against `collateral_asset` into spot.
    async fn borrow(
        &self,
        loan_asset: &str,
        amount: Decimal,
        collateral_asset: &str,
    ) -> VenueResult<()>;

    /// Move `amount` of `asset` between the spot and USDⓈ-M futures wallets.
    async fn transfer_between_accounts(
        &self,
        asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> VenueResult<()>;

    /// Add or remove isolated margin on `symbol`.
    async fn set_isolated_margin(
        &self,
        symbol: &str,
        amount: Decimal,
        direction: MarginDirection,
    ) -> VenueResult<()>;
}
