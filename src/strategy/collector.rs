//! Margin collection from the capital waterfall.
//!
//! Funds for margin top-ups are gathered into the spot wallet from three
//! sources, strictly in order:
//!
//! 1. Free spot balance (no transfer needed)
//! 2. Simple Earn flexible savings, redeemed to spot
//! 3. Flexible loan against BTC collateral, bounded by the LTV ceiling
//!
//! A later source is only touched once the earlier ones are exhausted, and
//! each source gives at most what is still missing. Nothing is rolled back:
//! if a later source fails, earlier redemptions and borrows stay in spot.

use crate::config::CapitalConfig;
use crate::exchange::{AccountType, MarginVenue, VenueError, VenueResult};
use crate::utils::decimal::{floor_to_precision, non_negative, ASSET_PRECISION};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Position of a capital source in the waterfall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum CapitalTier {
    SpotBalance,
    FlexibleSavings,
    CollateralLoan,
}

impl fmt::Display for CapitalTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapitalTier::SpotBalance => write!(f, "spot balance"),
            CapitalTier::FlexibleSavings => write!(f, "flexible savings"),
            CapitalTier::CollateralLoan => write!(f, "collateral loan"),
        }
    }
}

/// Amount taken from one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TierDraw {
    pub tier: CapitalTier,
    pub amount: Decimal,
}

/// Result of a completed waterfall pass.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Collection {
    pub asset: String,
    pub required: Decimal,
    pub draws: Vec<TierDraw>,
    pub shortfall: Decimal,
}

impl Collection {
    /// Total made available in spot across all tiers.
    pub fn funded(&self) -> Decimal {
        self.draws.iter().map(|d| d.amount).sum()
    }

    pub fn fully_funded(&self) -> bool {
        self.shortfall.is_zero()
    }
}

/// A tier failed mid-waterfall.
///
/// `committed` lists what earlier tiers already moved into spot; those
/// transfers are not reversed.
#[derive(Error, Debug)]
#[error("Collecting {required} {asset} failed at {tier}: {source}")]
pub struct CollectError {
    pub asset: String,
    pub required: Decimal,
    pub tier: CapitalTier,
    pub committed: Vec<TierDraw>,
    #[source]
    pub source: VenueError,
}

/// A pool of capital that can be converted into free spot balance.
#[async_trait]
pub trait CapitalSource: Send + Sync {
    fn tier(&self) -> CapitalTier;

    /// Capacity currently available for `asset`.
    async fn available(&self, venue: &dyn MarginVenue, asset: &str) -> VenueResult<Decimal>;

    /// Make `amount` of `asset` free in spot. Only called with
    /// `0 < amount <= available`.
    async fn draw(&self, venue: &dyn MarginVenue, asset: &str, amount: Decimal) -> VenueResult<()>;
}

/// Tier 1: free spot balance. Already where it needs to be.
pub struct SpotBalance;

#[async_trait]
impl CapitalSource for SpotBalance {
    fn tier(&self) -> CapitalTier {
        CapitalTier::SpotBalance
    }

    async fn available(&self, venue: &dyn MarginVenue, asset: &str) -> VenueResult<Decimal> {
        Ok(non_negative(venue.get_liquid_balance(asset).await?))
    }

    async fn draw(&self, _venue: &dyn MarginVenue, _asset: &str, _amount: Decimal) -> VenueResult<()> {
        Ok(())
    }
}

/// Tier 2: Simple Earn flexible savings.
pub struct FlexibleSavings {
    /// Product id per asset
    products: HashMap<String, String>,
}

impl FlexibleSavings {
    pub fn new(products: HashMap<String, String>) -> Self {
        Self { products }
    }
}

#[async_trait]
impl CapitalSource for FlexibleSavings {
    fn tier(&self) -> CapitalTier {
        CapitalTier::FlexibleSavings
    }

    async fn available(&self, venue: &dyn MarginVenue, asset: &str) -> VenueResult<Decimal> {
        let Some(product_id) = self.products.get(asset) else {
            debug!(%asset, "No flexible product configured");
            return Ok(Decimal::ZERO);
        };

        match venue.get_redeemable_position(asset, product_id).await? {
            Some(position) if position.can_redeem => Ok(non_negative(position.total_amount)),
            Some(_) => {
                warn!(%asset, %product_id, "Flexible holding is not redeemable right now");
                Ok(Decimal::ZERO)
            }
            None => Ok(Decimal::ZERO),
        }
    }

    async fn draw(&self, venue: &dyn MarginVenue, asset: &str, amount: Decimal) -> VenueResult<()> {
        // available() returned zero for unconfigured assets, so draw is never reached
        let Some(product_id) = self.products.get(asset) else {
            return Ok(());
        };
        venue
            .redeem_redeemable(product_id, amount, AccountType::Spot)
            .await
    }
}

/// Tier 3: flexible loan against a fixed collateral asset.
pub struct CollateralLoan {
    collateral_asset: String,
    ltv_limit: Decimal,
}

impl CollateralLoan {
    pub fn new(collateral_asset: String, ltv_limit: Decimal) -> Self {
        Self {
            collateral_asset,
            ltv_limit,
        }
    }
}

#[async_trait]
impl CapitalSource for CollateralLoan {
    fn tier(&self) -> CapitalTier {
        CapitalTier::CollateralLoan
    }

    async fn available(&self, venue: &dyn MarginVenue, asset: &str) -> VenueResult<Decimal> {
        let Some(loan) = venue.get_loan_status(&self.collateral_asset, asset).await? else {
            warn!(
                %asset,
                collateral = %self.collateral_asset,
                "No ongoing flexible loan, cannot borrow"
            );
            return Ok(Decimal::ZERO);
        };

        if loan.current_ltv >= self.ltv_limit {
            warn!(
                %asset,
                current_ltv = %loan.current_ltv,
                ltv_limit = %self.ltv_limit,
                "Loan LTV at or above limit, not borrowing"
            );
            return Ok(Decimal::ZERO);
        }

        let Some(ltv_per_unit) = loan.ltv_per_unit() else {
            warn!(%asset, "Loan has no debt to derive LTV per unit from, not borrowing");
            return Ok(Decimal::ZERO);
        };

        // Rounded down so the post-borrow LTV stays at or under the limit.
        let available = floor_to_precision(
            (self.ltv_limit - loan.current_ltv) / ltv_per_unit,
            ASSET_PRECISION,
        );

        debug!(
            %asset,
            current_ltv = %loan.current_ltv,
            total_debt = %loan.total_debt,
            %available,
            "Loan capacity"
        );

        Ok(available)
    }

    async fn draw(&self, venue: &dyn MarginVenue, asset: &str, amount: Decimal) -> VenueResult<()> {
        venue.borrow(asset, amount, &self.collateral_asset).await
    }
}

/// Drains capital sources in priority order until a requirement is met.
pub struct MarginCollector {
    sources: Vec<Box<dyn CapitalSource>>,
}

impl MarginCollector {
    /// Create the standard three-tier waterfall.
    pub fn new(config: &CapitalConfig) -> Self {
        Self::with_sources(vec![
            Box::new(SpotBalance),
            Box::new(FlexibleSavings::new(config.earn_products.clone())),
            Box::new(CollateralLoan::new(
                config.collateral_asset.clone(),
                config.ltv_limit,
            )),
        ])
    }

    /// Create a collector over custom sources, drained in the given order.
    pub fn with_sources(sources: Vec<Box<dyn CapitalSource>>) -> Self {
        Self { sources }
    }

    /// Gather `required` of `asset` into the spot wallet.
    ///
    /// Returns the per-tier draws and the remaining shortfall;
    /// `funded() + shortfall == required` always holds.
    pub async fn collect(
        &self,
        venue: &dyn MarginVenue,
        asset: &str,
        required: Decimal,
    ) -> Result<Collection, CollectError> {
        let mut remaining = non_negative(required);
        let mut draws = Vec::new();

        for source in &self.sources {
            if remaining.is_zero() {
                break;
            }

            let tier = source.tier();
            let fail = |draws: &Vec<TierDraw>, error: VenueError| CollectError {
                asset: asset.to_string(),
                required,
                tier,
                committed: draws.clone(),
                source: error,
            };

            let available = match source.available(venue, asset).await {
                Ok(available) => available,
                Err(e) => return Err(fail(&draws, e)),
            };

            let take = remaining.min(available);
            if take <= Decimal::ZERO {
                info!(%asset, %tier, %remaining, "Source empty, moving to next tier");
                continue;
            }

            if let Err(e) = source.draw(venue, asset, take).await {
                return Err(fail(&draws, e));
            }

            remaining -= take;
            draws.push(TierDraw { tier, amount: take });

            info!(%asset, %tier, amount = %take, %remaining, "Drew margin from source");
        }

        let collection = Collection {
            asset: asset.to_string(),
            required,
            draws,
            shortfall: remaining,
        };

        if !collection.fully_funded() {
            warn!(
                %asset,
                %required,
                funded = %collection.funded(),
                shortfall = %collection.shortfall,
                "Capital waterfall exhausted"
            );
        }

        Ok(collection)
    }
}
