//! Isolated margin adjustment.
//!
//! Moves funds between the spot wallet and a position's isolated margin,
//! always through the futures wallet:
//!
//! - ADD: spot -> futures transfer, then isolated margin add
//! - REDUCE: isolated margin reduce, then futures -> spot transfer
//!
//! The two legs are not atomic. When the second leg fails the funds are left
//! in the intermediate wallet and the result is reported as stranded.

use crate::exchange::{MarginDirection, MarginVenue, TransferDirection, VenueError};
use crate::strategy::scanner::{AdjustmentDirection, AdjustmentPlan};
use rust_decimal::Decimal;
use std::fmt;
use tracing::{error, info, warn};

/// Leg of a two-step margin adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentStage {
    /// Spot <-> futures wallet transfer
    Transfer,
    /// Isolated margin add/reduce on the position
    IsolatedMargin,
}

impl fmt::Display for AdjustmentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustmentStage::Transfer => write!(f, "wallet transfer"),
            AdjustmentStage::IsolatedMargin => write!(f, "isolated margin"),
        }
    }
}

#[derive(Debug)]
pub enum AdjustmentOutcome {
    /// Both legs completed
    Applied,
    /// First leg failed, nothing moved
    Failed {
        stage: AdjustmentStage,
        error: VenueError,
    },
    /// First leg completed, second failed; funds sit in the futures wallet
    Stranded {
        stage: AdjustmentStage,
        error: VenueError,
    },
}

/// Result of one margin adjustment.
#[derive(Debug)]
pub struct AdjustmentResult {
    pub symbol: String,
    pub asset: String,
    pub direction: AdjustmentDirection,
    pub amount: Decimal,
    pub outcome: AdjustmentOutcome,
}

impl AdjustmentResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AdjustmentOutcome::Applied)
    }

    pub fn is_stranded(&self) -> bool {
        matches!(self.outcome, AdjustmentOutcome::Stranded { .. })
    }

    /// Error that stopped the adjustment, if any.
    pub fn error(&self) -> Option<&VenueError> {
        match &self.outcome {
            AdjustmentOutcome::Applied => None,
            AdjustmentOutcome::Failed { error, .. } | AdjustmentOutcome::Stranded { error, .. } => {
                Some(error)
            }
        }
    }
}

/// Applies adjustment plans against a venue.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarginAdjuster;

impl MarginAdjuster {
    pub fn new() -> Self {
        Self
    }

    /// Apply a plan at its full magnitude.
    pub async fn apply(&self, venue: &dyn MarginVenue, plan: &AdjustmentPlan) -> AdjustmentResult {
        match plan.direction {
            AdjustmentDirection::Add => {
                self.add(venue, &plan.symbol, &plan.asset, plan.magnitude)
                    .await
            }
            AdjustmentDirection::Reduce => {
                self.reduce(venue, &plan.symbol, &plan.asset, plan.magnitude)
                    .await
            }
        }
    }

    /// Move `amount` from spot into the position's isolated margin.
    ///
    /// The caller is responsible for having `amount` free in spot.
    pub async fn add(
        &self,
        venue: &dyn MarginVenue,
        symbol: &str,
        asset: &str,
        amount: Decimal,
    ) -> AdjustmentResult {
        let outcome = match venue
            .transfer_between_accounts(asset, amount, TransferDirection::SpotToFutures)
            .await
        {
            Err(e) => {
                error!(%symbol, %amount, error = %e, "Spot to futures transfer failed");
                AdjustmentOutcome::Failed {
                    stage: AdjustmentStage::Transfer,
                    error: e,
                }
            }
            Ok(()) => match venue
                .set_isolated_margin(symbol, amount, MarginDirection::Add)
                .await
            {
                Ok(()) => {
                    info!(%symbol, %asset, %amount, "Added isolated margin");
                    AdjustmentOutcome::Applied
                }
                Err(e) => {
                    warn!(
                        %symbol,
                        %asset,
                        %amount,
                        error = %e,
                        "Margin add failed after transfer, funds left in futures wallet"
                    );
                    AdjustmentOutcome::Stranded {
                        stage: AdjustmentStage::IsolatedMargin,
                        error: e,
                    }
                }
            },
        };

        AdjustmentResult {
            symbol: symbol.to_string(),
            asset: asset.to_string(),
            direction: AdjustmentDirection::Add,
            amount,
            outcome,
        }
    }

    /// Release `amount` of isolated margin back to spot.
    pub async fn reduce(
        &self,
        venue: &dyn MarginVenue,
        symbol: &str,
        asset: &str,
        amount: Decimal,
    ) -> AdjustmentResult {
        let outcome = match venue
            .set_isolated_margin(symbol, amount, MarginDirection::Reduce)
            .await
        {
            Err(e) => {
                error!(%symbol, %amount, error = %e, "Margin reduce failed");
                AdjustmentOutcome::Failed {
                    stage: AdjustmentStage::IsolatedMargin,
                    error: e,
                }
            }
            Ok(()) => match venue
                .transfer_between_accounts(asset, amount, TransferDirection::FuturesToSpot)
                .await
            {
                Ok(()) => {
                    info!(%symbol, %asset, %amount, "Reduced isolated margin");
                    AdjustmentOutcome::Applied
                }
                Err(e) => {
                    warn!(
                        %symbol,
                        %asset,
                        %amount,
                        error = %e,
                        "Futures to spot transfer failed, funds left in futures wallet"
                    );
                    AdjustmentOutcome::Stranded {
                        stage: AdjustmentStage::Transfer,
                        error: e,
                    }
                }
            },
        };

        AdjustmentResult {
            symbol: symbol.to_string(),
            asset: asset.to_string(),
            direction: AdjustmentDirection::Reduce,
            amount,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{Endpoint, MockVenue, VenueCall};
    use rust_decimal_macros::dec;

    fn plan(symbol: &str, direction: AdjustmentDirection, magnitude: Decimal) -> AdjustmentPlan {
        AdjustmentPlan {
            symbol: symbol.to_string(),
            asset: "USDT".to_string(),
            direction,
            magnitude,
        }
    }

    #[tokio::test]
    async fn test_add_transfers_before_margin() {
        let venue = MockVenue::new()
            .with_position("BTCUSDT", dec!(100), dec!(600), dec!(0), dec!(0.1))
            .with_spot_balance("USDT", dec!(499));

        let result = MarginAdjuster::new()
            .apply(&venue, &plan("BTCUSDT", AdjustmentDirection::Add, dec!(499)))
            .await;

        assert!(result.is_success());
        assert_eq!(
            venue.mutations().await,
            vec![
                VenueCall::Transfer {
                    asset: "USDT".to_string(),
                    amount: dec!(499),
                    direction: TransferDirection::SpotToFutures,
                },
                VenueCall::IsolatedMargin {
                    symbol: "BTCUSDT".to_string(),
                    amount: dec!(499),
                    direction: MarginDirection::Add,
                },
            ]
        );
        let position = venue.position("BTCUSDT").await.unwrap();
        assert_eq!(position.margin_slack(), dec!(-1));
    }

    #[tokio::test]
    async fn test_reduce_releases_margin_before_transfer() {
        let venue = MockVenue::new().with_position("ETHUSDT", dec!(200), dec!(100), dec!(-50), dec!(-2));

        let result = MarginAdjuster::new()
            .apply(&venue, &plan("ETHUSDT", AdjustmentDirection::Reduce, dec!(49)))
            .await;

        assert!(result.is_success());
        assert_eq!(
            venue.mutations().await,
            vec![
                VenueCall::IsolatedMargin {
                    symbol: "ETHUSDT".to_string(),
                    amount: dec!(49),
                    direction: MarginDirection::Reduce,
                },
                VenueCall::Transfer {
                    asset: "USDT".to_string(),
                    amount: dec!(49),
                    direction: TransferDirection::FuturesToSpot,
                },
            ]
        );
        assert_eq!(venue.spot_balance("USDT").await, dec!(49));
        assert_eq!(venue.position("ETHUSDT").await.unwrap().margin_slack(), dec!(1));
    }

    #[tokio::test]
    async fn test_add_transfer_failure_moves_nothing() {
        let venue = MockVenue::new()
            .with_position("BTCUSDT", dec!(100), dec!(600), dec!(0), dec!(0.1))
            .with_spot_balance("USDT", dec!(499));
        venue.fail_next(Endpoint::Transfer, 1).await;

        let result = MarginAdjuster::new()
            .add(&venue, "BTCUSDT", "USDT", dec!(499))
            .await;

        assert!(matches!(
            result.outcome,
            AdjustmentOutcome::Failed { stage: AdjustmentStage::Transfer, .. }
        ));
        assert_eq!(venue.spot_balance("USDT").await, dec!(499));
        assert!(!venue
            .calls()
            .await
            .iter()
            .any(|c| matches!(c, VenueCall::IsolatedMargin { .. })));
    }

    #[tokio::test]
    async fn test_add_margin_rejection_strands_funds() {
        let venue = MockVenue::new()
            .with_position("BTCUSDT", dec!(100), dec!(600), dec!(0), dec!(0.1))
            .with_spot_balance("USDT", dec!(499));
        venue.reject_margin_for("BTCUSDT").await;

        let result = MarginAdjuster::new()
            .add(&venue, "BTCUSDT", "USDT", dec!(499))
            .await;

        assert!(result.is_stranded());
        assert!(result.error().is_some());
        assert_eq!(venue.futures_balance("USDT").await, dec!(499));
        assert_eq!(venue.spot_balance("USDT").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_reduce_rejected_without_transfer() {
        let venue = MockVenue::new().with_position("ETHUSDT", dec!(200), dec!(100), dec!(-50), dec!(-2));
        venue.reject_margin_for("ETHUSDT").await;

        let result = MarginAdjuster::new()
            .reduce(&venue, "ETHUSDT", "USDT", dec!(49))
            .await;

        assert!(matches!(
            result.outcome,
            AdjustmentOutcome::Failed { stage: AdjustmentStage::IsolatedMargin, .. }
        ));
        assert_eq!(venue.mutations().await.len(), 1);
    }
}
