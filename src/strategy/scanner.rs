//! Position scanning and adjustment classification.

use crate::config::PatrolConfig;
use crate::exchange::{MarginVenue, Position, VenueResult};
use rust_decimal::Decimal;
use std::fmt;
use tracing::{debug, info, warn};

/// Whether a position needs margin added or can release some.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum AdjustmentDirection {
    Add,
    Reduce,
}

impl fmt::Display for AdjustmentDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustmentDirection::Add => write!(f, "ADD"),
            AdjustmentDirection::Reduce => write!(f, "REDUCE"),
        }
    }
}

/// Margin change planned for one position during one tick.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AdjustmentPlan {
    pub symbol: String,
    /// Settlement asset the margin is moved in
    pub asset: String,
    pub direction: AdjustmentDirection,
    /// `|slack| - buffer`, always above the adjustment threshold
    pub magnitude: Decimal,
}

/// Classify a margin slack.
///
/// Returns the direction and the buffered magnitude, or `None` when the
/// magnitude does not exceed `threshold`.
pub fn classify(
    slack: Decimal,
    buffer: Decimal,
    threshold: Decimal,
) -> Option<(AdjustmentDirection, Decimal)> {
    let direction = if slack < Decimal::ZERO {
        AdjustmentDirection::Add
    } else {
        AdjustmentDirection::Reduce
    };
    let magnitude = slack.abs() - buffer;

    if magnitude > threshold {
        Some((direction, magnitude))
    } else {
        None
    }
}

/// Reads positions and derives the adjustment plans for a tick.
pub struct PositionScanner {
    config: PatrolConfig,
}

impl PositionScanner {
    /// Create a new position scanner.
    pub fn new(config: PatrolConfig) -> Self {
        Self { config }
    }

    /// Plan for a single position, if it warrants one.
    pub fn plan_position(&self, position: &Position) -> Option<AdjustmentPlan> {
        let asset = match position.settlement_asset() {
            Some(asset) => asset,
            None => {
                warn!(symbol = %position.symbol, "Unsupported settlement asset, skipping");
                return None;
            }
        };

        let slack = position.margin_slack();
        let (direction, magnitude) = match classify(
            slack,
            self.config.buffer_amount,
            self.config.adjustment_threshold,
        ) {
            Some(classified) => classified,
            None => {
                info!(
                    symbol = %position.symbol,
                    %slack,
                    adjustable = %(slack.abs() - self.config.buffer_amount),
                    %asset,
                    threshold = %self.config.adjustment_threshold,
                    "Adjustment below threshold, leaving position untouched"
                );
                return None;
            }
        };

        debug!(
            symbol = %position.symbol,
            %slack,
            %direction,
            %magnitude,
            "Position planned for adjustment"
        );

        Some(AdjustmentPlan {
            symbol: position.symbol.clone(),
            asset: asset.to_string(),
            direction,
            magnitude,
        })
    }

    /// Derive plans from the given positions, preserving their order.
    pub fn plan(&self, positions: &[Position]) -> Vec<AdjustmentPlan> {
        positions
            .iter()
            .filter(|p| p.is_open())
            .filter(|p| {
                if !p.isolated {
                    debug!(symbol = %p.symbol, "Cross-margin position, skipping");
                }
                p.isolated
            })
            .filter_map(|p| self.plan_position(p))
            .collect()
    }

    /// Fetch positions and derive this tick's plans.
    ///
    /// A failed position query is returned as-is; no partial plan list is
    /// produced.
    pub async fn scan(&self, venue: &dyn MarginVenue) -> VenueResult<Vec<AdjustmentPlan>> {
        let positions = venue.get_positions().await?;
        let plans = self.plan(&positions);

        debug!(
            positions = positions.len(),
            plans = plans.len(),
            "Position scan complete"
        );

        Ok(plans)
    }
}
