//! Margin rebalancing engine.
//!
//! Contains the core logic for:
//! - Scanning isolated positions into ADD / REDUCE plans
//! - Collecting margin through the spot / savings / loan waterfall
//! - Moving funds between spot and isolated margin
//! - The patrol loop that sequences all of the above

mod adjuster;
mod collector;
mod patrol;
mod scanner;

pub use adjuster::{AdjustmentOutcome, AdjustmentResult, AdjustmentStage, MarginAdjuster};
pub use collector::{
    CapitalSource, CapitalTier, CollateralLoan, CollectError, Collection, FlexibleSavings,
    MarginCollector, SpotBalance, TierDraw,
};
pub use patrol::{AssetFunding, FundingStatus, PatrolLoop, PatrolPhase, TickError, TickReport};
pub use scanner::{classify, AdjustmentDirection, AdjustmentPlan, PositionScanner};
