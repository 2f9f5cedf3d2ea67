//! Patrol loop driving the scan / reduce / fund / add cycle.
//!
//! Each tick:
//! 1. Scans positions into adjustment plans
//! 2. Applies every REDUCE plan in scan order, freeing margin into spot
//! 3. Groups ADD plans by settlement asset, collects the total per asset
//!    through the capital waterfall and applies the group only when the
//!    collection is fully funded
//!
//! A failed scan aborts the tick and the loop cools down before scanning
//! again. Nothing inside a tick is retried, and no tick error stops the loop.

use crate::config::{Config, PatrolConfig};
use crate::exchange::{MarginVenue, VenueError};
use crate::strategy::adjuster::{AdjustmentResult, MarginAdjuster};
use crate::strategy::collector::{CollectError, Collection, MarginCollector};
use crate::strategy::scanner::{AdjustmentDirection, AdjustmentPlan, PositionScanner};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Where the loop currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatrolPhase {
    Idle,
    Scanning,
    ProcessingReductions,
    ProcessingAdditions,
    Sleeping,
    Cooldown,
    Stopped,
}

impl fmt::Display for PatrolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatrolPhase::Idle => "IDLE",
            PatrolPhase::Scanning => "SCANNING",
            PatrolPhase::ProcessingReductions => "PROCESSING_REDUCTIONS",
            PatrolPhase::ProcessingAdditions => "PROCESSING_ADDITIONS",
            PatrolPhase::Sleeping => "SLEEPING",
            PatrolPhase::Cooldown => "COOLDOWN",
            PatrolPhase::Stopped => "STOPPED",
        };
        write!(f, "{}", name)
    }
}

/// A tick that could not run to completion.
#[derive(Error, Debug)]
pub enum TickError {
    #[error("Position scan failed: {0}")]
    Scan(#[from] VenueError),
}

/// How the additions for one asset were funded.
#[derive(Debug)]
pub enum FundingStatus {
    /// Collection covered the full requirement; additions were attempted
    Funded(Collection),
    /// Waterfall exhausted; every addition for the asset was skipped
    Shortfall(Collection),
    /// A tier failed; additions skipped, earlier draws left in spot
    Failed(CollectError),
}

/// Additions for one settlement asset within a tick.
#[derive(Debug)]
pub struct AssetFunding {
    pub asset: String,
    pub required: Decimal,
    pub plans: Vec<AdjustmentPlan>,
    pub status: FundingStatus,
    /// Empty unless the asset was fully funded
    pub results: Vec<AdjustmentResult>,
}

impl AssetFunding {
    pub fn is_funded(&self) -> bool {
        matches!(self.status, FundingStatus::Funded(_))
    }

    pub fn shortfall(&self) -> Decimal {
        match &self.status {
            FundingStatus::Shortfall(collection) => collection.shortfall,
            _ => Decimal::ZERO,
        }
    }
}

/// Everything a tick did.
#[derive(Debug)]
pub struct TickReport {
    pub tick: u64,
    pub started_at: DateTime<Utc>,
    pub plans: Vec<AdjustmentPlan>,
    pub reductions: Vec<AdjustmentResult>,
    pub additions: Vec<AssetFunding>,
    pub elapsed: Duration,
}

impl TickReport {
    fn results(&self) -> impl Iterator<Item = &AdjustmentResult> {
        self.reductions
            .iter()
            .chain(self.additions.iter().flat_map(|a| a.results.iter()))
    }

    /// Adjustments that completed both legs.
    pub fn applied(&self) -> usize {
        self.results().filter(|r| r.is_success()).count()
    }

    /// Adjustments that did not complete.
    pub fn failed(&self) -> usize {
        self.results().filter(|r| !r.is_success()).count()
    }

    /// Adjustments whose funds were left in the futures wallet.
    pub fn stranded(&self) -> Vec<&AdjustmentResult> {
        self.results().filter(|r| r.is_stranded()).collect()
    }

    /// ADD plans skipped because their asset was not fully funded.
    pub fn skipped_additions(&self) -> usize {
        self.additions
            .iter()
            .filter(|a| !a.is_funded())
            .map(|a| a.plans.len())
            .sum()
    }

    /// Whether every planned adjustment was applied.
    pub fn is_clean(&self) -> bool {
        self.failed() == 0 && self.skipped_additions() == 0
    }
}

/// Drives the shield on a fixed cadence.
pub struct PatrolLoop {
    venue: Arc<dyn MarginVenue>,
    config: PatrolConfig,
    scanner: PositionScanner,
    collector: MarginCollector,
    adjuster: MarginAdjuster,
    phase: PatrolPhase,
    ticks: u64,
}

impl PatrolLoop {
    pub fn new(venue: Arc<dyn MarginVenue>, config: &Config) -> Self {
        Self {
            venue,
            config: config.patrol.clone(),
            scanner: PositionScanner::new(config.patrol.clone()),
            collector: MarginCollector::new(&config.capital),
            adjuster: MarginAdjuster::new(),
            phase: PatrolPhase::Idle,
            ticks: 0,
        }
    }

    pub fn phase(&self) -> PatrolPhase {
        self.phase
    }

    /// Ticks started so far, including aborted ones.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Scan without touching any balance.
    pub async fn plan(&mut self) -> Result<Vec<AdjustmentPlan>, TickError> {
        self.phase = PatrolPhase::Scanning;
        let plans = self.scanner.scan(self.venue.as_ref()).await?;
        self.phase = PatrolPhase::Idle;
        Ok(plans)
    }

    /// Run one full tick.
    pub async fn tick(&mut self) -> Result<TickReport, TickError> {
        self.ticks += 1;
        let tick = self.ticks;
        let started_at = Utc::now();
        let start = Instant::now();
        let venue = Arc::clone(&self.venue);

        self.phase = PatrolPhase::Scanning;
        info!(tick, started_at = %started_at.to_rfc3339(), "Patrol tick started");

        let plans = self.scanner.scan(venue.as_ref()).await?;

        self.phase = PatrolPhase::ProcessingReductions;
        let mut reductions = Vec::new();
        for plan in plans
            .iter()
            .filter(|p| p.direction == AdjustmentDirection::Reduce)
        {
            reductions.push(self.adjuster.apply(venue.as_ref(), plan).await);
        }

        self.phase = PatrolPhase::ProcessingAdditions;
        let mut additions = Vec::new();
        for (asset, group) in group_additions(&plans) {
            additions.push(self.fund_additions(venue.as_ref(), asset, group).await);
        }

        Ok(TickReport {
            tick,
            started_at,
            plans,
            reductions,
            additions,
            elapsed: start.elapsed(),
        })
    }

    async fn fund_additions(
        &self,
        venue: &dyn MarginVenue,
        asset: String,
        plans: Vec<AdjustmentPlan>,
    ) -> AssetFunding {
        let required: Decimal = plans.iter().map(|p| p.magnitude).sum();
        let mut results = Vec::new();

        let status = match self.collector.collect(venue, &asset, required).await {
            Ok(collection) if collection.fully_funded() => {
                for plan in &plans {
                    results.push(self.adjuster.apply(venue, plan).await);
                }
                FundingStatus::Funded(collection)
            }
            Ok(collection) => {
                warn!(
                    %asset,
                    %required,
                    funded = %collection.funded(),
                    shortfall = %collection.shortfall,
                    skipped = plans.len(),
                    "Insufficient capital, skipping additions"
                );
                FundingStatus::Shortfall(collection)
            }
            Err(e) => {
                error!(
                    %asset,
                    %required,
                    tier = %e.tier,
                    committed = ?e.committed,
                    error = %e.source,
                    "Capital collection failed, skipping additions"
                );
                FundingStatus::Failed(e)
            }
        };

        AssetFunding {
            asset,
            required,
            plans,
            status,
            results,
        }
    }

    /// Run one tick and return how long to wait before the next.
    pub async fn step(&mut self) -> Duration {
        match self.tick().await {
            Ok(report) => {
                log_report(&report);
                self.phase = PatrolPhase::Sleeping;
                self.config.patrol_frequency()
            }
            Err(TickError::Scan(e)) => {
                error!(
                    tick = self.ticks,
                    endpoint = e.endpoint(),
                    transient = e.is_transient(),
                    timeout = e.is_timeout(),
                    error = %e,
                    "Patrol tick aborted, cooling down"
                );
                self.phase = PatrolPhase::Cooldown;
                self.config.cooldown_period()
            }
        }
    }

    /// Patrol until `shutdown` flips to true or its sender is dropped.
    ///
    /// Shutdown is only observed between ticks; a running tick completes.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            frequency_secs = self.config.patrol_frequency_secs,
            cooldown_secs = self.config.cooldown_period_secs,
            "Patrol loop started"
        );

        while !*shutdown.borrow() {
            let delay = self.step().await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.phase = PatrolPhase::Stopped;
        info!(ticks = self.ticks, "Patrol loop stopped");
    }
}

/// ADD plans grouped by asset, assets in order of first appearance.
fn group_additions(plans: &[AdjustmentPlan]) -> Vec<(String, Vec<AdjustmentPlan>)> {
    let mut groups: Vec<(String, Vec<AdjustmentPlan>)> = Vec::new();

    for plan in plans
        .iter()
        .filter(|p| p.direction == AdjustmentDirection::Add)
    {
        match groups.iter_mut().find(|(asset, _)| *asset == plan.asset) {
            Some((_, group)) => group.push(plan.clone()),
            None => groups.push((plan.asset.clone(), vec![plan.clone()])),
        }
    }

    groups
}

fn log_report(report: &TickReport) {
    for result in report.stranded() {
        warn!(
            tick = report.tick,
            symbol = %result.symbol,
            asset = %result.asset,
            amount = %result.amount,
            "Funds stranded in futures wallet, manual transfer needed"
        );
    }

    let elapsed_ms = report.elapsed.as_millis() as u64;
    if report.is_clean() {
        info!(
            tick = report.tick,
            plans = report.plans.len(),
            applied = report.applied(),
            elapsed_ms,
            "Patrol tick complete"
        );
    } else {
        warn!(
            tick = report.tick,
            plans = report.plans.len(),
            applied = report.applied(),
            failed = report.failed(),
            skipped = report.skipped_additions(),
            elapsed_ms,
            "Patrol tick complete with failed or skipped adjustments"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{Endpoint, MockVenue, VenueCall};
    use crate::strategy::collector::CapitalTier;
    use rust_decimal_macros::dec;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.patrol.patrol_frequency_secs = 0.02;
        config.patrol.cooldown_period_secs = 0.01;
        config
    }

    fn patrol(venue: &Arc<MockVenue>) -> PatrolLoop {
        PatrolLoop::new(venue.clone(), &test_config())
    }

    fn transfers(calls: &[VenueCall]) -> usize {
        calls
            .iter()
            .filter(|c| matches!(c, VenueCall::Transfer { .. }))
            .count()
    }

    /// Two ADD plans of 300 and 500 USDT.
    fn underfunded_positions() -> MockVenue {
        MockVenue::new()
            .with_position("BTCUSDT", dec!(100), dec!(401), dec!(0), dec!(0.1))
            .with_position("ETHUSDT", dec!(100), dec!(601), dec!(0), dec!(1))
    }

    #[tokio::test]
    async fn test_funded_additions_all_applied() {
        let venue = Arc::new(underfunded_positions().with_spot_balance("USDT", dec!(800)));
        let mut patrol = patrol(&venue);

        let report = patrol.tick().await.unwrap();

        assert_eq!(report.additions.len(), 1);
        let funding = &report.additions[0];
        assert_eq!(funding.required, dec!(800));
        assert!(funding.is_funded());
        assert_eq!(funding.results.len(), 2);
        assert_eq!(report.applied(), 2);
        assert!(report.is_clean());

        assert_eq!(venue.spot_balance("USDT").await, Decimal::ZERO);
        assert_eq!(venue.position("BTCUSDT").await.unwrap().margin_slack(), dec!(-1));
        assert_eq!(venue.position("ETHUSDT").await.unwrap().margin_slack(), dec!(-1));
        assert_eq!(patrol.phase(), PatrolPhase::ProcessingAdditions);
    }

    #[tokio::test]
    async fn test_partial_funding_skips_every_addition() {
        let venue = Arc::new(underfunded_positions().with_spot_balance("USDT", dec!(600)));
        let mut patrol = patrol(&venue);

        let report = patrol.tick().await.unwrap();

        let funding = &report.additions[0];
        assert!(!funding.is_funded());
        assert_eq!(funding.shortfall(), dec!(200));
        assert!(funding.results.is_empty());
        assert_eq!(report.skipped_additions(), 2);
        assert_eq!(transfers(&venue.calls().await), 0);
        assert!(venue.mutations().await.is_empty());
    }

    #[tokio::test]
    async fn test_reductions_run_first_and_fund_additions() {
        // ETHUSDT releases 49, BTCUSDT needs 30
        let venue = Arc::new(
            MockVenue::new()
                .with_position("BTCUSDT", dec!(100), dec!(131), dec!(0), dec!(0.1))
                .with_position("ETHUSDT", dec!(200), dec!(100), dec!(-50), dec!(-2)),
        );
        let mut patrol = patrol(&venue);

        let report = patrol.tick().await.unwrap();

        assert_eq!(report.reductions.len(), 1);
        assert!(report.reductions[0].is_success());
        assert!(report.additions[0].is_funded());
        assert_eq!(report.applied(), 2);

        let mutations = venue.mutations().await;
        assert!(matches!(
            &mutations[0],
            VenueCall::IsolatedMargin { symbol, .. } if symbol == "ETHUSDT"
        ));
        assert_eq!(venue.spot_balance("USDT").await, dec!(19));
    }

    #[tokio::test]
    async fn test_failed_reduction_does_not_block_others() {
        let venue = Arc::new(
            MockVenue::new()
                .with_position("ETHUSDT", dec!(200), dec!(100), dec!(-50), dec!(-2))
                .with_position("SOLUSDT", dec!(150), dec!(100), dec!(0), dec!(10))
                .with_position("BTCUSDT", dec!(100), dec!(111), dec!(0), dec!(0.1))
                .with_spot_balance("USDT", dec!(10)),
        );
        venue.reject_margin_for("ETHUSDT").await;
        let mut patrol = patrol(&venue);

        let report = patrol.tick().await.unwrap();

        assert_eq!(report.reductions.len(), 2);
        assert!(!report.reductions[0].is_success());
        assert!(report.reductions[1].is_success());
        // 10 in spot plus 49 from SOLUSDT covers the 10 BTCUSDT needs
        assert!(report.additions[0].is_funded());
        assert_eq!(report.applied(), 2);
        assert_eq!(report.failed(), 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_assets_funded_independently() {
        let venue = Arc::new(
            MockVenue::new()
                .with_position("BTCUSDT", dec!(100), dec!(401), dec!(0), dec!(0.1))
                .with_position("ETHUSDC", dec!(100), dec!(151), dec!(0), dec!(1))
                .with_spot_balance("USDT", dec!(100))
                .with_spot_balance("USDC", dec!(50)),
        );
        let mut patrol = patrol(&venue);

        let report = patrol.tick().await.unwrap();

        let assets: Vec<_> = report.additions.iter().map(|a| a.asset.as_str()).collect();
        assert_eq!(assets, vec!["USDT", "USDC"]);
        assert_eq!(report.additions[0].shortfall(), dec!(200));
        assert!(report.additions[1].is_funded());
        assert_eq!(venue.position("ETHUSDC").await.unwrap().margin_slack(), dec!(-1));
    }

    #[tokio::test]
    async fn test_collector_failure_isolated_to_asset() {
        let venue = Arc::new(
            MockVenue::new()
                .with_position("BTCUSDT", dec!(100), dec!(401), dec!(0), dec!(0.1))
                .with_position("ETHUSDC", dec!(100), dec!(151), dec!(0), dec!(1))
                .with_spot_balance("USDT", dec!(100))
                .with_earn_position("USDT", "USDT001", dec!(50))
                .with_loan("BTC", "USDT", dec!(1000), dec!(0.4))
                .with_spot_balance("USDC", dec!(50)),
        );
        venue.fail_always(Endpoint::LoanStatus).await;
        let mut patrol = patrol(&venue);

        let report = patrol.tick().await.unwrap();

        match &report.additions[0].status {
            FundingStatus::Failed(e) => {
                assert_eq!(e.tier, CapitalTier::CollateralLoan);
                assert_eq!(e.committed.len(), 2);
            }
            other => panic!("expected failed collection, got {:?}", other),
        }
        assert!(report.additions[0].results.is_empty());
        assert!(report.additions[1].is_funded());
        // the redeemed savings stay in spot
        assert_eq!(venue.spot_balance("USDT").await, dec!(150));
    }

    #[tokio::test]
    async fn test_scan_failure_cools_down_then_rescans() {
        let venue = Arc::new(underfunded_positions().with_spot_balance("USDT", dec!(800)));
        venue.fail_next(Endpoint::Positions, 1).await;
        let mut patrol = patrol(&venue);

        let delay = patrol.step().await;
        assert_eq!(delay, Duration::from_millis(10));
        assert_eq!(patrol.phase(), PatrolPhase::Cooldown);
        assert!(venue.mutations().await.is_empty());

        let delay = patrol.step().await;
        assert_eq!(delay, Duration::from_millis(20));
        assert_eq!(patrol.phase(), PatrolPhase::Sleeping);
        assert_eq!(patrol.ticks(), 2);
        assert_eq!(transfers(&venue.calls().await), 2);
    }

    #[tokio::test]
    async fn test_run_survives_errors_until_shutdown() {
        let venue = Arc::new(underfunded_positions());
        venue.fail_next(Endpoint::Positions, 2).await;
        let mut patrol = patrol(&venue);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            patrol.run(rx).await;
            patrol
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(true).unwrap();

        let patrol = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("patrol did not stop")
            .unwrap();

        assert_eq!(patrol.phase(), PatrolPhase::Stopped);
        assert!(patrol.ticks() >= 3);
        let scans = venue
            .calls()
            .await
            .iter()
            .filter(|c| matches!(c, VenueCall::GetPositions))
            .count();
        assert_eq!(scans as u64, patrol.ticks());
    }

    #[tokio::test]
    async fn test_plan_only_reads() {
        let venue = Arc::new(underfunded_positions().with_spot_balance("USDT", dec!(800)));
        let mut patrol = patrol(&venue);

        let plans = patrol.plan().await.unwrap();

        assert_eq!(plans.len(), 2);
        assert_eq!(plans.iter().map(|p| p.magnitude).sum::<Decimal>(), dec!(800));
        assert_eq!(venue.calls().await, vec![VenueCall::GetPositions]);
    }

    #[tokio::test]
    async fn test_tick_on_mirrored_venue_leaves_source_untouched() {
        let source = underfunded_positions().with_spot_balance("USDT", dec!(800));
        let mirrored = Arc::new(
            MockVenue::mirror(&source, &test_config().capital)
                .await
                .unwrap(),
        );
        let mut patrol = patrol(&mirrored);

        let report = patrol.tick().await.unwrap();

        assert_eq!(report.applied(), 2);
        assert_eq!(transfers(&mirrored.calls().await), 2);
        assert!(source.mutations().await.is_empty());
        assert_eq!(source.spot_balance("USDT").await, dec!(800));
    }

    #[test]
    fn test_group_additions_keeps_first_appearance_order() {
        let plan = |symbol: &str, asset: &str, direction| AdjustmentPlan {
            symbol: symbol.to_string(),
            asset: asset.to_string(),
            direction,
            magnitude: dec!(10),
        };
        let plans = vec![
            plan("ETHUSDC", "USDC", AdjustmentDirection::Add),
            plan("BTCUSDT", "USDT", AdjustmentDirection::Add),
            plan("SOLUSDT", "USDT", AdjustmentDirection::Reduce),
            plan("BNBUSDC", "USDC", AdjustmentDirection::Add),
        ];

        let groups = group_additions(&plans);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "USDC");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "USDT");
        assert_eq!(groups[1].1.len(), 1);
    }
}
