//! Venue integration for the liquidation shield.
//!
//! ## Binance
//! Signed REST access to:
//! - USDⓈ-M futures account state and isolated margin changes
//! - Spot balances and spot ⇄ futures wallet transfers
//! - Simple Earn flexible holdings and redemptions
//! - Flexible loans collateralized by BTC
//!
//! ## Mock
//! In-memory venue with the same interface, for dry runs and tests.

mod client;
mod error;
pub mod mock;
mod traits;
mod types;

pub use client::BinanceClient;
pub use error::VenueError;
pub use mock::MockVenue;
pub use traits::{MarginVenue, VenueResult};
pub use types::*;

#[cfg(test)]
pub use traits::MockMarginVenue;
