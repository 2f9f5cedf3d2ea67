//! # Liquidation Shield
//!
//! Keeps isolated-margin positions on Binance USDⓈ-M futures away from
//! liquidation by topping up margin that falls short and releasing margin
//! that is in surplus.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Venue trait, Binance REST client and in-memory venue
//! - `strategy`: Position scanner, capital waterfall, margin adjuster, patrol loop
//! - `health`: Liveness endpoint
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod exchange;
pub mod health;
pub mod strategy;
pub mod utils;

pub use config::Config;
