//! Shared types for the termlink terminal-mirror SDK.
//!
//! This crate contains:
//! - The terminal data model (account information, positions, orders,
//!   deals, symbol specifications, symbol prices)
//! - The `ApiError` kind set shared by the wire and SDK layers
//!
//! CRITICAL: All prices and monetary quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

pub mod error;
pub mod types;

pub use error::ApiError;
pub use types::*;
