//! Shared value types used across the fulfillment bridge crates.

mod money;
mod types;

pub use money::Money;
pub use types::{OrderId, ParseOrderIdError};
