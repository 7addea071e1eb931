//! Low-latency reads with an eventual authoritative correction.

pub mod dual;

pub use dual::{FetchStrategy, Tier, fetch};
