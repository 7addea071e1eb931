//!
//! Formatting and identifier helpers used throughout the crate.

use rand::Rng;

/// Render `amount` with `decimals` fractional digits. Splitting instead of
/// dividing through a float keeps the display exact for large amounts.
pub fn format_token_amount(amount: u64, decimals: u32) -> String {
	let scale = 10u64.pow(decimals);
	format!(
		"{}.{:0width$}",
		amount / scale,
		amount % scale,
		width = decimals as usize
	)
}

/// Short random identifier correlating the log lines of one flow.
pub fn generate_flow_id() -> String {
	let mut bytes = [0u8; 8];
	rand::rng().fill(&mut bytes);
	hex::encode(bytes)
}
