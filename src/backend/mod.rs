//! Backend collaborator contracts, domain types, and the HTTP client.
//!
//! - `types`: domain types and the typed error taxonomy
//! - `traits`: the gateway seams the coordination layer is written against
//! - `http`: `reqwest`-based implementation of all gateway traits
//! - `account`: bech32m text form of account identifiers

pub mod account;
pub mod http;
pub mod traits;
pub mod types;

pub use http::HttpBackendClient;
pub use traits::{AccountRefresher, LedgerGateway, SaleGateway};
pub use types::*;
