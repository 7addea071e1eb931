//!
//! HTTP client for the replicated token backend.
//!
//! Implements the gateway traits against the backend's JSON surface. Every
//! endpoint answers an `ok`/`err` envelope whose error side is the operation's
//! typed error; transport and decoding failures are folded into the transient
//! `Unavailable` variants so the retry layer treats them uniformly. Reads pass
//! the requested consistency tier along with the request body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing::debug;

use crate::reader::Tier;

use super::traits::{AccountRefresher, LedgerGateway, SaleGateway};
use super::types::{
	AccountId, Amount, BlockHeight, LedgerError, NotifyError, RefreshError, SaleGatewayError,
	SaleId, SaleTicket, TicketError, TicketRequest, TransferError, TransferRequest,
};

/// JSON envelope every backend endpoint answers with.
#[derive(Debug, Deserialize)]
enum Envelope<T, E> {
	#[serde(rename = "ok")]
	Ok(T),
	#[serde(rename = "err")]
	Err(E),
}

/// Client for the backend's HTTP surface.
#[derive(Clone)]
pub struct HttpBackendClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// Base URL of the backend, without a trailing slash.
	base_url: String,
}

impl HttpBackendClient {
	/// Create a new backend client for the given base URL.
	pub fn new(base_url: String) -> Self {
		let http_client = Client::builder()
			.timeout(Duration::from_secs(30))
			.build()
			.expect("Failed to create HTTP client");

		Self {
			http_client,
			base_url: base_url.trim_end_matches('/').to_string(),
		}
	}

	/// POST `body` to `path` and split the response envelope. The outer error
	/// is a transport or decoding failure, the inner one the endpoint's typed
	/// error.
	async fn post<B, T, E>(&self, path: &str, body: &B) -> Result<Result<T, E>, String>
	where
		B: Serialize + ?Sized,
		T: DeserializeOwned,
		E: DeserializeOwned,
	{
		let url = format!("{}{}", self.base_url, path);
		debug!(%url, "backend call");

		let response = self
			.http_client
			.post(&url)
			.json(body)
			.send()
			.await
			.map_err(|e| format!("request to {} failed: {}", url, e))?;

		let status = response.status();
		if !status.is_success() {
			return Err(format!("backend answered {} for {}", status, url));
		}

		let envelope: Envelope<T, E> = response
			.json()
			.await
			.map_err(|e| format!("invalid response from {}: {}", url, e))?;

		Ok(match envelope {
			Envelope::Ok(value) => Ok(value),
			Envelope::Err(error) => Err(error),
		})
	}
}

#[async_trait]
impl SaleGateway for HttpBackendClient {
	async fn reserve_ticket(&self, request: &TicketRequest) -> Result<SaleTicket, TicketError> {
		match self
			.post::<_, SaleTicket, TicketError>("/sale/reserve-ticket", request)
			.await
		{
			Ok(outcome) => outcome,
			Err(reason) => Err(TicketError::Unavailable { reason }),
		}
	}

	async fn open_ticket(
		&self,
		sale_id: &SaleId,
		account: &AccountId,
		tier: Tier,
	) -> Result<Option<SaleTicket>, SaleGatewayError> {
		let body = json!({
			"sale_id": sale_id,
			"account": account,
			"consistency": tier.as_str(),
		});

		match self
			.post::<_, Option<SaleTicket>, SaleGatewayError>("/sale/open-ticket", &body)
			.await
		{
			Ok(outcome) => outcome,
			Err(reason) => Err(SaleGatewayError::Unavailable { reason }),
		}
	}

	async fn notify_participation(
		&self,
		sale_id: &SaleId,
		account: &AccountId,
	) -> Result<Amount, NotifyError> {
		#[derive(Deserialize)]
		struct Accepted {
			accepted: Amount,
		}

		let body = json!({
			"sale_id": sale_id,
			"account": account,
		});

		match self
			.post::<_, Accepted, NotifyError>("/sale/notify-participation", &body)
			.await
		{
			Ok(Ok(accepted)) => Ok(accepted.accepted),
			Ok(Err(error)) => Err(error),
			Err(reason) => Err(NotifyError::Unavailable { reason }),
		}
	}

	async fn notify_payment_failure(
		&self,
		sale_id: &SaleId,
	) -> Result<Option<SaleTicket>, SaleGatewayError> {
		let body = json!({ "sale_id": sale_id });

		match self
			.post::<_, Option<SaleTicket>, SaleGatewayError>("/sale/notify-payment-failure", &body)
			.await
		{
			Ok(outcome) => outcome,
			Err(reason) => Err(SaleGatewayError::Unavailable { reason }),
		}
	}
}

#[async_trait]
impl LedgerGateway for HttpBackendClient {
	async fn transfer(&self, request: &TransferRequest) -> Result<BlockHeight, TransferError> {
		#[derive(Deserialize)]
		struct Settled {
			height: BlockHeight,
		}

		match self
			.post::<_, Settled, TransferError>("/ledger/transfer", request)
			.await
		{
			Ok(Ok(settled)) => Ok(settled.height),
			Ok(Err(error)) => Err(error),
			Err(reason) => Err(TransferError::Unavailable { reason }),
		}
	}

	async fn balance(&self, account: &AccountId, tier: Tier) -> Result<Amount, LedgerError> {
		#[derive(Deserialize)]
		struct Balance {
			balance: Amount,
		}

		let body = json!({
			"account": account,
			"consistency": tier.as_str(),
		});

		match self
			.post::<_, Balance, LedgerError>("/ledger/balance", &body)
			.await
		{
			Ok(Ok(balance)) => Ok(balance.balance),
			Ok(Err(error)) => Err(error),
			Err(reason) => Err(LedgerError::Unavailable { reason }),
		}
	}
}

#[async_trait]
impl AccountRefresher for HttpBackendClient {
	async fn refresh_accounts(&self, account: &AccountId) -> Result<(), RefreshError> {
		let body = json!({ "account": account });

		match self.post::<_, (), String>("/accounts/refresh", &body).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(reason)) | Err(reason) => Err(RefreshError(reason)),
		}
	}
}
