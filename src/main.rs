use std::sync::Arc;

use tracing::{error, info, warn};

use sale_coordinator::backend::{
	AccountId, Amount, HttpBackendClient, LedgerGateway, SaleId, SaleSnapshot, TOKEN_DECIMALS,
	account,
};
use sale_coordinator::reader::{FetchStrategy, Tier, fetch};
use sale_coordinator::retry::{HighLoadSink, RetryEngine};
use sale_coordinator::sale::{
	EventDispatcher, EventHandlerError, NotificationSink, ParticipationError, ParticipationEvent,
	ParticipationEventHandler, SaleParticipationCoordinator,
};
use sale_coordinator::utils::format_token_amount;

/// Routes engine and coordinator notifications to the log.
struct LogSink;

impl HighLoadSink for LogSink {
	fn high_load_started(&self) {
		warn!("backend is under high load; still retrying");
	}

	fn high_load_cleared(&self) {
		info!("backend load warning cleared");
	}
}

impl NotificationSink for LogSink {
	fn participation_succeeded(&self, sale_id: &SaleId, accepted: Amount) {
		info!(
			%sale_id,
			accepted = %format_token_amount(accepted, TOKEN_DECIMALS),
			"participation accepted"
		);
	}

	fn participation_failed(&self, sale_id: &SaleId, error: &ParticipationError) {
		error!(%sale_id, %error, "participation failed");
	}

	fn amount_mismatch(&self, sale_id: &SaleId, expected: Amount, accepted: Amount) {
		warn!(
			%sale_id,
			expected = %format_token_amount(expected, TOKEN_DECIMALS),
			accepted = %format_token_amount(accepted, TOKEN_DECIMALS),
			"backend accepted a different amount"
		);
	}
}

/// Logs every state transition of the flow.
struct LogProgress;

#[async_trait::async_trait]
impl ParticipationEventHandler for LogProgress {
	async fn handle(&mut self, event: &ParticipationEvent) -> Result<(), EventHandlerError> {
		match event {
			ParticipationEvent::PhaseEntered { phase } => info!(%phase, "participation progress"),
			ParticipationEvent::TicketAdopted { ticket } => {
				info!(ticket_id = ticket.ticket_id, "ticket adopted")
			}
			ParticipationEvent::ReloadRequested => info!("reload requested"),
		}
		Ok(())
	}

	fn name(&self) -> &'static str {
		"log-progress"
	}
}

fn env_or(name: &str, default: &str) -> String {
	std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting sale participation demo");

	let base_url = env_or("BACKEND_URL", "http://localhost:8080");
	let sale_id = SaleId(env_or("SALE_ID", "sale-1"));
	let amount: Amount = env_or("AMOUNT", "100000000")
		.parse()
		.expect("AMOUNT must be an integer in the smallest token unit");

	let owner_hex = env_or("ACCOUNT_OWNER", &hex::encode([0u8; 32]));
	let owner_bytes = match hex::decode(&owner_hex) {
		Ok(bytes) if bytes.len() == 32 => bytes,
		_ => {
			error!("ACCOUNT_OWNER must be 32 hex-encoded bytes");
			return;
		}
	};
	let mut owner = [0u8; 32];
	owner.copy_from_slice(&owner_bytes);
	let participant = AccountId::new(owner);

	let collection_account = match std::env::var("COLLECTION_ACCOUNT") {
		Ok(text) => match account::decode(&text) {
			Ok((decoded, network)) => {
				info!(?network, "using collection account from environment");
				decoded
			}
			Err(e) => {
				error!("Failed to decode COLLECTION_ACCOUNT: {}", e);
				return;
			}
		},
		Err(_) => AccountId::new([1u8; 32]),
	};

	let client = Arc::new(HttpBackendClient::new(base_url));
	info!("Created backend client");

	let sink = Arc::new(LogSink);
	let engine = Arc::new(RetryEngine::new(sink.clone()));

	// Display the balance as soon as either tier answers; the authoritative
	// settlement supersedes the speculative one.
	fetch(
		{
			let client = Arc::clone(&client);
			move |tier| {
				let client = Arc::clone(&client);
				async move { client.balance(&participant, tier).await }
			}
		},
		|tier, balance| {
			info!(
				%tier,
				balance = %format_token_amount(balance, TOKEN_DECIMALS),
				"balance"
			)
		},
		|tier, error| warn!(%tier, %error, "balance read failed"),
		FetchStrategy::Both,
	)
	.await;

	let snapshot = SaleSnapshot {
		sale_id,
		collection_account,
		min_participant_commitment: env_or("SALE_MIN", "100000000")
			.parse()
			.expect("SALE_MIN must be an integer"),
		max_participant_commitment: env_or("SALE_MAX", "100000000000")
			.parse()
			.expect("SALE_MAX must be an integer"),
		prior_commitment: 0,
		transfer_fee: env_or("TRANSFER_FEE", "10000")
			.parse()
			.expect("TRANSFER_FEE must be an integer"),
	};

	let mut dispatcher = EventDispatcher::new();
	dispatcher.register_handler(Box::new(LogProgress));

	let mut coordinator = SaleParticipationCoordinator::new(
		snapshot,
		participant,
		engine,
		client.clone(),
		client.clone(),
		client.clone(),
		sink,
		dispatcher,
	);

	// Pick up an interrupted flow first; only start a fresh one if there was
	// nothing to resume.
	match coordinator.restore().await {
		Ok(Some(outcome)) => {
			info!(?outcome, "resumed participation completed");
			return;
		}
		Ok(None) => info!("no interrupted participation found"),
		Err(e) => {
			error!("Failed to resume participation: {}", e);
			return;
		}
	}

	let available_balance = match client.balance(&participant, Tier::Authoritative).await {
		Ok(balance) => balance,
		Err(e) => {
			error!("Failed to read the authoritative balance: {}", e);
			return;
		}
	};

	match coordinator.initiate(amount, available_balance).await {
		Ok(outcome) => info!(?outcome, "participation completed"),
		Err(e) => error!("Participation failed: {}", e),
	}
}
