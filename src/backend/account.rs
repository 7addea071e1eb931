use bech32::{Bech32m, Hrp};
use thiserror::Error;

use super::types::{AccountId, Subaccount};

/// Networks an account text form can designate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
	Main,
	Test,
	Dev,
}

#[derive(Error, Debug)]
pub enum AccountTextError {
	#[error("bech32 decode failed: {0}")]
	Decode(#[from] bech32::DecodeError),
	#[error("prefix first part != 'acct'")]
	PrefixInvalidConstant,
	#[error("unknown network suffix: {0}")]
	UnknownNetwork(String),
	#[error("payload length {0} is not a valid account encoding")]
	PayloadLength(usize),
}

/// Encode an account as its bech32m text form, `acct1...` on mainnet and
/// `acct_test1...` / `acct_dev1...` elsewhere. The payload is the owner bytes
/// followed by the subaccount bytes when one is present.
pub fn encode(account: &AccountId, network: Network) -> String {
	let network_suffix = match network {
		Network::Main => "",
		Network::Test => "_test",
		Network::Dev => "_dev",
	};

	let mut data = account.owner.to_vec();
	if let Some(subaccount) = &account.subaccount {
		data.extend_from_slice(&subaccount.0);
	}

	bech32::encode::<Bech32m>(
		Hrp::parse(&format!("acct{}", network_suffix)).expect("static hrp is valid"),
		&data,
	)
	.expect("account payload fits bech32 limits")
}

/// Decode the text form produced by [`encode`].
pub fn decode(text: &str) -> Result<(AccountId, Network), AccountTextError> {
	let (hrp, data) = bech32::decode(text)?;
	let mut prefix_parts = hrp.as_str().split('_');
	if prefix_parts.next() != Some("acct") {
		return Err(AccountTextError::PrefixInvalidConstant);
	}
	let network = match prefix_parts.next() {
		None => Network::Main,
		Some("test") => Network::Test,
		Some("dev") => Network::Dev,
		Some(other) => return Err(AccountTextError::UnknownNetwork(other.to_string())),
	};

	let account = match data.len() {
		32 => {
			let mut owner = [0u8; 32];
			owner.copy_from_slice(&data);
			AccountId {
				owner,
				subaccount: None,
			}
		}
		64 => {
			let mut owner = [0u8; 32];
			let mut subaccount = [0u8; 32];
			owner.copy_from_slice(&data[..32]);
			subaccount.copy_from_slice(&data[32..]);
			AccountId {
				owner,
				subaccount: Some(Subaccount(subaccount)),
			}
		}
		n => return Err(AccountTextError::PayloadLength(n)),
	};

	Ok((account, network))
}
