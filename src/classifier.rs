// src/classifier.rs
use alloy::primitives::{Address, Bytes, Log as EvmLog, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use thiserror::Error;

use crate::models::TransferEvent;
use crate::rpc::Log;
use crate::units::from_base_units;

sol! {
    #[derive(Debug)]
    event Transfer(address indexed from, address indexed to, uint256 value);

    #[derive(Debug)]
    event Approval(address indexed owner, address indexed spender, uint256 value);
}

/// Events the watched token contract is known to emit.
#[derive(Debug)]
pub enum TokenEvent {
    Transfer(Transfer),
    Approval(Approval),
}

/// A watched-token Transfer whose amount does not fit a decimal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transfer of {raw} base units from {from} exceeds the decimal range at {decimals} decimals")]
pub struct AmountOutOfRange {
    pub from: String,
    pub to: String,
    pub raw: U256,
    pub decimals: u8,
}

/// Decides whether a receipt log is a transfer of the watched token.
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    token: Address,
    decimals: u8,
}

impl Classifier {
    pub fn new(token: Address, decimals: u8) -> Self {
        Self { token, decimals }
    }

    pub fn token(&self) -> Address {
        self.token
    }

    /// Returns the transfer carried by `log`, or `None` for anything else:
    /// other event types, logs emitted by another contract, or malformed hex.
    /// A real Transfer whose amount cannot be held as a decimal is `Some(Err)`.
    pub fn classify(&self, log: &Log) -> Option<Result<TransferEvent, AmountOutOfRange>> {
        let evm_log = to_evm_log(log)?;
        if evm_log.address != self.token {
            return None;
        }

        match decode(&evm_log)? {
            TokenEvent::Transfer(transfer) => {
                let from = format!("0x{:x}", transfer.from);
                let to = format!("0x{:x}", transfer.to);
                Some(match from_base_units(transfer.value, self.decimals) {
                    Some(amount) => Ok(TransferEvent { from, to, amount }),
                    None => Err(AmountOutOfRange {
                        from,
                        to,
                        raw: transfer.value,
                        decimals: self.decimals,
                    }),
                })
            }
            TokenEvent::Approval(_) => None,
        }
    }
}

/// Decode a log against the token's event signatures.
pub fn decode(log: &EvmLog) -> Option<TokenEvent> {
    let topic0 = *log.topics().first()?;

    // ERC721 shares the Transfer signature but indexes the third argument,
    // so decode_log rejects it on the topic count.
    if topic0 == Transfer::SIGNATURE_HASH {
        Transfer::decode_log(log)
            .ok()
            .map(|decoded| TokenEvent::Transfer(decoded.data))
    } else if topic0 == Approval::SIGNATURE_HASH {
        Approval::decode_log(log)
            .ok()
            .map(|decoded| TokenEvent::Approval(decoded.data))
    } else {
        None
    }
}

fn to_evm_log(log: &Log) -> Option<EvmLog> {
    let address: Address = log.address.parse().ok()?;
    let topics = log
        .topics
        .iter()
        .map(|t| t.parse::<B256>().ok())
        .collect::<Option<Vec<_>>>()?;
    let data = hex::decode(log.data.trim_start_matches("0x")).ok()?;
    EvmLog::new(address, topics, Bytes::from(data))
}
