//! Reward disbursement: pays every Unpaid address whose total reached the
//! threshold, one payout at a time.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use rust_decimal::Decimal;
use serde::Serialize;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::error::LedgerError;
use crate::ledger::Ledger;

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function transfer(address recipient, uint256 amount) external returns (bool);
    }
}

/// Sends one reward payment and waits for it to be confirmed.
#[async_trait]
pub trait PayoutChannel: Send + Sync {
    /// Returns the payout transaction hash once confirmed.
    async fn send_reward(&self, to: Address, amount: U256) -> Result<String>;
}

/// Signs reward-token `transfer` calls with a local private key.
pub struct WalletPayout {
    provider: DynProvider,
    token: Address,
    confirmations: u64,
    timeout: Duration,
}

impl WalletPayout {
    pub fn new(
        rpc_url: &str,
        private_key: &str,
        token: Address,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .parse()
            .map_err(|e| eyre!("invalid private key: {}", e))?;
        info!("Payout wallet {}", signer.address());

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(rpc_url.parse().wrap_err("invalid RPC URL for payouts")?)
            .erased();

        Ok(Self {
            provider,
            token,
            confirmations,
            timeout,
        })
    }
}

#[async_trait]
impl PayoutChannel for WalletPayout {
    async fn send_reward(&self, to: Address, amount: U256) -> Result<String> {
        let contract = IERC20::new(self.token, self.provider.clone());

        // gas estimation, nonce, broadcast and confirmation share one deadline
        let receipt = within(self.timeout, async {
            let pending = contract
                .transfer(to, amount)
                .send()
                .await
                .wrap_err("reward transfer submission failed")?;
            info!(to = %to, tx_hash = %pending.tx_hash(), "Reward transfer submitted");

            pending
                .with_required_confirmations(self.confirmations)
                .get_receipt()
                .await
                .wrap_err("reward transfer confirmation failed")
        })
        .await?;

        let tx_hash = format!("{:#x}", receipt.transaction_hash);
        if !receipt.status() {
            return Err(eyre!("reward transfer {} reverted", tx_hash));
        }
        Ok(tx_hash)
    }
}

async fn within<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    timeout(limit, fut)
        .await
        .map_err(|_| eyre!("reward transfer timed out after {:?}", limit))?
}

/// What happened to one eligible address during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome")]
pub enum PayoutOutcome {
    Paid { payout_tx_hash: String },
    Failed { reason: String },
    /// Status was no longer Unpaid when the payout was recorded.
    AlreadyPaid { payout_tx_hash: String },
    /// Payout confirmed but the Paid status could not be written. The address
    /// stays Unpaid and will be paid again on the next run.
    PaidUnrecorded { payout_tx_hash: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressPayout {
    pub address: String,
    pub total_amount: Decimal,
    #[serde(flatten)]
    pub outcome: PayoutOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DisbursementReport {
    pub payouts: Vec<AddressPayout>,
}

impl DisbursementReport {
    pub fn paid(&self) -> usize {
        self.count(|o| matches!(o, PayoutOutcome::Paid { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PayoutOutcome::Failed { .. }))
    }

    pub fn unrecorded(&self) -> usize {
        self.count(|o| matches!(o, PayoutOutcome::PaidUnrecorded { .. }))
    }

    fn count(&self, pred: impl Fn(&PayoutOutcome) -> bool) -> usize {
        self.payouts.iter().filter(|p| pred(&p.outcome)).count()
    }
}

impl fmt::Display for DisbursementReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Disbursement complete: {} eligible, {} paid, {} failed",
            self.payouts.len(),
            self.paid(),
            self.failed()
        )?;
        if self.unrecorded() > 0 {
            write!(f, ", {} paid but not recorded", self.unrecorded())?;
        }
        Ok(())
    }
}

pub struct Disburser {
    ledger: Ledger,
    payout: Arc<dyn PayoutChannel>,
    threshold: Decimal,
    reward: U256,
    run_lock: Mutex<()>,
}

impl Disburser {
    pub fn new(ledger: Ledger, payout: Arc<dyn PayoutChannel>, threshold: Decimal, reward: U256) -> Self {
        Self {
            ledger,
            payout,
            threshold,
            reward,
            run_lock: Mutex::new(()),
        }
    }

    /// Pay every eligible address once. Concurrent calls queue behind the
    /// running one.
    pub async fn run(&self) -> Result<DisbursementReport, LedgerError> {
        let _guard = self.run_lock.lock().await;

        let eligible = self.ledger.eligible_for_reward(self.threshold).await?;
        info!("Disbursement started: {} eligible addresses", eligible.len());

        let mut report = DisbursementReport::default();
        for balance in eligible {
            let outcome = self.pay(&balance.address).await;
            report.payouts.push(AddressPayout {
                address: balance.address,
                total_amount: balance.total_amount,
                outcome,
            });
        }

        info!("{}", report);
        Ok(report)
    }

    async fn pay(&self, address: &str) -> PayoutOutcome {
        let to: Address = match address.parse() {
            Ok(to) => to,
            Err(e) => {
                warn!(address, "Skipping unparseable address: {}", e);
                return PayoutOutcome::Failed {
                    reason: format!("invalid address: {}", e),
                };
            }
        };

        let payout_tx_hash = match self.payout.send_reward(to, self.reward).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(address, "Reward payout failed, leaving Unpaid: {:?}", e);
                return PayoutOutcome::Failed {
                    reason: format!("{:#}", e),
                };
            }
        };

        match self.ledger.mark_paid(address, &payout_tx_hash).await {
            Ok(true) => {
                info!(address, payout_tx_hash = %payout_tx_hash, "Reward paid");
                PayoutOutcome::Paid { payout_tx_hash }
            }
            Ok(false) => {
                warn!(address, payout_tx_hash = %payout_tx_hash, "Address was already marked Paid");
                PayoutOutcome::AlreadyPaid { payout_tx_hash }
            }
            Err(e) => {
                error!(
                    address,
                    payout_tx_hash = %payout_tx_hash,
                    "Reward confirmed on chain but Paid status was not recorded: {:?}",
                    e
                );
                PayoutOutcome::PaidUnrecorded { payout_tx_hash }
            }
        }
    }
}
