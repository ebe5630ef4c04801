//! Block listener: polls the chain for new blocks, queues them, and processes
//! them one at a time against the ledger.

use futures_util::{stream, StreamExt};
use std::{ops::RangeInclusive, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::classifier::Classifier;
use crate::ledger::Ledger;
use crate::models::{Ingestion, TransactionRecord, TransferEvent};
use crate::notify::{self, Notifier, TransferNotice};
use crate::rpc::{ChainSource, Receipt};

/// What happened while processing one block.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub block: u64,
    /// Block fetch failed; nothing else was attempted.
    pub skipped: bool,
    pub transactions: usize,
    pub receipt_failures: usize,
    pub token_receipts: usize,
    pub transfers: usize,
    /// Transfers whose amount does not fit a decimal; not recorded.
    pub out_of_range: usize,
    pub recorded: usize,
    pub duplicates: usize,
    pub ledger_errors: usize,
}

pub struct BlockListener {
    chain: Arc<dyn ChainSource>,
    ledger: Ledger,
    notifier: Arc<dyn Notifier>,
    classifier: Classifier,
    receipt_timeout: Duration,
    receipt_concurrency: usize,
}

impl BlockListener {
    pub fn new(
        chain: Arc<dyn ChainSource>,
        ledger: Ledger,
        notifier: Arc<dyn Notifier>,
        classifier: Classifier,
        receipt_timeout: Duration,
        receipt_concurrency: usize,
    ) -> Self {
        Self {
            chain,
            ledger,
            notifier,
            classifier,
            receipt_timeout,
            receipt_concurrency: receipt_concurrency.max(1),
        }
    }

    /// Fetch a block's receipts, classify their logs and record every watched
    /// token transfer. Failures are contained to the block, receipt, or log
    /// they occur in.
    pub async fn process_block(&self, number: u64) -> BlockSummary {
        let mut summary = BlockSummary {
            block: number,
            ..Default::default()
        };

        let tx_hashes = match self.chain.block_transactions(number).await {
            Ok(hashes) => hashes,
            Err(e) => {
                warn!(block = number, "Block fetch failed, skipping: {:?}", e);
                summary.skipped = true;
                return summary;
            }
        };
        summary.transactions = tx_hashes.len();

        // receipts are fetched concurrently but applied in block order
        let receipts: Vec<(String, eyre::Result<Receipt>)> = stream::iter(tx_hashes)
            .map(|tx_hash| async move {
                let receipt = self.fetch_receipt(&tx_hash).await;
                (tx_hash, receipt)
            })
            .buffered(self.receipt_concurrency)
            .collect()
            .await;

        for (tx_hash, receipt) in receipts {
            let receipt = match receipt {
                Ok(r) => r,
                Err(e) => {
                    warn!(block = number, tx_hash = %tx_hash, "Receipt fetch failed: {:?}", e);
                    summary.receipt_failures += 1;
                    continue;
                }
            };

            if !self.targets_watched_token(&receipt) {
                continue;
            }
            summary.token_receipts += 1;

            for log in &receipt.logs {
                match self.classifier.classify(log) {
                    Some(Ok(event)) => {
                        summary.transfers += 1;
                        self.apply(&tx_hash, number, &event, &mut summary).await;
                    }
                    Some(Err(e)) => {
                        summary.transfers += 1;
                        summary.out_of_range += 1;
                        error!(block = number, tx_hash = %tx_hash, "Transfer not recorded: {}", e);
                    }
                    None => debug!(tx_hash = %tx_hash, "Log is not a watched transfer"),
                }
            }
        }

        summary
    }

    async fn fetch_receipt(&self, tx_hash: &str) -> eyre::Result<Receipt> {
        match timeout(self.receipt_timeout, self.chain.transaction_receipt(tx_hash)).await {
            Ok(result) => result,
            Err(_) => Err(eyre::eyre!(
                "receipt fetch timed out after {:?}",
                self.receipt_timeout
            )),
        }
    }

    fn targets_watched_token(&self, receipt: &Receipt) -> bool {
        receipt
            .to
            .as_deref()
            .and_then(|to| to.parse::<alloy::primitives::Address>().ok())
            .map_or(false, |to| to == self.classifier.token())
    }

    async fn apply(&self, tx_hash: &str, block: u64, event: &TransferEvent, summary: &mut BlockSummary) {
        let record = TransactionRecord::new(tx_hash, Some(block), event);

        match self.ledger.record_transfer(record.clone()).await {
            Ok(Ingestion::Recorded { total }) => {
                summary.recorded += 1;
                info!(
                    block,
                    tx_hash = %record.tx_hash,
                    from = %record.from_address,
                    amount = %record.amount,
                    total = %total,
                    "Recorded transfer"
                );
                notify::dispatch(Arc::clone(&self.notifier), TransferNotice::from(&record));
            }
            Ok(Ingestion::Duplicate) => {
                summary.duplicates += 1;
                debug!(tx_hash = %record.tx_hash, "Transaction already recorded");
            }
            Err(e) => {
                summary.ledger_errors += 1;
                error!(tx_hash = %record.tx_hash, "Ledger update failed: {:?}", e);
            }
        }
    }
}

/// Polling and queueing knobs.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub poll_interval: Duration,
    /// Blocks behind the head that are considered final.
    pub confirmations: u64,
    pub queue_capacity: usize,
    /// First block to process when no cursor is stored.
    pub start_block: Option<u64>,
}

/// Blocks ready to be queued, given the next unqueued block and the chain head.
pub fn ready_range(next: u64, latest: u64, confirmations: u64) -> Option<RangeInclusive<u64>> {
    let target = latest.checked_sub(confirmations)?;
    (next <= target).then(|| next..=target)
}

const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Run the listener until `shutdown` flips to true. Queued blocks are drained
/// before returning. Chain and cursor failures are retried with backoff and
/// never end the run.
pub async fn run(
    listener: Arc<BlockListener>,
    settings: PollSettings,
    shutdown: watch::Receiver<bool>,
) -> eyre::Result<()> {
    let (tx, mut rx) = mpsc::channel::<u64>(settings.queue_capacity.max(1));
    let poller = tokio::spawn(poll_blocks(Arc::clone(&listener), tx, settings, shutdown));

    // Single worker: one block at a time, in order
    while let Some(number) = rx.recv().await {
        let summary = listener.process_block(number).await;
        info!(
            "Completed block {} → {} transfers ({} new, {} duplicate, {} out of range, {} receipt failures)",
            summary.block,
            summary.transfers,
            summary.recorded,
            summary.duplicates,
            summary.out_of_range,
            summary.receipt_failures
        );

        if let Err(e) = listener.ledger.set_last_processed_block(number).await {
            error!(block = number, "Failed to persist cursor: {:?}", e);
        }
    }

    match poller.await {
        Ok(()) => info!("Listener drained and stopped"),
        Err(e) => error!("Block poller task panicked: {:?}", e),
    }
    Ok(())
}

async fn resolve_start(listener: &BlockListener, settings: &PollSettings) -> eyre::Result<u64> {
    if let Some(last) = listener.ledger.last_processed_block().await? {
        return Ok(last + 1);
    }
    if let Some(start) = settings.start_block {
        return Ok(start);
    }
    let latest = listener.chain.latest_block_number().await?;
    Ok(latest.saturating_sub(settings.confirmations))
}

/// Double the delay, capped at two minutes (or at `current` if that is larger).
fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_BACKOFF).max(current)
}

async fn poll_blocks(
    listener: Arc<BlockListener>,
    queue: mpsc::Sender<u64>,
    settings: PollSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let base_delay = settings.poll_interval;
    let mut retry_delay = base_delay;
    // unknown until the first successful resolve
    let mut next: Option<u64> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let polled = async {
            let start = match next {
                Some(n) => n,
                None => resolve_start(&listener, &settings).await?,
            };
            let latest = listener.chain.latest_block_number().await?;
            Ok::<_, eyre::Report>((start, latest))
        }
        .await;

        match polled {
            Ok((start, latest)) => {
                if next.is_none() {
                    info!("Listener starting at block {}", start);
                }
                next = Some(start);
                retry_delay = base_delay;

                if let Some(range) = ready_range(start, latest, settings.confirmations) {
                    debug!("Queueing blocks {:?} (head {})", range, latest);
                    for number in range {
                        tokio::select! {
                            sent = queue.send(number) => {
                                if sent.is_err() {
                                    return;
                                }
                                next = Some(number + 1);
                            }
                            _ = shutdown.changed() => return,
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Head poll failed, retrying in {:?}: {:?}", retry_delay, e);
                retry_delay = next_backoff(retry_delay);
            }
        }

        tokio::select! {
            _ = sleep(retry_delay) => {}
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::tests::{ether, transfer_log, TOKEN};
    use crate::db;
    use crate::notify::LogNotifier;
    use crate::rpc::Log;
    use alloy::primitives::{address, Address};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const ALICE: Address = address!("00000000000000000000000000000000000000a1");
    const BOB: Address = address!("00000000000000000000000000000000000000b2");
    const CAROL: Address = address!("00000000000000000000000000000000000000c3");

    #[derive(Default)]
    struct FakeChain {
        head: u64,
        blocks: HashMap<u64, Vec<String>>,
        receipts: HashMap<String, Receipt>,
        failing_receipts: HashSet<String>,
        /// Head polls that fail before the node answers.
        head_outages: AtomicUsize,
    }

    #[async_trait]
    impl ChainSource for FakeChain {
        async fn latest_block_number(&self) -> eyre::Result<u64> {
            let outage = self
                .head_outages
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if outage {
                return Err(eyre::eyre!("connection refused"));
            }
            Ok(self.head)
        }

        async fn block_transactions(&self, number: u64) -> eyre::Result<Vec<String>> {
            self.blocks
                .get(&number)
                .cloned()
                .ok_or_else(|| eyre::eyre!("block {} unavailable", number))
        }

        async fn transaction_receipt(&self, tx_hash: &str) -> eyre::Result<Receipt> {
            if self.failing_receipts.contains(tx_hash) {
                return Err(eyre::eyre!("connection reset"));
            }
            self.receipts
                .get(tx_hash)
                .cloned()
                .ok_or_else(|| eyre::eyre!("unknown tx {}", tx_hash))
        }
    }

    fn token_receipt(tx_hash: &str, logs: Vec<Log>) -> Receipt {
        Receipt {
            tx_hash: tx_hash.into(),
            to: Some(format!("{:#x}", TOKEN)),
            logs,
        }
    }

    fn listener(chain: FakeChain) -> (BlockListener, Ledger) {
        let ledger = Ledger::new(Arc::new(Mutex::new(db::open_in_memory().unwrap())));
        let listener = BlockListener::new(
            Arc::new(chain),
            ledger.clone(),
            Arc::new(LogNotifier),
            Classifier::new(TOKEN, 18),
            Duration::from_secs(1),
            4,
        );
        (listener, ledger)
    }

    fn addr(a: Address) -> String {
        format!("0x{:x}", a)
    }

    #[tokio::test]
    async fn receipt_failure_does_not_block_siblings() {
        let mut chain = FakeChain::default();
        chain.blocks.insert(10, vec!["0xa1".into(), "0xb2".into(), "0xc3".into()]);
        chain.receipts.insert(
            "0xa1".into(),
            token_receipt("0xa1", vec![transfer_log(TOKEN, ALICE, BOB, ether(100))]),
        );
        chain.failing_receipts.insert("0xb2".into());
        chain.receipts.insert(
            "0xc3".into(),
            token_receipt("0xc3", vec![transfer_log(TOKEN, CAROL, BOB, ether(40))]),
        );

        let (listener, ledger) = listener(chain);
        let summary = listener.process_block(10).await;

        assert_eq!(summary.receipt_failures, 1);
        assert_eq!(summary.recorded, 2);
        assert!(ledger.transaction("0xa1").await.unwrap().is_some());
        assert!(ledger.transaction("0xb2").await.unwrap().is_none());
        assert!(ledger.transaction("0xc3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn skips_receipts_not_sent_to_the_token() {
        let mut chain = FakeChain::default();
        chain.blocks.insert(11, vec!["0x01".into(), "0x02".into()]);
        // a router call emitting a token Transfer is not a direct token call
        chain.receipts.insert(
            "0x01".into(),
            Receipt {
                tx_hash: "0x01".into(),
                to: Some(addr(CAROL)),
                logs: vec![transfer_log(TOKEN, ALICE, BOB, ether(9))],
            },
        );
        chain.receipts.insert(
            "0x02".into(),
            Receipt {
                tx_hash: "0x02".into(),
                to: None,
                logs: vec![],
            },
        );

        let (listener, ledger) = listener(chain);
        let summary = listener.process_block(11).await;

        assert_eq!(summary.token_receipts, 0);
        assert_eq!(summary.transfers, 0);
        assert!(ledger.balances_for(&addr(ALICE)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_log_does_not_block_sibling_logs() {
        let mut broken = transfer_log(TOKEN, ALICE, BOB, ether(1));
        broken.data = "0xzz".into();

        let mut chain = FakeChain::default();
        chain.blocks.insert(12, vec!["0x0c".into()]);
        chain.receipts.insert(
            "0x0c".into(),
            token_receipt("0x0c", vec![broken, transfer_log(TOKEN, ALICE, BOB, ether(3))]),
        );

        let (listener, ledger) = listener(chain);
        let summary = listener.process_block(12).await;

        assert_eq!(summary.transfers, 1);
        assert_eq!(summary.recorded, 1);
        assert_eq!(
            ledger.balances_for(&addr(ALICE)).await.unwrap()[0].total_amount,
            Decimal::new(3, 0)
        );
    }

    #[tokio::test]
    async fn missing_block_is_skipped() {
        let (listener, _) = listener(FakeChain::default());
        let summary = listener.process_block(99).await;
        assert!(summary.skipped);
        assert_eq!(summary.transactions, 0);
    }

    #[tokio::test]
    async fn reprocessing_a_block_is_idempotent() {
        let mut chain = FakeChain::default();
        chain.blocks.insert(13, vec!["0x0d".into()]);
        chain.receipts.insert(
            "0x0d".into(),
            token_receipt("0x0d", vec![transfer_log(TOKEN, ALICE, BOB, ether(300))]),
        );

        let (listener, ledger) = listener(chain);
        assert_eq!(listener.process_block(13).await.recorded, 1);
        let second = listener.process_block(13).await;
        assert_eq!(second.recorded, 0);
        assert_eq!(second.duplicates, 1);

        assert_eq!(
            ledger.balances_for(&addr(ALICE)).await.unwrap()[0].total_amount,
            Decimal::new(300, 0)
        );
    }

    #[tokio::test]
    async fn oversized_transfer_is_counted_not_recorded() {
        let mut chain = FakeChain::default();
        chain.blocks.insert(14, vec!["0x0e".into()]);
        chain.receipts.insert(
            "0x0e".into(),
            token_receipt(
                "0x0e",
                vec![transfer_log(TOKEN, ALICE, BOB, ether(100_000_000_000))],
            ),
        );

        let (listener, ledger) = listener(chain);
        let summary = listener.process_block(14).await;

        assert_eq!(summary.transfers, 1);
        assert_eq!(summary.out_of_range, 1);
        assert_eq!(summary.recorded, 0);
        assert!(ledger.transaction("0x0e").await.unwrap().is_none());
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        assert_eq!(next_backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(100)), MAX_BACKOFF);
        assert_eq!(next_backoff(Duration::MAX), Duration::MAX);
    }

    #[test]
    fn ready_range_respects_confirmations() {
        assert_eq!(ready_range(100, 105, 2), Some(100..=103));
        assert_eq!(ready_range(104, 105, 2), None);
        assert_eq!(ready_range(0, 1, 2), None);
        assert_eq!(ready_range(7, 7, 0), Some(7..=7));
    }

    #[tokio::test]
    async fn run_processes_ready_blocks_and_drains_on_shutdown() {
        let mut chain = FakeChain {
            head: 3,
            ..Default::default()
        };
        for n in 1..=3 {
            chain.blocks.insert(n, vec![format!("0x{:02x}", n)]);
            chain.receipts.insert(
                format!("0x{:02x}", n),
                token_receipt(&format!("0x{:02x}", n), vec![transfer_log(TOKEN, ALICE, BOB, ether(10))]),
            );
        }

        let (listener, ledger) = listener(chain);
        let listener = Arc::new(listener);
        let (stop_tx, stop_rx) = watch::channel(false);

        let settings = PollSettings {
            poll_interval: Duration::from_millis(10),
            confirmations: 1,
            queue_capacity: 4,
            start_block: Some(1),
        };
        let handle = tokio::spawn(run(Arc::clone(&listener), settings, stop_rx));

        // blocks 1 and 2 are final at head 3 with one confirmation
        for _ in 0..200 {
            if ledger.last_processed_block().await.unwrap() == Some(2) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(ledger.last_processed_block().await.unwrap(), Some(2));
        assert!(ledger.transaction("0x03").await.unwrap().is_none());
        assert_eq!(
            ledger.balances_for(&addr(ALICE)).await.unwrap()[0].total_amount,
            Decimal::new(20, 0)
        );
    }

    #[tokio::test]
    async fn run_survives_chain_outage_at_startup() {
        let mut chain = FakeChain {
            head: 5,
            head_outages: AtomicUsize::new(3),
            ..Default::default()
        };
        chain.blocks.insert(4, vec!["0x04".into()]);
        chain.receipts.insert(
            "0x04".into(),
            token_receipt("0x04", vec![transfer_log(TOKEN, ALICE, BOB, ether(10))]),
        );

        let (listener, ledger) = listener(chain);
        let (stop_tx, stop_rx) = watch::channel(false);

        // no cursor and no start block: the start comes from the head
        let settings = PollSettings {
            poll_interval: Duration::from_millis(5),
            confirmations: 1,
            queue_capacity: 4,
            start_block: None,
        };
        let handle = tokio::spawn(run(Arc::new(listener), settings, stop_rx));

        for _ in 0..300 {
            if ledger.last_processed_block().await.unwrap() == Some(4) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_finished());

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(ledger.last_processed_block().await.unwrap(), Some(4));
        assert!(ledger.transaction("0x04").await.unwrap().is_some());
    }
}
