//! Print the watched-token transfers of one block without touching the ledger.
//!
//! Usage: scan-block [BLOCK_NUMBER]   (defaults to the latest block)

use anyhow::{anyhow, Context};
use reward_indexer::classifier::Classifier;
use reward_indexer::rpc::{ChainSource, RpcClient};
use std::{env, time::Duration};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let rpc_url = env::var("RPC_HTTP_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".to_string());
    let token = env::var("WATCHED_TOKEN_ADDRESS")
        .context("WATCHED_TOKEN_ADDRESS must be set")?
        .parse()
        .context("WATCHED_TOKEN_ADDRESS is not an address")?;
    let decimals: u8 = env::var("TOKEN_DECIMALS")
        .unwrap_or_else(|_| "18".to_string())
        .parse()
        .context("invalid TOKEN_DECIMALS")?;

    // eyre reports are not std errors, so they are flattened into anyhow here
    let client = RpcClient::new(&rpc_url, Duration::from_secs(10)).map_err(|e| anyhow!("{:#}", e))?;
    let classifier = Classifier::new(token, decimals);

    let block = match env::args().nth(1) {
        Some(arg) => arg.parse::<u64>().context("block number must be an integer")?,
        None => client
            .latest_block_number()
            .await
            .map_err(|e| anyhow!("{:#}", e))?,
    };
    println!("Scanning block {} for transfers of {:#x}", block, token);

    let tx_hashes = client
        .block_transactions(block)
        .await
        .map_err(|e| anyhow!("{:#}", e))?;
    println!("{} transactions in block", tx_hashes.len());

    let mut found = 0;
    for tx_hash in tx_hashes {
        let receipt = match client.transaction_receipt(&tx_hash).await {
            Ok(r) => r,
            Err(e) => {
                eprintln!("Receipt {} unavailable: {:#}", tx_hash, e);
                continue;
            }
        };

        for log in &receipt.logs {
            match classifier.classify(log) {
                Some(Ok(event)) => {
                    found += 1;
                    println!(
                        "Tx: {} | To contract: {} | From: {} | To: {} | Amount: {}",
                        tx_hash,
                        receipt.to.as_deref().unwrap_or("-"),
                        event.from,
                        event.to,
                        event.amount
                    );
                }
                Some(Err(e)) => {
                    found += 1;
                    println!("Tx: {} | {}", tx_hash, e);
                }
                None => {}
            }
        }
    }

    println!("{} watched-token transfers found", found);
    Ok(())
}
