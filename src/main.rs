use reward_indexer::{
    api::{self, AppState},
    classifier::Classifier,
    config, db,
    disburse::{Disburser, WalletPayout},
    ledger::Ledger,
    listener::{self, BlockListener, PollSettings},
    notify::{LogNotifier, Notifier, WebhookNotifier},
    rpc::RpcClient,
};
use std::sync::{Arc, Mutex};
use tokio::{signal, sync::watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Reward indexer starting...");

    let cfg = config::load()?;

    // Run DB migrations once at startup
    let conn = db::connect(&cfg.db_path)?;
    db::run_migrations(&conn)?;
    let ledger = Ledger::new(Arc::new(Mutex::new(conn)));

    let chain = Arc::new(RpcClient::new(&cfg.rpc_http_url, cfg.receipt_timeout)?);

    let notifier: Arc<dyn Notifier> = match &cfg.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(LogNotifier),
    };

    let disburser = match &cfg.private_key {
        Some(key) => {
            let payout = WalletPayout::new(
                &cfg.rpc_http_url,
                key.expose(),
                cfg.reward_token,
                cfg.payout_confirmations,
                cfg.payout_timeout,
            )?;
            Some(Arc::new(Disburser::new(
                ledger.clone(),
                Arc::new(payout),
                cfg.reward_threshold,
                cfg.reward_base_units()?,
            )))
        }
        None => {
            warn!("PRIVATE_KEY not set, disbursement disabled");
            None
        }
    };

    let block_listener = Arc::new(BlockListener::new(
        chain,
        ledger.clone(),
        notifier,
        Classifier::new(cfg.watched_token, cfg.token_decimals),
        cfg.receipt_timeout,
        cfg.receipt_concurrency,
    ));
    let settings = PollSettings {
        poll_interval: cfg.poll_interval,
        confirmations: cfg.confirmations,
        queue_capacity: cfg.block_queue_capacity,
        start_block: cfg.start_block,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut api_handle = tokio::spawn({
        let state = AppState { ledger, disburser };
        let port = cfg.port;
        let mut stop = shutdown_rx.clone();
        async move {
            api::serve(port, state, async move {
                let _ = stop.changed().await;
            })
            .await
        }
    });

    let mut listener_handle = tokio::spawn(listener::run(block_listener, settings, shutdown_rx));

    tokio::select! {
        res = &mut api_handle => match res {
            Ok(Ok(_)) => info!("API exited cleanly"),
            Ok(Err(e)) => error!("API error: {:?}", e),
            Err(e) => error!("API task panicked: {:?}", e),
        },
        res = &mut listener_handle => match res {
            Ok(Ok(_)) => info!("Listener exited cleanly"),
            Ok(Err(e)) => error!("Listener error: {:?}", e),
            Err(e) => error!("Listener task panicked: {:?}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, draining queued blocks...");
        }
    }

    let _ = shutdown_tx.send(true);
    for (name, handle) in [("API", api_handle), ("Listener", listener_handle)] {
        if handle.is_finished() {
            continue;
        }
        match handle.await {
            Ok(Ok(_)) => info!("{} stopped", name),
            Ok(Err(e)) => error!("{} error during shutdown: {:?}", name, e),
            Err(e) => error!("{} task panicked: {:?}", name, e),
        }
    }

    info!("Reward indexer stopped.");
    Ok(())
}
