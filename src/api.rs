use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::disburse::Disburser;
use crate::error::ApiError;
use crate::ledger::Ledger;
use crate::models::{BalanceRecord, TotalDrift};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    /// `None` when no payout key is configured.
    pub disburser: Option<Arc<Disburser>>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Reward indexer API running" }))
        .route("/transfer-history/:address", get(transfer_history))
        .route("/disburse", post(disburse))
        .route("/ledger/audit", get(audit))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(
    port: u16,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> eyre::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn transfer_history(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Vec<BalanceRecord>>, ApiError> {
    Ok(Json(state.ledger.balances_for(&address).await?))
}

async fn disburse(State(state): State<AppState>) -> Result<String, ApiError> {
    let disburser = state.disburser.ok_or(ApiError::DisbursementDisabled)?;
    let report = disburser.run().await?;
    Ok(report.to_string())
}

async fn audit(State(state): State<AppState>) -> Result<Json<Vec<TotalDrift>>, ApiError> {
    Ok(Json(state.ledger.audit_totals().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::disburse::tests::FakePayout;
    use crate::models::{TransactionRecord, TransferEvent};
    use alloy::primitives::U256;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use rust_decimal::Decimal;
    use std::sync::Mutex;
    use tower::ServiceExt;

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(Mutex::new(db::open_in_memory().unwrap())))
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unknown_address_returns_empty_list() {
        let app = router(AppState {
            ledger: ledger(),
            disburser: None,
        });

        let resp = app
            .oneshot(
                Request::get("/transfer-history/0xnobody")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn history_lookup_is_case_insensitive() {
        let ledger = ledger();
        let event = TransferEvent {
            from: "0xAbC".into(),
            to: "0xdef".into(),
            amount: Decimal::new(300, 0),
        };
        ledger
            .record_transfer(TransactionRecord::new("0x1", Some(1), &event))
            .await
            .unwrap();

        let app = router(AppState {
            ledger,
            disburser: None,
        });
        let resp = app
            .oneshot(Request::get("/transfer-history/0xABC").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = body_json(resp).await;
        assert_eq!(json[0]["address"], "0xabc");
        assert_eq!(json[0]["total_amount"], "300");
        assert_eq!(json[0]["status"], "Unpaid");
    }

    #[tokio::test]
    async fn disburse_without_key_is_unavailable() {
        let app = router(AppState {
            ledger: ledger(),
            disburser: None,
        });

        let resp = app
            .oneshot(Request::post("/disburse").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["code"], "DISBURSEMENT_DISABLED");
    }

    #[tokio::test]
    async fn disburse_returns_plain_text_summary() {
        let ledger = ledger();
        let disburser = Disburser::new(
            ledger.clone(),
            Arc::new(FakePayout::default()),
            Decimal::new(500, 0),
            U256::from(1u64),
        );
        let app = router(AppState {
            ledger,
            disburser: Some(Arc::new(disburser)),
        });

        let resp = app
            .oneshot(Request::post("/disburse").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "Disbursement complete: 0 eligible, 0 paid, 0 failed"
        );
    }

    #[tokio::test]
    async fn audit_is_empty_for_consistent_ledger() {
        let app = router(AppState {
            ledger: ledger(),
            disburser: None,
        });
        let resp = app
            .oneshot(Request::get("/ledger/audit").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }
}
