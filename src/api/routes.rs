//! Route handlers.
//!
//! Handlers stay thin: extract, call the engine, serialize. All domain rules
//! live in the engines; all status-code mapping lives in `CoreError`.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    middleware,
    response::Json,
    routing::{get, post},
    Extension, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::auth::{auth_middleware, JwtHandler, Principal};
use crate::engine::{
    InitiateRequest, ReconciliationEngine, RefundEngine, RejectionRequest, SelectionEngine,
};
use crate::error::{CoreError, CoreResult};
use crate::gateway::WebhookEvent;
use crate::ledger::{new_ad, new_pending_selection, LedgerDb};
use crate::models::{Ad, MonthlyEarnings, Payment, Selection, Withdrawal};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: LedgerDb,
    pub selections: SelectionEngine,
    pub reconcile: ReconciliationEngine,
    pub refunds: RefundEngine,
}

/// Create the API router. Webhook and transfer-callback routes are
/// unauthenticated (the gateway calls them); everything else requires a
/// bearer token.
pub fn create_router(state: AppState, jwt: Arc<JwtHandler>) -> Router {
    let authed = Router::new()
        .route("/api/ads", post(create_ad))
        .route(
            "/api/ads/:ad_id/selections/:website_id/approve",
            post(approve_selection),
        )
        .route("/api/ads/:ad_id/selections/reject", post(reject_selection))
        .route("/api/payments/initiate", post(initiate_payment))
        .route("/api/refunds", get(get_available_refunds))
        .route("/api/withdrawals", post(initiate_withdrawal))
        .route("/api/withdrawals/eligibility", get(withdrawal_eligibility))
        .route("/api/earnings/monthly", get(monthly_earnings))
        .layer(middleware::from_fn_with_state(jwt, auth_middleware));

    let public = Router::new()
        .route("/health", get(health_check))
        .route("/api/payments/verify", get(verify_payment))
        .route("/api/payments/webhook", post(payment_webhook))
        .route("/api/withdrawals/callback", post(withdrawal_callback))
        .route("/api/ads/:ad_id/view", post(record_view))
        .route("/api/ads/:ad_id/click", post(record_click));

    public.merge(authed).with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
struct CreateAdRequest {
    title: String,
    image_url: Option<String>,
    video_url: Option<String>,
    document_url: Option<String>,
    business_name: Option<String>,
    target_url: Option<String>,
    selections: Vec<CreateSelection>,
}

#[derive(Deserialize)]
struct CreateSelection {
    website_id: String,
    category_ids: Vec<String>,
}

#[derive(Serialize)]
struct AdResponse {
    ad: Ad,
    selections: Vec<Selection>,
}

async fn create_ad(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CreateAdRequest>,
) -> CoreResult<Json<AdResponse>> {
    if req.title.trim().is_empty() {
        return Err(CoreError::Validation("ad title is required".into()));
    }
    if req.selections.is_empty() {
        return Err(CoreError::Validation(
            "an ad needs at least one selection".into(),
        ));
    }
    for sel in &req.selections {
        if sel.category_ids.is_empty() {
            return Err(CoreError::Validation(format!(
                "selection for site {} has no categories",
                sel.website_id
            )));
        }
    }

    let mut ad = new_ad(&principal.user_id, req.title.trim());
    ad.image_url = req.image_url;
    ad.video_url = req.video_url;
    ad.document_url = req.document_url;
    ad.business_name = req.business_name;
    ad.target_url = req.target_url;

    let selections: Vec<Selection> = req
        .selections
        .iter()
        .map(|s| new_pending_selection(&ad.id, &s.website_id, s.category_ids.clone()))
        .collect();
    state.db.create_ad(&ad, &selections).await?;

    Ok(Json(AdResponse { ad, selections }))
}

async fn approve_selection(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((ad_id, website_id)): Path<(String, String)>,
) -> CoreResult<Json<Selection>> {
    let selection = state
        .selections
        .approve(&principal, &ad_id, &website_id)
        .await?;
    Ok(Json(selection))
}

#[derive(Deserialize)]
struct RejectBody {
    website_id: String,
    category_id: String,
    reason: String,
}

async fn reject_selection(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(ad_id): Path<String>,
    Json(body): Json<RejectBody>,
) -> CoreResult<Json<Payment>> {
    let payment = state
        .selections
        .reject(
            &principal,
            &RejectionRequest {
                ad_id,
                website_id: body.website_id,
                category_id: body.category_id,
                reason: body.reason,
            },
        )
        .await?;
    Ok(Json(payment))
}

#[derive(Deserialize)]
struct InitiateBody {
    ad_id: String,
    website_id: String,
    category_id: String,
    amount: f64,
    payer_email: String,
}

#[derive(Serialize)]
struct InitiateResponse {
    payment: Payment,
    payment_link: Option<String>,
    refund_applied: f64,
    amount_due: f64,
}

async fn initiate_payment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<InitiateBody>,
) -> CoreResult<Json<InitiateResponse>> {
    let outcome = state
        .reconcile
        .initiate(
            &principal,
            &InitiateRequest {
                ad_id: body.ad_id,
                website_id: body.website_id,
                category_id: body.category_id,
                amount: body.amount,
                payer_email: body.payer_email,
            },
        )
        .await?;
    Ok(Json(InitiateResponse {
        payment: outcome.payment,
        payment_link: outcome.payment_link,
        refund_applied: outcome.refund_applied,
        amount_due: outcome.amount_due,
    }))
}

#[derive(Deserialize)]
struct VerifyQuery {
    /// Internal tx_ref or the gateway transaction id.
    reference: String,
}

async fn verify_payment(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> CoreResult<Json<Payment>> {
    let payment = state.reconcile.verify(&query.reference).await?;
    Ok(Json(payment))
}

async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<WebhookEvent>,
) -> CoreResult<Json<serde_json::Value>> {
    let signature = headers.get("verif-hash").and_then(|h| h.to_str().ok());
    let settled = state.reconcile.handle_webhook(signature, &event).await?;
    Ok(Json(json!({ "processed": settled.is_some() })))
}

#[derive(Serialize)]
struct RefundsResponse {
    total_available: f64,
    refunds: Vec<Payment>,
}

async fn get_available_refunds(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> CoreResult<Json<RefundsResponse>> {
    let (refunds, total_available) = state.refunds.available_refunds(&principal.user_id).await?;
    Ok(Json(RefundsResponse {
        total_available,
        refunds,
    }))
}

#[derive(Deserialize)]
struct WithdrawBody {
    amount: f64,
    destination: String,
}

async fn initiate_withdrawal(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<WithdrawBody>,
) -> CoreResult<Json<Withdrawal>> {
    let withdrawal = state
        .refunds
        .initiate_withdrawal(&principal, body.amount, &body.destination)
        .await?;
    Ok(Json(withdrawal))
}

#[derive(Deserialize)]
struct WithdrawalCallbackBody {
    transfer_id: String,
    status: String,
}

async fn withdrawal_callback(
    State(state): State<AppState>,
    Json(body): Json<WithdrawalCallbackBody>,
) -> CoreResult<Json<Withdrawal>> {
    let withdrawal = state
        .refunds
        .withdrawal_callback(&body.transfer_id, &body.status)
        .await?;
    Ok(Json(withdrawal))
}

async fn withdrawal_eligibility(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> CoreResult<Json<crate::engine::WithdrawalEligibility>> {
    let eligibility = state
        .refunds
        .check_withdrawal_eligibility(&principal.user_id)
        .await?;
    Ok(Json(eligibility))
}

#[derive(Serialize)]
struct EarningsResponse {
    months: Vec<MonthlyEarnings>,
}

async fn monthly_earnings(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> CoreResult<Json<EarningsResponse>> {
    let months = state.refunds.monthly_earnings(&principal.user_id).await?;
    Ok(Json(EarningsResponse { months }))
}

async fn record_view(
    State(state): State<AppState>,
    Path(ad_id): Path<String>,
) -> CoreResult<Json<serde_json::Value>> {
    state.db.record_ad_view(&ad_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn record_click(
    State(state): State<AppState>,
    Path(ad_id): Path<String>,
) -> CoreResult<Json<serde_json::Value>> {
    state.db.record_ad_click(&ad_id).await?;
    Ok(Json(json!({ "ok": true })))
}
