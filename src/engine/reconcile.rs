//! Payment reconciliation engine.
//!
//! Turns gateway events (webhook push, redirect callback, client-triggered
//! verify) into exactly-once ledger and state updates. The idempotence guard
//! is the already-successful short-circuit re-checked INSIDE the ledger
//! transaction, so duplicate webhook deliveries and racing verify calls
//! collapse to a single activation.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::engine::refunds::plan_refund_application;
use crate::engine::selection;
use crate::error::{CoreError, CoreResult};
use crate::gateway::{ChargeRequest, GatewayTxStatus, PaymentGateway, WebhookEvent};
use crate::ledger::{rows, LedgerDb};
use crate::models::{
    LedgerEntryKind, Payment, PaymentStatus, PaymentTracker, WalletKind, AMOUNT_TOLERANCE,
    DEFAULT_CURRENCY,
};

#[derive(Debug, Clone)]
pub struct InitiateRequest {
    pub ad_id: String,
    pub website_id: String,
    pub category_id: String,
    pub amount: f64,
    pub payer_email: String,
}

#[derive(Debug, Clone)]
pub struct InitiateOutcome {
    pub payment: Payment,
    /// Hosted checkout link; `None` when the refund pool covered everything
    /// and no external charge was needed.
    pub payment_link: Option<String>,
    pub refund_applied: f64,
    pub amount_due: f64,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    db: LedgerDb,
    gateway: Arc<dyn PaymentGateway>,
    redirect_url: String,
    webhook_secret: String,
}

impl ReconciliationEngine {
    pub fn new(
        db: LedgerDb,
        gateway: Arc<dyn PaymentGateway>,
        redirect_url: String,
        webhook_secret: String,
    ) -> Self {
        Self {
            db,
            gateway,
            redirect_url,
            webhook_secret,
        }
    }

    /// Start a charge for an approved-but-unconfirmed selection.
    ///
    /// The pending Payment row (and any refund-pool consumption) commits
    /// BEFORE the gateway call, so a crash between the two cannot lose the
    /// reference. A failed gateway call triggers an explicit compensating
    /// transaction that deletes the row and hands back the consumed credit.
    pub async fn initiate(
        &self,
        principal: &Principal,
        req: &InitiateRequest,
    ) -> CoreResult<InitiateOutcome> {
        if req.amount <= 0.0 {
            return Err(CoreError::Validation("amount must be positive".into()));
        }
        if !req.payer_email.contains('@') {
            return Err(CoreError::Validation("payer email is not valid".into()));
        }

        let principal_id = principal.user_id.clone();
        let req_tx = req.clone();
        let payment = self
            .db
            .with_tx(move |tx| {
                let ad = rows::get_ad(tx, &req_tx.ad_id)?
                    .ok_or_else(|| CoreError::NotFound(format!("ad {} not found", req_tx.ad_id)))?;
                if ad.advertiser_id != principal_id {
                    return Err(CoreError::Authorization(
                        "only the ad owner may pay for a selection".into(),
                    ));
                }

                let selection = rows::get_selection(tx, &req_tx.ad_id, &req_tx.website_id)?
                    .ok_or_else(|| {
                        CoreError::NotFound(format!(
                            "no selection for ad {} on site {}",
                            req_tx.ad_id, req_tx.website_id
                        ))
                    })?;
                if !selection.approved {
                    return Err(CoreError::StateConflict(
                        "selection has not been approved by the web owner".into(),
                    ));
                }
                if selection.confirmed {
                    return Err(CoreError::StateConflict(
                        "selection has already been paid for".into(),
                    ));
                }
                if !selection.category_ids.contains(&req_tx.category_id) {
                    return Err(CoreError::Validation(format!(
                        "category {} is not part of this selection",
                        req_tx.category_id
                    )));
                }

                let category = rows::get_category(tx, &req_tx.category_id)?.ok_or_else(|| {
                    CoreError::NotFound(format!("category {} not found", req_tx.category_id))
                })?;
                if (req_tx.amount - category.price).abs() > AMOUNT_TOLERANCE {
                    return Err(CoreError::Validation(format!(
                        "amount {:.2} does not match the category price {:.2}",
                        req_tx.amount, category.price
                    )));
                }

                if rows::find_successful_payment(
                    tx,
                    &req_tx.ad_id,
                    &req_tx.website_id,
                    &req_tx.category_id,
                )?
                .is_some()
                {
                    return Err(CoreError::StateConflict(
                        "a successful payment already exists for this selection".into(),
                    ));
                }

                let now = Utc::now();
                let pool = rows::list_available_refunds(tx, &principal_id)?;
                let plan = plan_refund_application(&pool, req_tx.amount);

                let payment = Payment {
                    id: Uuid::new_v4().to_string(),
                    tx_ref: format!("AD-{}", Uuid::new_v4()),
                    gateway_tx_id: None,
                    ad_id: req_tx.ad_id.clone(),
                    website_id: req_tx.website_id.clone(),
                    category_id: req_tx.category_id.clone(),
                    advertiser_id: principal_id.clone(),
                    web_owner_id: category.owner_id.clone(),
                    amount: req_tx.amount,
                    currency: DEFAULT_CURRENCY.to_string(),
                    status: PaymentStatus::Pending,
                    paid_at: None,
                    rejection_deadline: None,
                    is_rejectable: false,
                    refund_applied: plan.applied,
                    refund_usage_amount: 0.0,
                    refund_used: false,
                    refund_used_at: None,
                    refund_used_for_payment: None,
                    refund_sources: plan.sources.clone(),
                    refunded_at: None,
                    refund_reason: None,
                    gateway_payload: None,
                    created_at: now,
                };
                rows::insert_payment(tx, &payment)?;
                for source in &plan.sources {
                    rows::apply_refund_source_usage(
                        tx,
                        &source.payment_id,
                        source.amount,
                        &payment.id,
                        now,
                    )?;
                }
                tracing::info!(
                    payment_id = %payment.id,
                    tx_ref = %payment.tx_ref,
                    refund_applied = plan.applied,
                    amount_due = payment.amount_due(),
                    "payment initiated"
                );
                Ok(payment)
            })
            .await?;

        let amount_due = payment.amount_due();
        if amount_due <= AMOUNT_TOLERANCE {
            // Entirely covered by the refund pool: no external charge.
            let payment_id = payment.id.clone();
            let finalized = self
                .db
                .with_tx(move |tx| apply_successful_payment(tx, &payment_id, None, None))
                .await?;
            return Ok(InitiateOutcome {
                refund_applied: finalized.refund_applied,
                amount_due: 0.0,
                payment: finalized,
                payment_link: None,
            });
        }

        let charge = self
            .gateway
            .initiate_charge(&ChargeRequest {
                tx_ref: payment.tx_ref.clone(),
                amount: amount_due,
                currency: payment.currency.clone(),
                customer_email: req.payer_email.clone(),
                redirect_url: self.redirect_url.clone(),
            })
            .await;

        match charge {
            Ok(outcome) => {
                if let Some(gateway_tx_id) = outcome.gateway_tx_id.as_deref() {
                    let payment_id = payment.id.clone();
                    let gateway_tx_id = gateway_tx_id.to_string();
                    self.db
                        .with_conn(move |conn| {
                            rows::set_payment_gateway_tx(conn, &payment_id, &gateway_tx_id)
                        })
                        .await?;
                }
                Ok(InitiateOutcome {
                    refund_applied: payment.refund_applied,
                    amount_due,
                    payment,
                    payment_link: Some(outcome.payment_link),
                })
            }
            Err(err) => {
                // Compensating action: remove the pending row and hand the
                // consumed refund credit back.
                let payment_id = payment.id.clone();
                let sources = payment.refund_sources.clone();
                self.db
                    .with_tx(move |tx| {
                        for source in &sources {
                            rows::release_refund_source_usage(
                                tx,
                                &source.payment_id,
                                source.amount,
                            )?;
                        }
                        rows::delete_payment(tx, &payment_id)
                    })
                    .await?;
                tracing::warn!(tx_ref = %payment.tx_ref, error = %err, "charge initiation failed, pending payment rolled back");
                Err(err)
            }
        }
    }

    /// Verify a transaction by tx_ref or gateway id and settle it exactly
    /// once. Safe to call repeatedly and concurrently.
    pub async fn verify(&self, identifier: &str) -> CoreResult<Payment> {
        let payment = self
            .db
            .find_payment_by_identifier(identifier)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("no payment matches identifier {identifier}"))
            })?;
        if payment.status == PaymentStatus::Successful || payment.status.is_refund_processed() {
            // Duplicate webhook/callback delivery: already settled.
            return Ok(payment);
        }

        let outcome = self.gateway.verify_transaction(identifier).await?;
        let raw = serde_json::to_string(&outcome.raw)?;

        if !outcome.tx_ref.is_empty() && outcome.tx_ref != payment.tx_ref {
            let payment_id = payment.id.clone();
            let raw_for_tx = raw.clone();
            self.db
                .with_tx(move |tx| {
                    fail_payment_releasing_credit(tx, &payment_id, Some(raw_for_tx.as_str()))
                })
                .await?;
            return Err(CoreError::Consistency(format!(
                "gateway reference {} does not match payment reference {}",
                outcome.tx_ref, payment.tx_ref
            )));
        }

        match outcome.status {
            GatewayTxStatus::Successful => {
                let due = payment.amount_due();
                let amount_ok = (outcome.amount - due).abs() <= AMOUNT_TOLERANCE;
                let currency_ok = outcome.currency == payment.currency;
                if !amount_ok || !currency_ok {
                    // Never silently accept a mismatched settlement.
                    let payment_id = payment.id.clone();
                    let raw_for_tx = raw.clone();
                    let already = self
                        .db
                        .with_tx(move |tx| {
                            fail_payment_releasing_credit(
                                tx,
                                &payment_id,
                                Some(raw_for_tx.as_str()),
                            )
                        })
                        .await?;
                    if let Some(settled) = already {
                        return Ok(settled);
                    }
                    return Err(CoreError::Consistency(format!(
                        "gateway reported {:.2} {}, expected {:.2} {}",
                        outcome.amount, outcome.currency, due, payment.currency
                    )));
                }

                let payment_id = payment.id.clone();
                let gateway_tx_id = outcome.gateway_tx_id.clone();
                self.db
                    .with_tx(move |tx| {
                        let gateway_tx_id =
                            (!gateway_tx_id.is_empty()).then_some(gateway_tx_id.as_str());
                        apply_successful_payment(tx, &payment_id, gateway_tx_id, Some(raw.as_str()))
                    })
                    .await
            }
            GatewayTxStatus::Failed | GatewayTxStatus::Pending => {
                let payment_id = payment.id.clone();
                let raw_for_tx = raw.clone();
                let already = self
                    .db
                    .with_tx(move |tx| {
                        fail_payment_releasing_credit(tx, &payment_id, Some(raw_for_tx.as_str()))
                    })
                    .await?;
                if let Some(settled) = already {
                    return Ok(settled);
                }
                Err(CoreError::StateConflict(format!(
                    "gateway reported transaction status {:?} for {}",
                    outcome.status, payment.tx_ref
                )))
            }
        }
    }

    /// Webhook entry point. The `verif-hash` header must equal the shared
    /// secret; a mismatch is rejected before any processing. Duplicate and
    /// out-of-order deliveries are tolerated.
    pub async fn handle_webhook(
        &self,
        signature: Option<&str>,
        event: &WebhookEvent,
    ) -> CoreResult<Option<Payment>> {
        match signature {
            Some(sig) if sig == self.webhook_secret => {}
            _ => {
                tracing::warn!("webhook rejected: bad or missing verif-hash");
                return Err(CoreError::Authorization(
                    "invalid webhook signature".into(),
                ));
            }
        }

        let identifier = if !event.data.tx_ref.is_empty() {
            event.data.tx_ref.clone()
        } else if let Some(id) = event.data.gateway_tx_id() {
            id
        } else {
            return Err(CoreError::Validation(
                "webhook carries neither tx_ref nor transaction id".into(),
            ));
        };

        tracing::info!(event = %event.event, identifier = %identifier, "webhook received");
        match self.verify(&identifier).await {
            Ok(payment) => Ok(Some(payment)),
            // Unknown reference or a charge that verified as failed: the
            // webhook is acknowledged either way, there is nothing to retry.
            Err(CoreError::NotFound(msg)) => {
                tracing::warn!("webhook ignored: {msg}");
                Ok(None)
            }
            Err(CoreError::StateConflict(msg)) => {
                tracing::info!("webhook settled no further state: {msg}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Mark a payment failed and hand any consumed refund-pool credit back to
/// its sources, in one transaction. Returns the payment when a concurrent
/// verify already settled it, so the caller can short-circuit. Clearing
/// `refund_applied` raises the externally-owed amount back to the full
/// price, which also blocks a stale success report for the reduced charge
/// from passing the amount check later. Idempotent: a payment that already
/// failed has `refund_applied == 0` and releases nothing twice.
fn fail_payment_releasing_credit(
    tx: &rusqlite::Transaction<'_>,
    payment_id: &str,
    gateway_payload: Option<&str>,
) -> CoreResult<Option<Payment>> {
    let current = rows::get_payment(tx, payment_id)?
        .ok_or_else(|| CoreError::NotFound(format!("payment {payment_id} not found")))?;
    if current.status == PaymentStatus::Successful {
        return Ok(Some(current));
    }
    rows::mark_payment_failed(tx, payment_id, gateway_payload)?;
    if current.refund_applied > 0.0 {
        for source in &current.refund_sources {
            rows::release_refund_source_usage(tx, &source.payment_id, source.amount)?;
        }
        rows::clear_payment_refund_application(tx, payment_id)?;
        tracing::info!(
            payment_id = %payment_id,
            released = current.refund_applied,
            "refund credit handed back from failed payment"
        );
    }
    Ok(None)
}

/// Apply the six success effects atomically: payment marked successful,
/// selection activated, category occupancy updated, owner wallet and balance
/// credited, ledger entry written, tracker seeded. Re-checks the payment
/// status inside the transaction so the loser of a verify race becomes a
/// no-op instead of a double credit.
fn apply_successful_payment(
    tx: &rusqlite::Transaction<'_>,
    payment_id: &str,
    gateway_tx_id: Option<&str>,
    gateway_payload: Option<&str>,
) -> CoreResult<Payment> {
    let payment = rows::get_payment(tx, payment_id)?
        .ok_or_else(|| CoreError::NotFound(format!("payment {payment_id} not found")))?;
    if payment.status == PaymentStatus::Successful {
        return Ok(payment);
    }
    if payment.status.is_refund_processed() {
        return Err(CoreError::StateConflict(
            "payment has already been refund-processed".into(),
        ));
    }

    let now = Utc::now();
    let deadline = selection::rejection_deadline_for(now);

    rows::mark_payment_successful(tx, payment_id, gateway_tx_id, gateway_payload, now, deadline)?;
    selection::confirm_payment_activation(tx, &payment, deadline, now)?;

    let category = rows::get_category(tx, &payment.category_id)?.ok_or_else(|| {
        CoreError::Consistency(format!("category {} missing for payment", payment.category_id))
    })?;
    let mut occupancy = category.selected_ads.clone();
    if !occupancy.contains(&payment.ad_id) {
        occupancy.push(payment.ad_id.clone());
    }
    rows::set_category_occupancy(tx, &payment.category_id, &occupancy)?;

    let owner_wallet =
        rows::get_or_create_wallet(tx, &payment.web_owner_id, WalletKind::WebOwner, now)?;
    rows::adjust_wallet(tx, &owner_wallet.id, payment.amount, payment.amount, 0.0, 0.0, now)?;
    rows::credit_owner_balance(tx, &payment.web_owner_id, payment.amount, now)?;
    rows::insert_wallet_entry(
        tx,
        &owner_wallet.id,
        Some(payment_id),
        Some(&payment.ad_id),
        payment.amount,
        LedgerEntryKind::Credit,
        None,
        Some("ad payment"),
        now,
    )?;

    // Advertiser spend totals; no balance movement, the charge was external.
    let advertiser_wallet =
        rows::get_or_create_wallet(tx, &payment.advertiser_id, WalletKind::Advertiser, now)?;
    rows::adjust_wallet(tx, &advertiser_wallet.id, 0.0, 0.0, payment.amount, 0.0, now)?;

    rows::insert_tracker(
        tx,
        &PaymentTracker {
            id: Uuid::new_v4().to_string(),
            owner_id: payment.web_owner_id.clone(),
            ad_id: payment.ad_id.clone(),
            category_id: payment.category_id.clone(),
            payment_id: payment_id.to_string(),
            views_required: category.views_required,
            current_views: 0,
            payment_date: now,
            last_withdrawal_date: None,
        },
    )?;

    tracing::info!(
        payment_id = %payment_id,
        amount = payment.amount,
        web_owner = %payment.web_owner_id,
        "payment settled and selection activated"
    );
    rows::get_payment(tx, payment_id)?
        .ok_or_else(|| CoreError::NotFound(format!("payment {payment_id} not found")))
}
