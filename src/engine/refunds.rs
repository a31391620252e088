//! Refund pool and withdrawal engine.
//!
//! Internal refunds move money wallet-to-wallet inside the caller's
//! transaction; the FIFO refund plan is a pure computation whose result the
//! caller applies transactionally, so concurrent initiations cannot
//! double-book a credit.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{CoreError, CoreResult};
use crate::gateway::{GatewayTxStatus, PaymentGateway, TransferRequest};
use crate::ledger::{rows, LedgerDb};
use crate::models::{
    LedgerEntryKind, Payment, PaymentStatus, RefundSource, WalletKind, Withdrawal,
    WithdrawalStatus, AMOUNT_TOLERANCE, DEFAULT_CURRENCY,
};

/// Days an owner must wait between payouts.
pub const WITHDRAWAL_COOLDOWN_DAYS: i64 = 30;

/// Result of walking the FIFO refund pool against a required amount.
#[derive(Debug, Clone, PartialEq)]
pub struct RefundPlan {
    /// Total credit consumed from the pool.
    pub applied: f64,
    /// Amount that must still be charged externally.
    pub still_owed: f64,
    /// (source payment, amount consumed) pairs, oldest first.
    pub sources: Vec<RefundSource>,
}

/// Walk the refund pool oldest-first, partially consuming the last credit if
/// it exceeds the remaining requirement. Pure: performs no writes.
pub fn plan_refund_application(pool: &[Payment], required: f64) -> RefundPlan {
    let mut remaining = required.max(0.0);
    let mut applied = 0.0;
    let mut sources = Vec::new();

    for refund in pool {
        if remaining <= AMOUNT_TOLERANCE {
            break;
        }
        let credit = refund.refund_credit_remaining();
        if credit <= AMOUNT_TOLERANCE {
            continue;
        }
        let used = credit.min(remaining);
        sources.push(RefundSource {
            payment_id: refund.id.clone(),
            amount: used,
        });
        applied += used;
        remaining -= used;
    }

    RefundPlan {
        applied,
        still_owed: remaining.max(0.0),
        sources,
    }
}

/// Transaction-scoped internal refund for a rejected payment.
///
/// Self-dealing (owner paying themselves) only flags the payment: no money
/// actually changed sides, so there is nothing to move back.
pub fn process_internal_refund(
    tx: &rusqlite::Transaction<'_>,
    payment: &Payment,
    reason: &str,
    now: chrono::DateTime<Utc>,
) -> CoreResult<()> {
    if payment.status.is_refund_processed() {
        return Err(CoreError::StateConflict(format!(
            "payment {} has already been refund-processed",
            payment.id
        )));
    }

    if payment.web_owner_id == payment.advertiser_id {
        rows::mark_payment_refunded(
            tx,
            &payment.id,
            PaymentStatus::InternallyRefunded,
            now,
            reason,
        )?;
        tracing::info!(payment_id = %payment.id, "self-dealing rejection, flagged internally_refunded");
        return Ok(());
    }

    let amount = payment.amount;
    let owner_wallet = rows::get_or_create_wallet(tx, &payment.web_owner_id, WalletKind::WebOwner, now)?;
    if owner_wallet.balance + AMOUNT_TOLERANCE < amount {
        return Err(CoreError::InsufficientBalance {
            available: owner_wallet.balance,
            required: amount,
        });
    }
    let advertiser_wallet =
        rows::get_or_create_wallet(tx, &payment.advertiser_id, WalletKind::Advertiser, now)?;

    rows::adjust_wallet(tx, &owner_wallet.id, -amount, 0.0, 0.0, 0.0, now)?;
    rows::adjust_owner_available(tx, &payment.web_owner_id, -amount, now)?;
    rows::adjust_wallet(tx, &advertiser_wallet.id, amount, 0.0, 0.0, amount, now)?;

    let debit_id = rows::insert_wallet_entry(
        tx,
        &owner_wallet.id,
        Some(&payment.id),
        Some(&payment.ad_id),
        -amount,
        LedgerEntryKind::RefundDebit,
        None,
        Some(reason),
        now,
    )?;
    let credit_id = rows::insert_wallet_entry(
        tx,
        &advertiser_wallet.id,
        Some(&payment.id),
        Some(&payment.ad_id),
        amount,
        LedgerEntryKind::RefundCredit,
        Some(debit_id),
        Some(reason),
        now,
    )?;
    rows::link_wallet_entries(tx, debit_id, credit_id)?;

    rows::mark_payment_refunded(tx, &payment.id, PaymentStatus::Refunded, now, reason)?;
    tracing::info!(
        payment_id = %payment.id,
        amount,
        web_owner = %payment.web_owner_id,
        advertiser = %payment.advertiser_id,
        "internal refund applied"
    );
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalEligibility {
    pub eligible: bool,
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct RefundEngine {
    db: LedgerDb,
    gateway: Arc<dyn PaymentGateway>,
}

impl RefundEngine {
    pub fn new(db: LedgerDb, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { db, gateway }
    }

    /// The advertiser's unused refund pool, oldest first, with the total
    /// credit still available.
    pub async fn available_refunds(&self, advertiser_id: &str) -> CoreResult<(Vec<Payment>, f64)> {
        let pool = self
            .db
            .with_conn(|conn| rows::list_available_refunds(conn, advertiser_id))
            .await?;
        let total = pool.iter().map(|p| p.refund_credit_remaining()).sum();
        Ok((pool, total))
    }

    /// Payout gate: some tracker must have reached its view threshold AND the
    /// 30-day cooldown since the last withdrawal (or the initial payment)
    /// must have elapsed. Independent of balance.
    pub async fn check_withdrawal_eligibility(
        &self,
        owner_id: &str,
    ) -> CoreResult<WithdrawalEligibility> {
        let trackers = self
            .db
            .with_conn(|conn| rows::list_trackers(conn, owner_id))
            .await?;
        if trackers.is_empty() {
            return Ok(WithdrawalEligibility {
                eligible: false,
                reason: Some("no confirmed payments to withdraw against".into()),
            });
        }

        let now = Utc::now();
        let cooldown = Duration::days(WITHDRAWAL_COOLDOWN_DAYS);
        let mut views_pending = false;
        let mut cooldown_active = false;
        for tracker in &trackers {
            let views_ok = tracker.current_views >= tracker.views_required;
            let anchor = tracker.last_withdrawal_date.unwrap_or(tracker.payment_date);
            let cooldown_ok = now - anchor >= cooldown;
            if views_ok && cooldown_ok {
                return Ok(WithdrawalEligibility {
                    eligible: true,
                    reason: None,
                });
            }
            views_pending |= !views_ok;
            cooldown_active |= !cooldown_ok;
        }

        let reason = if views_pending && !cooldown_active {
            "required ad views not yet reached"
        } else if cooldown_active && !views_pending {
            "withdrawal cooldown has not elapsed"
        } else {
            "required ad views not reached and withdrawal cooldown active"
        };
        Ok(WithdrawalEligibility {
            eligible: false,
            reason: Some(reason.to_string()),
        })
    }

    /// Start a payout. The gateway transfer happens first; the `processing`
    /// row and the `available_balance` debit commit together afterwards, so a
    /// declined transfer persists nothing.
    pub async fn initiate_withdrawal(
        &self,
        principal: &Principal,
        amount: f64,
        destination: &str,
    ) -> CoreResult<Withdrawal> {
        if amount <= 0.0 {
            return Err(CoreError::Validation(
                "withdrawal amount must be positive".into(),
            ));
        }
        let destination = destination.trim();
        let digits = destination.chars().filter(|c| c.is_ascii_digit()).count();
        if digits < 6 || !destination.chars().all(|c| c.is_ascii_digit() || "+- ".contains(c)) {
            return Err(CoreError::Validation(
                "destination must be a phone or account number".into(),
            ));
        }

        let eligibility = self.check_withdrawal_eligibility(&principal.user_id).await?;
        if !eligibility.eligible {
            return Err(CoreError::StateConflict(
                eligibility
                    .reason
                    .unwrap_or_else(|| "not eligible for withdrawal".into()),
            ));
        }

        let available = self
            .db
            .with_conn(|conn| rows::get_owner_balance(conn, &principal.user_id))
            .await?
            .map(|b| b.available_balance)
            .unwrap_or(0.0);
        if available + AMOUNT_TOLERANCE < amount {
            return Err(CoreError::InsufficientBalance {
                available,
                required: amount,
            });
        }

        let reference = format!("WD-{}", Uuid::new_v4());
        let transfer = self
            .gateway
            .initiate_transfer(&TransferRequest {
                reference: reference.clone(),
                amount,
                currency: DEFAULT_CURRENCY.to_string(),
                destination: destination.to_string(),
                narration: "ad marketplace payout".to_string(),
            })
            .await?;
        if transfer.status == GatewayTxStatus::Failed {
            return Err(CoreError::gateway_rejected(
                "gateway declined the transfer request",
            ));
        }

        let owner_id = principal.user_id.clone();
        let destination = destination.to_string();
        let transfer_id = transfer.transfer_id.clone();
        self.db
            .with_tx(move |tx| {
                let available = rows::get_owner_balance(tx, &owner_id)?
                    .map(|b| b.available_balance)
                    .unwrap_or(0.0);
                if available + AMOUNT_TOLERANCE < amount {
                    return Err(CoreError::InsufficientBalance {
                        available,
                        required: amount,
                    });
                }
                let now = Utc::now();
                let withdrawal = Withdrawal {
                    id: Uuid::new_v4().to_string(),
                    owner_id: owner_id.clone(),
                    amount,
                    destination,
                    status: WithdrawalStatus::Processing,
                    gateway_transfer_id: Some(transfer_id),
                    failure_reason: None,
                    created_at: now,
                    completed_at: None,
                };
                rows::insert_withdrawal(tx, &withdrawal)?;
                rows::adjust_owner_available(tx, &owner_id, -amount, now)?;
                tracing::info!(
                    withdrawal_id = %withdrawal.id,
                    owner = %owner_id,
                    amount,
                    "withdrawal initiated"
                );
                Ok(withdrawal)
            })
            .await
    }

    /// Idempotent terminal update from the gateway's transfer callback. A
    /// withdrawal already in a terminal state short-circuits with no further
    /// mutation, so duplicate failure callbacks cannot double-refund.
    pub async fn withdrawal_callback(
        &self,
        transfer_id: &str,
        status: &str,
    ) -> CoreResult<Withdrawal> {
        let status = GatewayTxStatus::parse(status);
        let transfer_id = transfer_id.to_string();
        self.db
            .with_tx(move |tx| {
                let withdrawal = rows::find_withdrawal_by_transfer(tx, &transfer_id)?
                    .ok_or_else(|| {
                        CoreError::NotFound(format!("no withdrawal for transfer {transfer_id}"))
                    })?;
                if withdrawal.status.is_terminal() {
                    return Ok(withdrawal);
                }

                let now = Utc::now();
                match status {
                    GatewayTxStatus::Successful => {
                        rows::finalize_withdrawal(
                            tx,
                            &withdrawal.id,
                            WithdrawalStatus::Completed,
                            None,
                            now,
                        )?;
                        rows::set_owner_trackers_withdrawn(tx, &withdrawal.owner_id, now)?;
                        tracing::info!(withdrawal_id = %withdrawal.id, "withdrawal completed");
                    }
                    GatewayTxStatus::Failed => {
                        rows::finalize_withdrawal(
                            tx,
                            &withdrawal.id,
                            WithdrawalStatus::Failed,
                            Some("gateway reported transfer failure"),
                            now,
                        )?;
                        rows::adjust_owner_available(
                            tx,
                            &withdrawal.owner_id,
                            withdrawal.amount,
                            now,
                        )?;
                        tracing::warn!(withdrawal_id = %withdrawal.id, "withdrawal failed, balance restored");
                    }
                    GatewayTxStatus::Pending => return Ok(withdrawal),
                }

                rows::find_withdrawal_by_transfer(tx, &transfer_id)?.ok_or_else(|| {
                    CoreError::NotFound(format!("no withdrawal for transfer {transfer_id}"))
                })
            })
            .await
    }

    /// Monthly earnings report for an owner (group-by-month SUM).
    pub async fn monthly_earnings(
        &self,
        owner_id: &str,
    ) -> CoreResult<Vec<crate::models::MonthlyEarnings>> {
        self.db.monthly_earnings(owner_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn refunded_payment(id: &str, amount: f64, used: f64, refunded_secs_ago: i64) -> Payment {
        let now = Utc::now();
        Payment {
            id: id.to_string(),
            tx_ref: format!("AD-{id}"),
            gateway_tx_id: None,
            ad_id: "ad-1".into(),
            website_id: "site-1".into(),
            category_id: "cat-1".into(),
            advertiser_id: "adv-1".into(),
            web_owner_id: "owner-1".into(),
            amount,
            currency: DEFAULT_CURRENCY.to_string(),
            status: PaymentStatus::Refunded,
            paid_at: None,
            rejection_deadline: None,
            is_rejectable: false,
            refund_applied: 0.0,
            refund_usage_amount: used,
            refund_used: false,
            refund_used_at: None,
            refund_used_for_payment: None,
            refund_sources: vec![],
            refunded_at: Some(now - Duration::seconds(refunded_secs_ago)),
            refund_reason: Some("test".into()),
            gateway_payload: None,
            created_at: now,
        }
    }

    #[test]
    fn fifo_consumes_oldest_first_and_splits_the_last_credit() {
        // R1 ($30, older) and R2 ($20, newer) against a $40 requirement:
        // all of R1 and $10 of R2, leaving $10 of R2 in the pool.
        let pool = vec![
            refunded_payment("r1", 30.0, 0.0, 120),
            refunded_payment("r2", 20.0, 0.0, 60),
        ];
        let plan = plan_refund_application(&pool, 40.0);
        assert_eq!(plan.applied, 40.0);
        assert_eq!(plan.still_owed, 0.0);
        assert_eq!(
            plan.sources,
            vec![
                RefundSource { payment_id: "r1".into(), amount: 30.0 },
                RefundSource { payment_id: "r2".into(), amount: 10.0 },
            ]
        );
    }

    #[test]
    fn shortfall_is_reported_as_still_owed() {
        let pool = vec![
            refunded_payment("r1", 30.0, 0.0, 120),
            refunded_payment("r2", 20.0, 0.0, 60),
        ];
        let plan = plan_refund_application(&pool, 60.0);
        assert_eq!(plan.applied, 50.0);
        assert_eq!(plan.still_owed, 10.0);
    }

    #[test]
    fn partially_consumed_credits_only_offer_the_remainder() {
        let pool = vec![refunded_payment("r1", 30.0, 25.0, 120)];
        let plan = plan_refund_application(&pool, 40.0);
        assert_eq!(plan.applied, 5.0);
        assert_eq!(plan.still_owed, 35.0);
    }

    #[test]
    fn empty_pool_owes_everything() {
        let plan = plan_refund_application(&[], 40.0);
        assert_eq!(plan.applied, 0.0);
        assert_eq!(plan.still_owed, 40.0);
        assert!(plan.sources.is_empty());
    }
}
