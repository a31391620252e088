//! Ad selection state machine.
//!
//! Per-(ad, website) selection lifecycle: pending -> approved -> active, or
//! approved -> rejected. Rejection and its refund commit in one transaction.

use chrono::{DateTime, Duration, Utc};

use crate::auth::Principal;
use crate::engine::refunds;
use crate::error::{CoreError, CoreResult};
use crate::ledger::{rows, LedgerDb};
use crate::models::{Payment, Selection, SelectionStatus};

/// How long after payment a web owner may reject the ad.
pub const REJECTION_WINDOW_HOURS: i64 = 72;
/// Grace period appended to the rejection deadline.
pub const REJECTION_GRACE_MINUTES: i64 = 60;
/// Rejections need a substantive reason.
pub const MIN_REJECTION_REASON_LEN: usize = 10;

pub fn rejection_deadline_for(paid_at: DateTime<Utc>) -> DateTime<Utc> {
    paid_at + Duration::hours(REJECTION_WINDOW_HOURS)
}

#[derive(Debug, Clone)]
pub struct RejectionRequest {
    pub ad_id: String,
    pub website_id: String,
    pub category_id: String,
    pub reason: String,
}

#[derive(Clone)]
pub struct SelectionEngine {
    db: LedgerDb,
}

impl SelectionEngine {
    pub fn new(db: LedgerDb) -> Self {
        Self { db }
    }

    /// Approve a selection. Idempotent: re-approving an already-approved
    /// selection returns the current state unchanged. When this approval is
    /// the last one outstanding, the ad flips to confirmed.
    pub async fn approve(
        &self,
        principal: &Principal,
        ad_id: &str,
        website_id: &str,
    ) -> CoreResult<Selection> {
        let principal_id = principal.user_id.clone();
        let ad_id = ad_id.to_string();
        let website_id = website_id.to_string();
        self.db
            .with_tx(move |tx| {
                let selection = rows::get_selection(tx, &ad_id, &website_id)?.ok_or_else(|| {
                    CoreError::NotFound(format!("no selection for ad {ad_id} on site {website_id}"))
                })?;

                // Caller must own every category in the selection's set.
                // Capacity is a best-effort read-path check only; activation
                // does not re-check it.
                for category_id in &selection.category_ids {
                    let category = rows::get_category(tx, category_id)?.ok_or_else(|| {
                        CoreError::NotFound(format!("category {category_id} not found"))
                    })?;
                    if category.owner_id != principal_id {
                        return Err(CoreError::Authorization(format!(
                            "category {category_id} is not owned by the caller"
                        )));
                    }
                    if !selection.approved
                        && category.selected_ads.len() as i64 >= category.user_count
                    {
                        return Err(CoreError::StateConflict(format!(
                            "category {category_id} is at capacity"
                        )));
                    }
                }

                if selection.is_rejected {
                    return Err(CoreError::StateConflict(
                        "selection has been rejected and cannot be approved".into(),
                    ));
                }
                if selection.approved {
                    return Ok(selection);
                }

                let now = Utc::now();
                rows::approve_selection(tx, &ad_id, &website_id, now)?;

                let selections = rows::list_selections(tx, &ad_id)?;
                let all_approved = selections.iter().all(|s| s.approved);
                let ad = rows::get_ad(tx, &ad_id)?
                    .ok_or_else(|| CoreError::NotFound(format!("ad {ad_id} not found")))?;
                rows::set_ad_flags(tx, &ad_id, all_approved, ad.available_for_reassignment, now)?;

                tracing::info!(ad_id = %ad_id, website_id = %website_id, all_approved, "selection approved");
                rows::get_selection(tx, &ad_id, &website_id)?.ok_or_else(|| {
                    CoreError::NotFound(format!("no selection for ad {ad_id} on site {website_id}"))
                })
            })
            .await
    }

    /// Reject a paid selection within the rejection window and refund the
    /// advertiser. Rejection and refund either both persist or neither does.
    pub async fn reject(
        &self,
        principal: &Principal,
        req: &RejectionRequest,
    ) -> CoreResult<Payment> {
        let principal_id = principal.user_id.clone();
        let req = req.clone();
        self.db
            .with_tx(move |tx| {
                let category = rows::get_category(tx, &req.category_id)?.ok_or_else(|| {
                    CoreError::NotFound(format!("category {} not found", req.category_id))
                })?;
                if category.owner_id != principal_id {
                    return Err(CoreError::Authorization(
                        "only the category owner may reject an ad".into(),
                    ));
                }

                let selection =
                    rows::get_selection(tx, &req.ad_id, &req.website_id)?.ok_or_else(|| {
                        CoreError::NotFound(format!(
                            "no selection for ad {} on site {}",
                            req.ad_id, req.website_id
                        ))
                    })?;
                if !selection.category_ids.contains(&req.category_id) {
                    return Err(CoreError::Validation(format!(
                        "category {} is not part of this selection",
                        req.category_id
                    )));
                }
                if selection.is_rejected {
                    return Err(CoreError::StateConflict(
                        "selection has already been rejected".into(),
                    ));
                }

                if req.reason.trim().len() < MIN_REJECTION_REASON_LEN {
                    return Err(CoreError::Validation(format!(
                        "rejection reason must be at least {MIN_REJECTION_REASON_LEN} characters"
                    )));
                }

                let payment = rows::find_successful_payment(
                    tx,
                    &req.ad_id,
                    &req.website_id,
                    &req.category_id,
                )?
                .ok_or_else(|| {
                    CoreError::StateConflict(
                        "no successful payment to reject for this selection".into(),
                    )
                })?;
                if payment.status.is_refund_processed() {
                    return Err(CoreError::StateConflict(
                        "payment has already been refund-processed".into(),
                    ));
                }

                let now = Utc::now();
                let deadline = payment.rejection_deadline.ok_or_else(|| {
                    CoreError::StateConflict("payment has no rejection deadline".into())
                })?;
                if now > deadline + Duration::minutes(REJECTION_GRACE_MINUTES) {
                    return Err(CoreError::StateConflict(
                        "rejection window has closed for this payment".into(),
                    ));
                }

                rows::reject_selection_row(
                    tx,
                    &req.ad_id,
                    &req.website_id,
                    req.reason.trim(),
                    &principal_id,
                )?;

                // Ad-level flags: confirmed can no longer hold, and the ad is
                // free for reassignment only when nothing else is active.
                let selections = rows::list_selections(tx, &req.ad_id)?;
                let any_active = selections
                    .iter()
                    .any(|s| s.status == SelectionStatus::Active);
                rows::set_ad_flags(tx, &req.ad_id, false, !any_active, now)?;

                let mut occupancy = category.selected_ads.clone();
                occupancy.retain(|id| id != &req.ad_id);
                rows::set_category_occupancy(tx, &req.category_id, &occupancy)?;

                refunds::process_internal_refund(tx, &payment, req.reason.trim(), now)?;

                tracing::info!(
                    ad_id = %req.ad_id,
                    website_id = %req.website_id,
                    category_id = %req.category_id,
                    payment_id = %payment.id,
                    "selection rejected and refunded"
                );
                rows::get_payment(tx, &payment.id)?
                    .ok_or_else(|| CoreError::NotFound(format!("payment {} not found", payment.id)))
            })
            .await
    }
}

/// Activate a selection for a verified payment. Transaction-scoped; invoked
/// only by the reconciliation engine. A precondition failure signals a
/// duplicate or out-of-order event and must be treated as already-handled by
/// the caller, never retried.
pub(crate) fn confirm_payment_activation(
    tx: &rusqlite::Transaction<'_>,
    payment: &Payment,
    rejection_deadline: DateTime<Utc>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let selection = rows::get_selection(tx, &payment.ad_id, &payment.website_id)?.ok_or_else(|| {
        CoreError::StateConflict(format!(
            "no selection for ad {} on site {}",
            payment.ad_id, payment.website_id
        ))
    })?;
    if !selection.approved {
        return Err(CoreError::StateConflict(
            "cannot activate an unapproved selection".into(),
        ));
    }
    if selection.confirmed {
        return Err(CoreError::StateConflict(
            "selection is already confirmed".into(),
        ));
    }
    rows::activate_selection_row(
        tx,
        &payment.ad_id,
        &payment.website_id,
        &payment.id,
        rejection_deadline,
        now,
    )?;
    Ok(())
}
