//! End-to-end marketplace flows against a scratch SQLite ledger and a mock
//! payment gateway.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use admarket_backend::auth::Principal;
use admarket_backend::engine::{
    InitiateRequest, ReconciliationEngine, RefundEngine, RejectionRequest, SelectionEngine,
};
use admarket_backend::error::{CoreError, CoreResult};
use admarket_backend::gateway::{
    ChargeOutcome, ChargeRequest, GatewayTxStatus, PaymentGateway, TransferOutcome,
    TransferRequest, VerifyOutcome, WebhookEvent,
};
use admarket_backend::ledger::{new_ad, new_pending_selection, rows, LedgerDb};
use admarket_backend::models::{
    Category, LedgerEntryKind, PaymentStatus, SelectionStatus, WalletKind,
};

const WEBHOOK_SECRET: &str = "hook-secret";

struct MockGateway {
    verify_status: Mutex<GatewayTxStatus>,
    verify_amount: Mutex<f64>,
    verify_currency: Mutex<String>,
    charge_fails: bool,
    transfer_status: GatewayTxStatus,
    verify_calls: AtomicUsize,
}

impl MockGateway {
    fn successful(amount: f64) -> Self {
        Self {
            verify_status: Mutex::new(GatewayTxStatus::Successful),
            verify_amount: Mutex::new(amount),
            verify_currency: Mutex::new("USD".to_string()),
            charge_fails: false,
            transfer_status: GatewayTxStatus::Pending,
            verify_calls: AtomicUsize::new(0),
        }
    }

    fn failed() -> Self {
        Self {
            verify_status: Mutex::new(GatewayTxStatus::Failed),
            ..Self::successful(0.0)
        }
    }

    fn set_verify(&self, status: GatewayTxStatus, amount: f64) {
        *self.verify_status.lock().unwrap() = status;
        *self.verify_amount.lock().unwrap() = amount;
    }

    fn set_verify_currency(&self, currency: &str) {
        *self.verify_currency.lock().unwrap() = currency.to_string();
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn initiate_charge(&self, req: &ChargeRequest) -> CoreResult<ChargeOutcome> {
        if self.charge_fails {
            return Err(CoreError::gateway_unreachable("connection refused"));
        }
        Ok(ChargeOutcome {
            payment_link: format!("https://pay.test/{}", req.tx_ref),
            gateway_tx_id: None,
            raw: serde_json::json!({"status": "success"}),
        })
    }

    async fn verify_transaction(&self, identifier: &str) -> CoreResult<VerifyOutcome> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        Ok(VerifyOutcome {
            status: *self.verify_status.lock().unwrap(),
            amount: *self.verify_amount.lock().unwrap(),
            currency: self.verify_currency.lock().unwrap().clone(),
            tx_ref: identifier.to_string(),
            gateway_tx_id: format!("gw-{identifier}"),
            raw: serde_json::json!({"data": {"status": "mock"}}),
        })
    }

    async fn initiate_transfer(&self, req: &TransferRequest) -> CoreResult<TransferOutcome> {
        Ok(TransferOutcome {
            status: self.transfer_status,
            transfer_id: req.reference.clone(),
            raw: serde_json::json!({}),
        })
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    db: LedgerDb,
    selections: SelectionEngine,
    reconcile: ReconciliationEngine,
    refunds: RefundEngine,
    gateway: Arc<MockGateway>,
}

fn harness(gateway: MockGateway) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.db");
    let db = LedgerDb::new(path.to_str().expect("utf8 path")).expect("open db");
    let gateway = Arc::new(gateway);
    let dyn_gateway: Arc<dyn PaymentGateway> = gateway.clone();
    Harness {
        _dir: dir,
        selections: SelectionEngine::new(db.clone()),
        reconcile: ReconciliationEngine::new(
            db.clone(),
            dyn_gateway.clone(),
            "https://app.test/after-pay".to_string(),
            WEBHOOK_SECRET.to_string(),
        ),
        refunds: RefundEngine::new(db.clone(), dyn_gateway),
        db,
        gateway,
    }
}

fn principal(user_id: &str) -> Principal {
    Principal {
        user_id: user_id.to_string(),
    }
}

fn test_category(id: &str, owner: &str, website: &str, price: f64) -> Category {
    Category {
        id: id.to_string(),
        owner_id: owner.to_string(),
        website_id: website.to_string(),
        price,
        user_count: 3,
        selected_ads: vec![],
        visitor_tier: "standard".to_string(),
        views_required: 1000,
        created_at: Utc::now(),
    }
}

/// Seed a category, an ad with one pending selection, and approve it.
async fn seed_approved_selection(
    h: &Harness,
    owner: &str,
    advertiser: &str,
    price: f64,
) -> (String, String, String) {
    let category = test_category("cat-1", owner, "site-1", price);
    h.db.insert_category(&category).await.expect("category");

    let ad = new_ad(advertiser, "Spring sale banner");
    let selection = new_pending_selection(&ad.id, "site-1", vec!["cat-1".to_string()]);
    h.db.create_ad(&ad, &[selection]).await.expect("ad");

    h.selections
        .approve(&principal(owner), &ad.id, "site-1")
        .await
        .expect("approve");
    (ad.id.clone(), "site-1".to_string(), "cat-1".to_string())
}

async fn pay_and_settle(h: &Harness, advertiser: &str, ad_id: &str, price: f64) -> String {
    let outcome = h
        .reconcile
        .initiate(
            &principal(advertiser),
            &InitiateRequest {
                ad_id: ad_id.to_string(),
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                amount: price,
                payer_email: format!("{advertiser}@example.com"),
            },
        )
        .await
        .expect("initiate");
    let tx_ref = outcome.payment.tx_ref.clone();
    if outcome.payment_link.is_some() {
        h.reconcile.verify(&tx_ref).await.expect("verify");
    }
    tx_ref
}

async fn wallet_balance(h: &Harness, owner: &str, kind: WalletKind) -> f64 {
    h.db.with_conn(|conn| rows::get_wallet(conn, owner, kind))
        .await
        .expect("wallet query")
        .map(|w| w.balance)
        .unwrap_or(0.0)
}

async fn available_balance(h: &Harness, owner: &str) -> f64 {
    h.db.with_conn(|conn| rows::get_owner_balance(conn, owner))
        .await
        .expect("balance query")
        .map(|b| b.available_balance)
        .unwrap_or(0.0)
}

// ===== Payment settlement =====

#[tokio::test]
async fn end_to_end_payment_activates_selection_and_credits_owner() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, website_id, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    let tx_ref = pay_and_settle(&h, "adv-1", &ad_id, 50.0).await;

    let payment = h
        .db
        .find_payment_by_identifier(&tx_ref)
        .await
        .expect("query")
        .expect("payment");
    assert_eq!(payment.status, PaymentStatus::Successful);
    assert!(payment.is_rejectable);
    assert!(payment.rejection_deadline.is_some());

    let selections = h.db.list_selections(&ad_id).await.expect("selections");
    let selection = selections
        .iter()
        .find(|s| s.website_id == website_id)
        .expect("selection");
    assert_eq!(selection.status, SelectionStatus::Active);
    assert!(selection.confirmed);

    let ad = h.db.get_ad(&ad_id).await.expect("query").expect("ad");
    assert!(ad.confirmed);

    assert_eq!(wallet_balance(&h, "owner-1", WalletKind::WebOwner).await, 50.0);
    assert_eq!(available_balance(&h, "owner-1").await, 50.0);

    let category = h.db.get_category("cat-1").await.expect("query").expect("cat");
    assert_eq!(category.selected_ads, vec![ad_id.clone()]);

    let trackers = h
        .db
        .with_conn(|conn| rows::list_trackers(conn, "owner-1"))
        .await
        .expect("trackers");
    assert_eq!(trackers.len(), 1);
    assert_eq!(trackers[0].views_required, 1000);
    assert_eq!(trackers[0].current_views, 0);
}

#[tokio::test]
async fn verify_is_idempotent_and_never_double_credits() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    let tx_ref = pay_and_settle(&h, "adv-1", &ad_id, 50.0).await;

    let first = h.reconcile.verify(&tx_ref).await.expect("verify again");
    let second = h.reconcile.verify(&tx_ref).await.expect("verify again");
    assert_eq!(first.status, PaymentStatus::Successful);
    assert_eq!(second.paid_at, first.paid_at);

    assert_eq!(wallet_balance(&h, "owner-1", WalletKind::WebOwner).await, 50.0);
    let entries = h
        .db
        .with_conn(|conn| rows::list_wallet_entries_for_payment(conn, &first.id))
        .await
        .expect("entries");
    let credits: Vec<_> = entries
        .iter()
        .filter(|e| e.kind == LedgerEntryKind::Credit)
        .collect();
    assert_eq!(credits.len(), 1, "balance delta recorded exactly once");
}

#[tokio::test]
async fn concurrent_verifies_settle_exactly_once() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;

    let outcome = h
        .reconcile
        .initiate(
            &principal("adv-1"),
            &InitiateRequest {
                ad_id: ad_id.clone(),
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                amount: 50.0,
                payer_email: "adv-1@example.com".to_string(),
            },
        )
        .await
        .expect("initiate");
    let tx_ref = outcome.payment.tx_ref.clone();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = h.reconcile.clone();
        let tx_ref = tx_ref.clone();
        handles.push(tokio::spawn(async move { engine.verify(&tx_ref).await }));
    }
    for handle in handles {
        handle.await.expect("join").expect("verify");
    }

    assert_eq!(wallet_balance(&h, "owner-1", WalletKind::WebOwner).await, 50.0);
    let payment = h
        .db
        .find_payment_by_identifier(&tx_ref)
        .await
        .expect("query")
        .expect("payment");
    let entries = h
        .db
        .with_conn(|conn| rows::list_wallet_entries_for_payment(conn, &payment.id))
        .await
        .expect("entries");
    assert_eq!(entries.len(), 1, "exactly one activation side-effect set");
}

#[tokio::test]
async fn amount_mismatch_fails_payment_instead_of_accepting() {
    // Gateway reports 45 for a 50 charge.
    let h = harness(MockGateway::successful(45.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;

    let outcome = h
        .reconcile
        .initiate(
            &principal("adv-1"),
            &InitiateRequest {
                ad_id,
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                amount: 50.0,
                payer_email: "adv-1@example.com".to_string(),
            },
        )
        .await
        .expect("initiate");
    let tx_ref = outcome.payment.tx_ref.clone();

    let err = h.reconcile.verify(&tx_ref).await.expect_err("mismatch");
    assert!(matches!(err, CoreError::Consistency(_)), "got {err:?}");

    let payment = h
        .db
        .find_payment_by_identifier(&tx_ref)
        .await
        .expect("query")
        .expect("payment");
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(wallet_balance(&h, "owner-1", WalletKind::WebOwner).await, 0.0);
}

#[tokio::test]
async fn gateway_reported_failure_marks_payment_failed() {
    let h = harness(MockGateway::failed());
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;

    let outcome = h
        .reconcile
        .initiate(
            &principal("adv-1"),
            &InitiateRequest {
                ad_id: ad_id.clone(),
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                amount: 50.0,
                payer_email: "adv-1@example.com".to_string(),
            },
        )
        .await
        .expect("initiate");
    let tx_ref = outcome.payment.tx_ref.clone();

    let err = h.reconcile.verify(&tx_ref).await.expect_err("failed charge");
    assert!(matches!(err, CoreError::StateConflict(_)), "got {err:?}");

    let payment = h
        .db
        .find_payment_by_identifier(&tx_ref)
        .await
        .expect("query")
        .expect("payment");
    assert_eq!(payment.status, PaymentStatus::Failed);

    let selections = h.db.list_selections(&ad_id).await.expect("selections");
    assert!(!selections[0].confirmed, "activation must not happen");
}

#[tokio::test]
async fn failed_charge_initiation_compensates_pending_row() {
    let mut gateway = MockGateway::successful(50.0);
    gateway.charge_fails = true;
    let h = harness(gateway);
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;

    let err = h
        .reconcile
        .initiate(
            &principal("adv-1"),
            &InitiateRequest {
                ad_id: ad_id.clone(),
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                amount: 50.0,
                payer_email: "adv-1@example.com".to_string(),
            },
        )
        .await
        .expect_err("charge fails");
    assert!(err.is_retryable(), "transport failures are retryable");

    let count: i64 = h
        .db
        .with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM payments WHERE ad_id = ?1",
                [ad_id.as_str()],
                |row| row.get(0),
            )?)
        })
        .await
        .expect("count");
    assert_eq!(count, 0, "compensating delete removed the pending row");
}

// ===== Webhooks =====

#[tokio::test]
async fn webhook_with_bad_signature_is_rejected_without_processing() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    let outcome = h
        .reconcile
        .initiate(
            &principal("adv-1"),
            &InitiateRequest {
                ad_id,
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                amount: 50.0,
                payer_email: "adv-1@example.com".to_string(),
            },
        )
        .await
        .expect("initiate");

    let event: WebhookEvent = serde_json::from_value(serde_json::json!({
        "event": "charge.completed",
        "data": {"id": 1, "tx_ref": outcome.payment.tx_ref, "status": "successful", "amount": 50.0}
    }))
    .expect("event");

    let err = h
        .reconcile
        .handle_webhook(Some("wrong-secret"), &event)
        .await
        .expect_err("forged webhook");
    assert!(matches!(err, CoreError::Authorization(_)));
    assert_eq!(h.gateway.verify_calls.load(Ordering::SeqCst), 0);
    assert_eq!(wallet_balance(&h, "owner-1", WalletKind::WebOwner).await, 0.0);
}

#[tokio::test]
async fn duplicate_webhook_deliveries_settle_once() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    let outcome = h
        .reconcile
        .initiate(
            &principal("adv-1"),
            &InitiateRequest {
                ad_id,
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                amount: 50.0,
                payer_email: "adv-1@example.com".to_string(),
            },
        )
        .await
        .expect("initiate");

    let event: WebhookEvent = serde_json::from_value(serde_json::json!({
        "event": "charge.completed",
        "data": {"id": 1, "tx_ref": outcome.payment.tx_ref, "status": "successful", "amount": 50.0}
    }))
    .expect("event");

    for _ in 0..3 {
        h.reconcile
            .handle_webhook(Some(WEBHOOK_SECRET), &event)
            .await
            .expect("webhook");
    }
    assert_eq!(wallet_balance(&h, "owner-1", WalletKind::WebOwner).await, 50.0);
}

// ===== Approval invariant =====

#[tokio::test]
async fn ad_confirmed_iff_every_selection_approved() {
    let h = harness(MockGateway::successful(50.0));
    h.db.insert_category(&test_category("cat-1", "owner-1", "site-1", 50.0))
        .await
        .expect("cat-1");
    h.db.insert_category(&test_category("cat-2", "owner-1", "site-2", 80.0))
        .await
        .expect("cat-2");

    let ad = new_ad("adv-1", "Two-site campaign");
    let selections = vec![
        new_pending_selection(&ad.id, "site-1", vec!["cat-1".to_string()]),
        new_pending_selection(&ad.id, "site-2", vec!["cat-2".to_string()]),
    ];
    h.db.create_ad(&ad, &selections).await.expect("ad");

    h.selections
        .approve(&principal("owner-1"), &ad.id, "site-1")
        .await
        .expect("approve one");
    let partial = h.db.get_ad(&ad.id).await.expect("query").expect("ad");
    assert!(!partial.confirmed, "one unapproved selection remains");

    // Idempotent: re-approving is a no-op.
    h.selections
        .approve(&principal("owner-1"), &ad.id, "site-1")
        .await
        .expect("re-approve");

    h.selections
        .approve(&principal("owner-1"), &ad.id, "site-2")
        .await
        .expect("approve both");
    let full = h.db.get_ad(&ad.id).await.expect("query").expect("ad");
    assert!(full.confirmed);
}

#[tokio::test]
async fn non_owner_cannot_approve() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    let err = h
        .selections
        .approve(&principal("intruder"), &ad_id, "site-1")
        .await
        .expect_err("not the owner");
    assert!(matches!(err, CoreError::Authorization(_)));
}

// ===== Rejection and refunds =====

#[tokio::test]
async fn rejection_refunds_wallet_to_wallet_and_frees_the_slot() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    let tx_ref = pay_and_settle(&h, "adv-1", &ad_id, 50.0).await;

    let payment = h
        .selections
        .reject(
            &principal("owner-1"),
            &RejectionRequest {
                ad_id: ad_id.clone(),
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                reason: "Not relevant to our audience".to_string(),
            },
        )
        .await
        .expect("reject");

    assert_eq!(payment.status, PaymentStatus::Refunded);
    assert!(payment.refunded_at.is_some());
    assert_eq!(wallet_balance(&h, "owner-1", WalletKind::WebOwner).await, 0.0);
    assert_eq!(wallet_balance(&h, "adv-1", WalletKind::Advertiser).await, 50.0);
    assert_eq!(available_balance(&h, "owner-1").await, 0.0);

    let selections = h.db.list_selections(&ad_id).await.expect("selections");
    assert_eq!(selections[0].status, SelectionStatus::Rejected);
    assert!(selections[0].is_rejected);
    assert!(!selections[0].confirmed);
    assert!(
        selections[0].confirmed_at.is_none(),
        "a rejected selection carries no confirmation time"
    );

    let category = h.db.get_category("cat-1").await.expect("query").expect("cat");
    assert!(category.selected_ads.is_empty(), "occupancy decremented");

    // Paired ledger entries reference each other.
    let entries = h
        .db
        .with_conn({
            let id = payment.id.clone();
            move |conn| rows::list_wallet_entries_for_payment(conn, &id)
        })
        .await
        .expect("entries");
    let debit = entries
        .iter()
        .find(|e| e.kind == LedgerEntryKind::RefundDebit)
        .expect("debit");
    let credit = entries
        .iter()
        .find(|e| e.kind == LedgerEntryKind::RefundCredit)
        .expect("credit");
    assert_eq!(debit.related_transaction_id, Some(credit.id));
    assert_eq!(credit.related_transaction_id, Some(debit.id));

    // Second rejection attempt is refused.
    let err = h
        .selections
        .reject(
            &principal("owner-1"),
            &RejectionRequest {
                ad_id,
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                reason: "Trying to reject a second time".to_string(),
            },
        )
        .await
        .expect_err("already rejected");
    assert!(matches!(err, CoreError::StateConflict(_)));
}

#[tokio::test]
async fn short_rejection_reason_is_rejected() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    pay_and_settle(&h, "adv-1", &ad_id, 50.0).await;

    let err = h
        .selections
        .reject(
            &principal("owner-1"),
            &RejectionRequest {
                ad_id,
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                reason: "too spam".to_string(),
            },
        )
        .await
        .expect_err("reason too short");
    assert!(matches!(err, CoreError::Validation(_)));
}

async fn backdate_rejection_deadline(h: &Harness, tx_ref: &str, deadline_offset_secs: i64) {
    let payment = h
        .db
        .find_payment_by_identifier(tx_ref)
        .await
        .expect("query")
        .expect("payment");
    let deadline = Utc::now() + Duration::seconds(deadline_offset_secs);
    let paid_at = payment.paid_at.unwrap_or_else(Utc::now);
    h.db.with_tx(move |tx| {
        rows::mark_payment_successful(tx, &payment.id, None, None, paid_at, deadline)
    })
    .await
    .expect("backdate");
}

#[tokio::test]
async fn rejection_respects_the_grace_boundary() {
    // Grace is 60 minutes; a deadline just over an hour ago is out of
    // window, a deadline just under an hour ago is still in.
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    let tx_ref = pay_and_settle(&h, "adv-1", &ad_id, 50.0).await;

    backdate_rejection_deadline(&h, &tx_ref, -3601).await;
    let err = h
        .selections
        .reject(
            &principal("owner-1"),
            &RejectionRequest {
                ad_id: ad_id.clone(),
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                reason: "Window already closed here".to_string(),
            },
        )
        .await
        .expect_err("window closed");
    assert!(matches!(err, CoreError::StateConflict(_)));

    backdate_rejection_deadline(&h, &tx_ref, -3599).await;
    h.selections
        .reject(
            &principal("owner-1"),
            &RejectionRequest {
                ad_id,
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                reason: "Still inside the grace period".to_string(),
            },
        )
        .await
        .expect("inside grace");
}

#[tokio::test]
async fn self_rejection_moves_no_money() {
    // owner-1 advertises on their own site.
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "owner-1", 50.0).await;
    pay_and_settle(&h, "owner-1", &ad_id, 50.0).await;
    let balance_before = wallet_balance(&h, "owner-1", WalletKind::WebOwner).await;

    let payment = h
        .selections
        .reject(
            &principal("owner-1"),
            &RejectionRequest {
                ad_id,
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                reason: "Changed my mind about this one".to_string(),
            },
        )
        .await
        .expect("self reject");

    assert_eq!(payment.status, PaymentStatus::InternallyRefunded);
    assert_eq!(
        wallet_balance(&h, "owner-1", WalletKind::WebOwner).await,
        balance_before,
        "no wallet movement on self-dealing"
    );
    let entries = h
        .db
        .with_conn({
            let id = payment.id.clone();
            move |conn| rows::list_wallet_entries_for_payment(conn, &id)
        })
        .await
        .expect("entries");
    assert!(
        entries
            .iter()
            .all(|e| e.kind == LedgerEntryKind::Credit),
        "only the original settlement credit exists"
    );
}

#[tokio::test]
async fn refund_pool_covers_the_next_payment_fifo() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    pay_and_settle(&h, "adv-1", &ad_id, 50.0).await;
    h.selections
        .reject(
            &principal("owner-1"),
            &RejectionRequest {
                ad_id: ad_id.clone(),
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                reason: "Not relevant to our audience".to_string(),
            },
        )
        .await
        .expect("reject");

    let (pool, total) = h.refunds.available_refunds("adv-1").await.expect("pool");
    assert_eq!(pool.len(), 1);
    assert_eq!(total, 50.0);

    // A second ad for the same slot is paid entirely from the pool: no
    // gateway charge, immediate settlement.
    let ad2 = new_ad("adv-1", "Second attempt");
    let selection = new_pending_selection(&ad2.id, "site-1", vec!["cat-1".to_string()]);
    h.db.create_ad(&ad2, &[selection]).await.expect("ad2");
    h.selections
        .approve(&principal("owner-1"), &ad2.id, "site-1")
        .await
        .expect("approve");

    let calls_before = h.gateway.verify_calls.load(Ordering::SeqCst);
    let outcome = h
        .reconcile
        .initiate(
            &principal("adv-1"),
            &InitiateRequest {
                ad_id: ad2.id.clone(),
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                amount: 50.0,
                payer_email: "adv-1@example.com".to_string(),
            },
        )
        .await
        .expect("initiate");

    assert!(outcome.payment_link.is_none(), "no external charge needed");
    assert_eq!(outcome.refund_applied, 50.0);
    assert_eq!(outcome.amount_due, 0.0);
    assert_eq!(outcome.payment.status, PaymentStatus::Successful);
    assert_eq!(
        h.gateway.verify_calls.load(Ordering::SeqCst),
        calls_before,
        "gateway never consulted"
    );

    let (pool_after, total_after) = h.refunds.available_refunds("adv-1").await.expect("pool");
    assert!(pool_after.is_empty());
    assert_eq!(total_after, 0.0);

    // Owner earned the second payment in full.
    assert_eq!(wallet_balance(&h, "owner-1", WalletKind::WebOwner).await, 50.0);
}

/// Seed a fresh category plus an approved single-selection ad on it.
async fn seed_extra_slot(
    h: &Harness,
    advertiser: &str,
    category_id: &str,
    website_id: &str,
    price: f64,
) -> String {
    let category = test_category(category_id, "owner-1", website_id, price);
    h.db.insert_category(&category).await.expect("category");
    let ad = new_ad(advertiser, "Follow-up campaign");
    let selection = new_pending_selection(&ad.id, website_id, vec![category_id.to_string()]);
    h.db.create_ad(&ad, &[selection]).await.expect("ad");
    h.selections
        .approve(&principal("owner-1"), &ad.id, website_id)
        .await
        .expect("approve");
    ad.id
}

#[tokio::test]
async fn failed_verification_releases_consumed_refund_credit() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    pay_and_settle(&h, "adv-1", &ad_id, 50.0).await;
    h.selections
        .reject(
            &principal("owner-1"),
            &RejectionRequest {
                ad_id,
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                reason: "Not relevant to our audience".to_string(),
            },
        )
        .await
        .expect("reject");

    // $80 slot: $50 from the pool, $30 charged externally.
    let ad2 = seed_extra_slot(&h, "adv-1", "cat-2", "site-2", 80.0).await;
    let request = InitiateRequest {
        ad_id: ad2,
        website_id: "site-2".to_string(),
        category_id: "cat-2".to_string(),
        amount: 80.0,
        payer_email: "adv-1@example.com".to_string(),
    };
    let outcome = h
        .reconcile
        .initiate(&principal("adv-1"), &request)
        .await
        .expect("initiate");
    assert_eq!(outcome.refund_applied, 50.0);
    assert_eq!(outcome.amount_due, 30.0);
    let (_, total) = h.refunds.available_refunds("adv-1").await.expect("pool");
    assert_eq!(total, 0.0, "credit is booked while the charge is pending");

    h.gateway.set_verify(GatewayTxStatus::Failed, 0.0);
    let err = h
        .reconcile
        .verify(&outcome.payment.tx_ref)
        .await
        .expect_err("failed charge");
    assert!(matches!(err, CoreError::StateConflict(_)));

    let payment = h
        .db
        .find_payment_by_identifier(&outcome.payment.tx_ref)
        .await
        .expect("query")
        .expect("payment");
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.refund_applied, 0.0);
    assert!(payment.refund_sources.is_empty());

    let (pool, total) = h.refunds.available_refunds("adv-1").await.expect("pool");
    assert_eq!(pool.len(), 1);
    assert_eq!(total, 50.0, "credit consumed by the failed charge is back");
    assert!(!pool[0].refund_used);

    // An amount mismatch on a retry releases the same way.
    h.gateway.set_verify(GatewayTxStatus::Successful, 80.0);
    let retry = h
        .reconcile
        .initiate(&principal("adv-1"), &request)
        .await
        .expect("initiate again");
    assert_eq!(retry.amount_due, 30.0);
    let err = h
        .reconcile
        .verify(&retry.payment.tx_ref)
        .await
        .expect_err("mismatch");
    assert!(matches!(err, CoreError::Consistency(_)));
    let (_, total) = h.refunds.available_refunds("adv-1").await.expect("pool");
    assert_eq!(total, 50.0);
}

#[tokio::test]
async fn missing_currency_fails_verification() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    let outcome = h
        .reconcile
        .initiate(
            &principal("adv-1"),
            &InitiateRequest {
                ad_id,
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                amount: 50.0,
                payer_email: "adv-1@example.com".to_string(),
            },
        )
        .await
        .expect("initiate");

    h.gateway.set_verify_currency("");
    let err = h
        .reconcile
        .verify(&outcome.payment.tx_ref)
        .await
        .expect_err("currency missing");
    assert!(matches!(err, CoreError::Consistency(_)), "got {err:?}");

    let payment = h
        .db
        .find_payment_by_identifier(&outcome.payment.tx_ref)
        .await
        .expect("query")
        .expect("payment");
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(wallet_balance(&h, "owner-1", WalletKind::WebOwner).await, 0.0);
}

#[tokio::test]
async fn partially_consumed_credit_is_not_stamped_used() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    pay_and_settle(&h, "adv-1", &ad_id, 50.0).await;
    let refunded = h
        .selections
        .reject(
            &principal("owner-1"),
            &RejectionRequest {
                ad_id,
                website_id: "site-1".to_string(),
                category_id: "cat-1".to_string(),
                reason: "Not relevant to our audience".to_string(),
            },
        )
        .await
        .expect("reject");

    // A $30 slot takes part of the $50 credit: the source must not look used.
    let ad2 = seed_extra_slot(&h, "adv-1", "cat-2", "site-2", 30.0).await;
    h.reconcile
        .initiate(
            &principal("adv-1"),
            &InitiateRequest {
                ad_id: ad2,
                website_id: "site-2".to_string(),
                category_id: "cat-2".to_string(),
                amount: 30.0,
                payer_email: "adv-1@example.com".to_string(),
            },
        )
        .await
        .expect("covered initiate");

    let source = h
        .db
        .with_conn({
            let id = refunded.id.clone();
            move |conn| rows::get_payment(conn, &id)
        })
        .await
        .expect("query")
        .expect("payment");
    assert_eq!(source.refund_usage_amount, 30.0);
    assert!(!source.refund_used);
    assert!(source.refund_used_at.is_none());
    assert!(source.refund_used_for_payment.is_none());

    // A $20 slot exhausts the credit: now the stamps appear.
    let ad3 = seed_extra_slot(&h, "adv-1", "cat-3", "site-3", 20.0).await;
    let last = h
        .reconcile
        .initiate(
            &principal("adv-1"),
            &InitiateRequest {
                ad_id: ad3,
                website_id: "site-3".to_string(),
                category_id: "cat-3".to_string(),
                amount: 20.0,
                payer_email: "adv-1@example.com".to_string(),
            },
        )
        .await
        .expect("exhausting initiate");

    let source = h
        .db
        .with_conn({
            let id = refunded.id.clone();
            move |conn| rows::get_payment(conn, &id)
        })
        .await
        .expect("query")
        .expect("payment");
    assert!(source.refund_used);
    assert!(source.refund_used_at.is_some());
    assert_eq!(
        source.refund_used_for_payment.as_deref(),
        Some(last.payment.id.as_str())
    );
}

// ===== Withdrawals =====

async fn make_owner_eligible(h: &Harness, owner: &str) {
    let owner = owner.to_string();
    let backdated = (Utc::now() - Duration::days(31)).to_rfc3339();
    h.db.with_conn(move |conn| {
        conn.execute(
            "UPDATE payment_trackers SET current_views = views_required, payment_date = ?2 \
             WHERE owner_id = ?1",
            rusqlite::params![owner, backdated],
        )?;
        Ok(())
    })
    .await
    .expect("backdate tracker");
}

#[tokio::test]
async fn withdrawal_requires_views_and_cooldown() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    pay_and_settle(&h, "adv-1", &ad_id, 50.0).await;

    // Fresh payment: views not reached, cooldown not elapsed.
    let gate = h
        .refunds
        .check_withdrawal_eligibility("owner-1")
        .await
        .expect("gate");
    assert!(!gate.eligible);

    let err = h
        .refunds
        .initiate_withdrawal(&principal("owner-1"), 30.0, "+233200000001")
        .await
        .expect_err("not eligible yet");
    assert!(matches!(err, CoreError::StateConflict(_)));

    make_owner_eligible(&h, "owner-1").await;
    let gate = h
        .refunds
        .check_withdrawal_eligibility("owner-1")
        .await
        .expect("gate");
    assert!(gate.eligible);
}

#[tokio::test]
async fn withdrawal_debits_available_balance_and_callback_completes() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    pay_and_settle(&h, "adv-1", &ad_id, 50.0).await;
    make_owner_eligible(&h, "owner-1").await;

    let withdrawal = h
        .refunds
        .initiate_withdrawal(&principal("owner-1"), 30.0, "+233200000001")
        .await
        .expect("withdraw");
    assert_eq!(available_balance(&h, "owner-1").await, 20.0);

    let transfer_id = withdrawal.gateway_transfer_id.clone().expect("transfer id");
    let done = h
        .refunds
        .withdrawal_callback(&transfer_id, "successful")
        .await
        .expect("callback");
    assert_eq!(done.status, admarket_backend::models::WithdrawalStatus::Completed);
    assert_eq!(available_balance(&h, "owner-1").await, 20.0);
}

#[tokio::test]
async fn failed_withdrawal_callback_refunds_exactly_once() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    pay_and_settle(&h, "adv-1", &ad_id, 50.0).await;
    make_owner_eligible(&h, "owner-1").await;

    let withdrawal = h
        .refunds
        .initiate_withdrawal(&principal("owner-1"), 30.0, "+233200000001")
        .await
        .expect("withdraw");
    assert_eq!(available_balance(&h, "owner-1").await, 20.0);

    let transfer_id = withdrawal.gateway_transfer_id.clone().expect("transfer id");
    let first = h
        .refunds
        .withdrawal_callback(&transfer_id, "failed")
        .await
        .expect("first callback");
    assert_eq!(first.status, admarket_backend::models::WithdrawalStatus::Failed);
    assert_eq!(available_balance(&h, "owner-1").await, 50.0);

    // Duplicate failure delivery: terminal state short-circuits.
    let second = h
        .refunds
        .withdrawal_callback(&transfer_id, "failed")
        .await
        .expect("second callback");
    assert_eq!(second.status, admarket_backend::models::WithdrawalStatus::Failed);
    assert_eq!(
        available_balance(&h, "owner-1").await,
        50.0,
        "refunded exactly once"
    );
}

#[tokio::test]
async fn withdrawal_exceeding_balance_is_refused() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    pay_and_settle(&h, "adv-1", &ad_id, 50.0).await;
    make_owner_eligible(&h, "owner-1").await;

    let err = h
        .refunds
        .initiate_withdrawal(&principal("owner-1"), 80.0, "+233200000001")
        .await
        .expect_err("over balance");
    assert!(matches!(err, CoreError::InsufficientBalance { .. }));
    assert_eq!(available_balance(&h, "owner-1").await, 50.0);
}

// ===== Reports =====

#[tokio::test]
async fn monthly_earnings_groups_successful_payments() {
    let h = harness(MockGateway::successful(50.0));
    let (ad_id, _, _) = seed_approved_selection(&h, "owner-1", "adv-1", 50.0).await;
    pay_and_settle(&h, "adv-1", &ad_id, 50.0).await;

    let months = h.refunds.monthly_earnings("owner-1").await.expect("report");
    assert_eq!(months.len(), 1);
    assert_eq!(months[0].total, 50.0);
    assert_eq!(months[0].payment_count, 1);
    assert_eq!(months[0].month, Utc::now().format("%Y-%m").to_string());
}
