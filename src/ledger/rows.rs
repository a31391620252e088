//! Row-level primitives over the ledger schema.
//!
//! Every function takes a `&Connection` so it works equally inside a
//! [`rusqlite::Transaction`] (which derefs to `Connection`). The engines
//! compose these inside `LedgerDb::with_tx` to get atomic multi-record
//! mutations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::CoreResult;
use crate::models::{
    Ad, Category, LedgerEntryKind, MonthlyEarnings, Payment, PaymentStatus, PaymentTracker,
    RefundSource, Selection, SelectionStatus, Wallet, WalletKind, WalletTransaction,
    WebOwnerBalance, Withdrawal, WithdrawalStatus, AMOUNT_TOLERANCE,
};

fn conv_err(msg: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        msg.into().into(),
    )
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conv_err(format!("bad timestamp {s:?}: {e}")))
}

fn parse_opt_ts(v: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    v.map(|s| parse_ts(&s)).transpose()
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn opt_ts(t: &Option<DateTime<Utc>>) -> Option<String> {
    t.as_ref().map(ts)
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| conv_err(format!("bad json column: {e}")))
}

// ===== Ads =====

fn ad_from_row(row: &Row<'_>) -> rusqlite::Result<Ad> {
    Ok(Ad {
        id: row.get(0)?,
        advertiser_id: row.get(1)?,
        title: row.get(2)?,
        image_url: row.get(3)?,
        video_url: row.get(4)?,
        document_url: row.get(5)?,
        business_name: row.get(6)?,
        target_url: row.get(7)?,
        confirmed: row.get::<_, i64>(8)? == 1,
        available_for_reassignment: row.get::<_, i64>(9)? == 1,
        clicks: row.get(10)?,
        views: row.get(11)?,
        created_at: parse_ts(&row.get::<_, String>(12)?)?,
        updated_at: parse_ts(&row.get::<_, String>(13)?)?,
    })
}

const AD_COLS: &str = "id, advertiser_id, title, image_url, video_url, document_url, \
     business_name, target_url, confirmed, available_for_reassignment, clicks, views, \
     created_at, updated_at";

pub fn insert_ad(conn: &Connection, ad: &Ad) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO ads (id, advertiser_id, title, image_url, video_url, document_url, \
         business_name, target_url, confirmed, available_for_reassignment, clicks, views, \
         created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            ad.id,
            ad.advertiser_id,
            ad.title,
            ad.image_url,
            ad.video_url,
            ad.document_url,
            ad.business_name,
            ad.target_url,
            ad.confirmed as i64,
            ad.available_for_reassignment as i64,
            ad.clicks,
            ad.views,
            ts(&ad.created_at),
            ts(&ad.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_ad(conn: &Connection, ad_id: &str) -> CoreResult<Option<Ad>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {AD_COLS} FROM ads WHERE id = ?1"))?;
    Ok(stmt.query_row([ad_id], ad_from_row).optional()?)
}

pub fn set_ad_flags(
    conn: &Connection,
    ad_id: &str,
    confirmed: bool,
    available_for_reassignment: bool,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE ads SET confirmed = ?2, available_for_reassignment = ?3, updated_at = ?4 \
         WHERE id = ?1",
        params![ad_id, confirmed as i64, available_for_reassignment as i64, ts(&now)],
    )?;
    Ok(())
}

pub fn increment_ad_views(conn: &Connection, ad_id: &str) -> CoreResult<()> {
    conn.execute(
        "UPDATE ads SET views = views + 1 WHERE id = ?1",
        [ad_id],
    )?;
    Ok(())
}

pub fn increment_ad_clicks(conn: &Connection, ad_id: &str) -> CoreResult<()> {
    conn.execute(
        "UPDATE ads SET clicks = clicks + 1 WHERE id = ?1",
        [ad_id],
    )?;
    Ok(())
}

// ===== Selections =====

fn selection_from_row(row: &Row<'_>) -> rusqlite::Result<Selection> {
    let status: String = row.get(7)?;
    Ok(Selection {
        ad_id: row.get(0)?,
        website_id: row.get(1)?,
        category_ids: parse_json(&row.get::<_, String>(2)?)?,
        approved: row.get::<_, i64>(3)? == 1,
        approved_at: parse_opt_ts(row.get(4)?)?,
        confirmed: row.get::<_, i64>(5)? == 1,
        confirmed_at: parse_opt_ts(row.get(6)?)?,
        status: SelectionStatus::parse(&status)
            .ok_or_else(|| conv_err(format!("bad selection status {status:?}")))?,
        is_rejected: row.get::<_, i64>(8)? == 1,
        rejection_deadline: parse_opt_ts(row.get(9)?)?,
        rejection_reason: row.get(10)?,
        rejected_by: row.get(11)?,
        payment_id: row.get(12)?,
    })
}

const SELECTION_COLS: &str = "ad_id, website_id, category_ids, approved, approved_at, \
     confirmed, confirmed_at, status, is_rejected, rejection_deadline, rejection_reason, \
     rejected_by, payment_id";

pub fn insert_selection(conn: &Connection, sel: &Selection) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO selections (ad_id, website_id, category_ids, approved, approved_at, \
         confirmed, confirmed_at, status, is_rejected, rejection_deadline, rejection_reason, \
         rejected_by, payment_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            sel.ad_id,
            sel.website_id,
            serde_json::to_string(&sel.category_ids)?,
            sel.approved as i64,
            opt_ts(&sel.approved_at),
            sel.confirmed as i64,
            opt_ts(&sel.confirmed_at),
            sel.status.as_str(),
            sel.is_rejected as i64,
            opt_ts(&sel.rejection_deadline),
            sel.rejection_reason,
            sel.rejected_by,
            sel.payment_id,
        ],
    )?;
    Ok(())
}

pub fn get_selection(
    conn: &Connection,
    ad_id: &str,
    website_id: &str,
) -> CoreResult<Option<Selection>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SELECTION_COLS} FROM selections WHERE ad_id = ?1 AND website_id = ?2"
    ))?;
    Ok(stmt
        .query_row(params![ad_id, website_id], selection_from_row)
        .optional()?)
}

pub fn list_selections(conn: &Connection, ad_id: &str) -> CoreResult<Vec<Selection>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SELECTION_COLS} FROM selections WHERE ad_id = ?1 ORDER BY website_id ASC"
    ))?;
    let rows = stmt.query_map([ad_id], selection_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn approve_selection(
    conn: &Connection,
    ad_id: &str,
    website_id: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE selections SET approved = 1, approved_at = ?3 \
         WHERE ad_id = ?1 AND website_id = ?2",
        params![ad_id, website_id, ts(&now)],
    )?;
    Ok(())
}

pub fn activate_selection_row(
    conn: &Connection,
    ad_id: &str,
    website_id: &str,
    payment_id: &str,
    rejection_deadline: DateTime<Utc>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE selections SET confirmed = 1, confirmed_at = ?3, status = 'active', \
         payment_id = ?4, rejection_deadline = ?5 \
         WHERE ad_id = ?1 AND website_id = ?2",
        params![ad_id, website_id, ts(&now), payment_id, ts(&rejection_deadline)],
    )?;
    Ok(())
}

pub fn reject_selection_row(
    conn: &Connection,
    ad_id: &str,
    website_id: &str,
    reason: &str,
    rejected_by: &str,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE selections SET approved = 0, confirmed = 0, confirmed_at = NULL, \
         is_rejected = 1, status = 'rejected', rejection_reason = ?3, rejected_by = ?4 \
         WHERE ad_id = ?1 AND website_id = ?2",
        params![ad_id, website_id, reason, rejected_by],
    )?;
    Ok(())
}

// ===== Categories =====

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        website_id: row.get(2)?,
        price: row.get(3)?,
        user_count: row.get(4)?,
        selected_ads: parse_json(&row.get::<_, String>(5)?)?,
        visitor_tier: row.get(6)?,
        views_required: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?)?,
    })
}

const CATEGORY_COLS: &str =
    "id, owner_id, website_id, price, user_count, selected_ads, visitor_tier, \
     views_required, created_at";

pub fn insert_category(conn: &Connection, cat: &Category) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO categories (id, owner_id, website_id, price, user_count, selected_ads, \
         visitor_tier, views_required, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            cat.id,
            cat.owner_id,
            cat.website_id,
            cat.price,
            cat.user_count,
            serde_json::to_string(&cat.selected_ads)?,
            cat.visitor_tier,
            cat.views_required,
            ts(&cat.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_category(conn: &Connection, category_id: &str) -> CoreResult<Option<Category>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {CATEGORY_COLS} FROM categories WHERE id = ?1"
    ))?;
    Ok(stmt.query_row([category_id], category_from_row).optional()?)
}

pub fn set_category_occupancy(
    conn: &Connection,
    category_id: &str,
    selected_ads: &[String],
) -> CoreResult<()> {
    conn.execute(
        "UPDATE categories SET selected_ads = ?2 WHERE id = ?1",
        params![category_id, serde_json::to_string(selected_ads)?],
    )?;
    Ok(())
}

// ===== Payments =====

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    let status: String = row.get(10)?;
    let sources: String = row.get(19)?;
    Ok(Payment {
        id: row.get(0)?,
        tx_ref: row.get(1)?,
        gateway_tx_id: row.get(2)?,
        ad_id: row.get(3)?,
        website_id: row.get(4)?,
        category_id: row.get(5)?,
        advertiser_id: row.get(6)?,
        web_owner_id: row.get(7)?,
        amount: row.get(8)?,
        currency: row.get(9)?,
        status: PaymentStatus::parse(&status)
            .ok_or_else(|| conv_err(format!("bad payment status {status:?}")))?,
        paid_at: parse_opt_ts(row.get(11)?)?,
        rejection_deadline: parse_opt_ts(row.get(12)?)?,
        is_rejectable: row.get::<_, i64>(13)? == 1,
        refund_applied: row.get(14)?,
        refund_usage_amount: row.get(15)?,
        refund_used: row.get::<_, i64>(16)? == 1,
        refund_used_at: parse_opt_ts(row.get(17)?)?,
        refund_used_for_payment: row.get(18)?,
        refund_sources: parse_json::<Vec<RefundSource>>(&sources)?,
        refunded_at: parse_opt_ts(row.get(20)?)?,
        refund_reason: row.get(21)?,
        gateway_payload: row.get(22)?,
        created_at: parse_ts(&row.get::<_, String>(23)?)?,
    })
}

const PAYMENT_COLS: &str = "id, tx_ref, gateway_tx_id, ad_id, website_id, category_id, \
     advertiser_id, web_owner_id, amount, currency, status, paid_at, rejection_deadline, \
     is_rejectable, refund_applied, refund_usage_amount, refund_used, refund_used_at, \
     refund_used_for_payment, refund_sources, refunded_at, refund_reason, gateway_payload, \
     created_at";

pub fn insert_payment(conn: &Connection, p: &Payment) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO payments (id, tx_ref, gateway_tx_id, ad_id, website_id, category_id, \
         advertiser_id, web_owner_id, amount, currency, status, paid_at, rejection_deadline, \
         is_rejectable, refund_applied, refund_usage_amount, refund_used, refund_used_at, \
         refund_used_for_payment, refund_sources, refunded_at, refund_reason, gateway_payload, \
         created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
         ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
        params![
            p.id,
            p.tx_ref,
            p.gateway_tx_id,
            p.ad_id,
            p.website_id,
            p.category_id,
            p.advertiser_id,
            p.web_owner_id,
            p.amount,
            p.currency,
            p.status.as_str(),
            opt_ts(&p.paid_at),
            opt_ts(&p.rejection_deadline),
            p.is_rejectable as i64,
            p.refund_applied,
            p.refund_usage_amount,
            p.refund_used as i64,
            opt_ts(&p.refund_used_at),
            p.refund_used_for_payment,
            serde_json::to_string(&p.refund_sources)?,
            opt_ts(&p.refunded_at),
            p.refund_reason,
            p.gateway_payload,
            ts(&p.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_payment(conn: &Connection, payment_id: &str) -> CoreResult<Option<Payment>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {PAYMENT_COLS} FROM payments WHERE id = ?1"
    ))?;
    Ok(stmt.query_row([payment_id], payment_from_row).optional()?)
}

/// Look up a payment by internal tx_ref OR gateway transaction id.
pub fn find_payment_by_identifier(
    conn: &Connection,
    identifier: &str,
) -> CoreResult<Option<Payment>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {PAYMENT_COLS} FROM payments WHERE tx_ref = ?1 OR gateway_tx_id = ?1"
    ))?;
    Ok(stmt.query_row([identifier], payment_from_row).optional()?)
}

pub fn find_successful_payment(
    conn: &Connection,
    ad_id: &str,
    website_id: &str,
    category_id: &str,
) -> CoreResult<Option<Payment>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {PAYMENT_COLS} FROM payments \
         WHERE ad_id = ?1 AND website_id = ?2 AND category_id = ?3 AND status = 'successful'"
    ))?;
    Ok(stmt
        .query_row(params![ad_id, website_id, category_id], payment_from_row)
        .optional()?)
}

pub fn mark_payment_successful(
    conn: &Connection,
    payment_id: &str,
    gateway_tx_id: Option<&str>,
    gateway_payload: Option<&str>,
    paid_at: DateTime<Utc>,
    rejection_deadline: DateTime<Utc>,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE payments SET status = 'successful', paid_at = ?2, rejection_deadline = ?3, \
         is_rejectable = 1, \
         gateway_tx_id = COALESCE(?4, gateway_tx_id), \
         gateway_payload = COALESCE(?5, gateway_payload) \
         WHERE id = ?1",
        params![payment_id, ts(&paid_at), ts(&rejection_deadline), gateway_tx_id, gateway_payload],
    )?;
    Ok(())
}

pub fn set_payment_gateway_tx(
    conn: &Connection,
    payment_id: &str,
    gateway_tx_id: &str,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE payments SET gateway_tx_id = ?2 WHERE id = ?1",
        params![payment_id, gateway_tx_id],
    )?;
    Ok(())
}

pub fn mark_payment_failed(
    conn: &Connection,
    payment_id: &str,
    gateway_payload: Option<&str>,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE payments SET status = 'failed', \
         gateway_payload = COALESCE(?2, gateway_payload) \
         WHERE id = ?1",
        params![payment_id, gateway_payload],
    )?;
    Ok(())
}

pub fn mark_payment_refunded(
    conn: &Connection,
    payment_id: &str,
    status: PaymentStatus,
    refunded_at: DateTime<Utc>,
    reason: &str,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE payments SET status = ?2, refunded_at = ?3, refund_reason = ?4, \
         is_rejectable = 0 \
         WHERE id = ?1",
        params![payment_id, status.as_str(), ts(&refunded_at), reason],
    )?;
    Ok(())
}

pub fn delete_payment(conn: &Connection, payment_id: &str) -> CoreResult<()> {
    conn.execute("DELETE FROM payments WHERE id = ?1", [payment_id])?;
    Ok(())
}

/// FIFO refund pool: refunded payments with unconsumed credit, oldest first.
pub fn list_available_refunds(
    conn: &Connection,
    advertiser_id: &str,
) -> CoreResult<Vec<Payment>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {PAYMENT_COLS} FROM payments \
         WHERE advertiser_id = ?1 \
         AND status IN ('refunded', 'internally_refunded') \
         AND refund_usage_amount < amount - ?2 \
         ORDER BY refunded_at ASC"
    ))?;
    let rows = stmt.query_map(params![advertiser_id, AMOUNT_TOLERANCE], payment_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Consume `used` from a refund-source payment's credit. A partially consumed
/// credit stays unstamped; `refund_used` and its companion columns are set
/// only once the credit is exhausted.
pub fn apply_refund_source_usage(
    conn: &Connection,
    source_payment_id: &str,
    used: f64,
    consumed_by_payment_id: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE payments SET \
         refund_usage_amount = refund_usage_amount + ?2, \
         refund_used = CASE WHEN refund_usage_amount + ?2 >= amount - ?3 THEN 1 ELSE 0 END, \
         refund_used_at = CASE WHEN refund_usage_amount + ?2 >= amount - ?3 \
             THEN ?4 ELSE refund_used_at END, \
         refund_used_for_payment = CASE WHEN refund_usage_amount + ?2 >= amount - ?3 \
             THEN ?5 ELSE refund_used_for_payment END \
         WHERE id = ?1",
        params![
            source_payment_id,
            used,
            AMOUNT_TOLERANCE,
            ts(&now),
            consumed_by_payment_id
        ],
    )?;
    Ok(())
}

/// Hand consumed refund credit back to its source: the compensating action
/// when the consuming payment fails (at charge initiation or at
/// verification).
pub fn release_refund_source_usage(
    conn: &Connection,
    source_payment_id: &str,
    used: f64,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE payments SET \
         refund_usage_amount = MAX(refund_usage_amount - ?2, 0.0), \
         refund_used = CASE WHEN refund_usage_amount - ?2 >= amount - ?3 THEN 1 ELSE 0 END, \
         refund_used_at = NULL, \
         refund_used_for_payment = NULL \
         WHERE id = ?1",
        params![source_payment_id, used, AMOUNT_TOLERANCE],
    )?;
    Ok(())
}

/// Detach a failed payment from the credit it consumed. Pairs with releasing
/// its sources; the payment owes its full amount again afterwards.
pub fn clear_payment_refund_application(conn: &Connection, payment_id: &str) -> CoreResult<()> {
    conn.execute(
        "UPDATE payments SET refund_applied = 0.0, refund_sources = '[]' WHERE id = ?1",
        [payment_id],
    )?;
    Ok(())
}

// ===== Wallets =====

fn wallet_from_row(row: &Row<'_>) -> rusqlite::Result<Wallet> {
    let kind: String = row.get(2)?;
    Ok(Wallet {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        kind: WalletKind::parse(&kind)
            .ok_or_else(|| conv_err(format!("bad wallet kind {kind:?}")))?,
        balance: row.get(3)?,
        total_earned: row.get(4)?,
        total_spent: row.get(5)?,
        total_refunded: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
        updated_at: parse_ts(&row.get::<_, String>(8)?)?,
    })
}

const WALLET_COLS: &str =
    "id, owner_id, kind, balance, total_earned, total_spent, total_refunded, \
     created_at, updated_at";

pub fn get_wallet(
    conn: &Connection,
    owner_id: &str,
    kind: WalletKind,
) -> CoreResult<Option<Wallet>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {WALLET_COLS} FROM wallets WHERE owner_id = ?1 AND kind = ?2"
    ))?;
    Ok(stmt
        .query_row(params![owner_id, kind.as_str()], wallet_from_row)
        .optional()?)
}

pub fn get_or_create_wallet(
    conn: &Connection,
    owner_id: &str,
    kind: WalletKind,
    now: DateTime<Utc>,
) -> CoreResult<Wallet> {
    if let Some(wallet) = get_wallet(conn, owner_id, kind)? {
        return Ok(wallet);
    }
    let wallet = Wallet {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        kind,
        balance: 0.0,
        total_earned: 0.0,
        total_spent: 0.0,
        total_refunded: 0.0,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO wallets (id, owner_id, kind, balance, total_earned, total_spent, \
         total_refunded, created_at, updated_at) \
         VALUES (?1, ?2, ?3, 0.0, 0.0, 0.0, 0.0, ?4, ?4)",
        params![wallet.id, wallet.owner_id, kind.as_str(), ts(&now)],
    )?;
    Ok(wallet)
}

/// Apply signed deltas to a wallet's balance and running totals.
pub fn adjust_wallet(
    conn: &Connection,
    wallet_id: &str,
    delta_balance: f64,
    delta_earned: f64,
    delta_spent: f64,
    delta_refunded: f64,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE wallets SET balance = balance + ?2, total_earned = total_earned + ?3, \
         total_spent = total_spent + ?4, total_refunded = total_refunded + ?5, \
         updated_at = ?6 \
         WHERE id = ?1",
        params![wallet_id, delta_balance, delta_earned, delta_spent, delta_refunded, ts(&now)],
    )?;
    Ok(())
}

pub fn insert_wallet_entry(
    conn: &Connection,
    wallet_id: &str,
    payment_id: Option<&str>,
    ad_id: Option<&str>,
    amount: f64,
    kind: LedgerEntryKind,
    related_transaction_id: Option<i64>,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> CoreResult<i64> {
    conn.execute(
        "INSERT INTO wallet_transactions (wallet_id, payment_id, ad_id, amount, kind, \
         related_transaction_id, note, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            wallet_id,
            payment_id,
            ad_id,
            amount,
            kind.as_str(),
            related_transaction_id,
            note,
            ts(&now)
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn link_wallet_entries(conn: &Connection, entry_id: i64, related_id: i64) -> CoreResult<()> {
    conn.execute(
        "UPDATE wallet_transactions SET related_transaction_id = ?2 WHERE id = ?1",
        params![entry_id, related_id],
    )?;
    Ok(())
}

fn wallet_entry_from_row(row: &Row<'_>) -> rusqlite::Result<WalletTransaction> {
    let kind: String = row.get(5)?;
    Ok(WalletTransaction {
        id: row.get(0)?,
        wallet_id: row.get(1)?,
        payment_id: row.get(2)?,
        ad_id: row.get(3)?,
        amount: row.get(4)?,
        kind: LedgerEntryKind::parse(&kind)
            .ok_or_else(|| conv_err(format!("bad ledger entry kind {kind:?}")))?,
        related_transaction_id: row.get(6)?,
        note: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?)?,
    })
}

const WALLET_ENTRY_COLS: &str = "id, wallet_id, payment_id, ad_id, amount, kind, \
     related_transaction_id, note, created_at";

pub fn list_wallet_entries(conn: &Connection, wallet_id: &str) -> CoreResult<Vec<WalletTransaction>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {WALLET_ENTRY_COLS} FROM wallet_transactions \
         WHERE wallet_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map([wallet_id], wallet_entry_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn list_wallet_entries_for_payment(
    conn: &Connection,
    payment_id: &str,
) -> CoreResult<Vec<WalletTransaction>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {WALLET_ENTRY_COLS} FROM wallet_transactions \
         WHERE payment_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map([payment_id], wallet_entry_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ===== Web owner balances =====

fn owner_balance_from_row(row: &Row<'_>) -> rusqlite::Result<WebOwnerBalance> {
    Ok(WebOwnerBalance {
        owner_id: row.get(0)?,
        total_earnings: row.get(1)?,
        available_balance: row.get(2)?,
        updated_at: parse_ts(&row.get::<_, String>(3)?)?,
    })
}

pub fn get_owner_balance(conn: &Connection, owner_id: &str) -> CoreResult<Option<WebOwnerBalance>> {
    let mut stmt = conn.prepare_cached(
        "SELECT owner_id, total_earnings, available_balance, updated_at \
         FROM web_owner_balances WHERE owner_id = ?1",
    )?;
    Ok(stmt.query_row([owner_id], owner_balance_from_row).optional()?)
}

/// Earnings credit: grows both the lifetime total and the withdrawable pool.
pub fn credit_owner_balance(
    conn: &Connection,
    owner_id: &str,
    amount: f64,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO web_owner_balances (owner_id, total_earnings, available_balance, updated_at) \
         VALUES (?1, ?2, ?2, ?3) \
         ON CONFLICT(owner_id) DO UPDATE SET \
            total_earnings = total_earnings + excluded.total_earnings, \
            available_balance = available_balance + excluded.available_balance, \
            updated_at = excluded.updated_at",
        params![owner_id, amount, ts(&now)],
    )?;
    Ok(())
}

/// Signed adjustment of the withdrawable pool only (withdrawal debit or
/// failed-withdrawal refund, refund debit on rejection).
pub fn adjust_owner_available(
    conn: &Connection,
    owner_id: &str,
    delta: f64,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO web_owner_balances (owner_id, total_earnings, available_balance, updated_at) \
         VALUES (?1, 0.0, ?2, ?3) \
         ON CONFLICT(owner_id) DO UPDATE SET \
            available_balance = available_balance + excluded.available_balance, \
            updated_at = excluded.updated_at",
        params![owner_id, delta, ts(&now)],
    )?;
    Ok(())
}

// ===== Payment trackers =====

fn tracker_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentTracker> {
    Ok(PaymentTracker {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        ad_id: row.get(2)?,
        category_id: row.get(3)?,
        payment_id: row.get(4)?,
        views_required: row.get(5)?,
        current_views: row.get(6)?,
        payment_date: parse_ts(&row.get::<_, String>(7)?)?,
        last_withdrawal_date: parse_opt_ts(row.get(8)?)?,
    })
}

const TRACKER_COLS: &str = "id, owner_id, ad_id, category_id, payment_id, views_required, \
     current_views, payment_date, last_withdrawal_date";

pub fn insert_tracker(conn: &Connection, t: &PaymentTracker) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO payment_trackers (id, owner_id, ad_id, category_id, payment_id, \
         views_required, current_views, payment_date, last_withdrawal_date) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            t.id,
            t.owner_id,
            t.ad_id,
            t.category_id,
            t.payment_id,
            t.views_required,
            t.current_views,
            ts(&t.payment_date),
            opt_ts(&t.last_withdrawal_date),
        ],
    )?;
    Ok(())
}

pub fn list_trackers(conn: &Connection, owner_id: &str) -> CoreResult<Vec<PaymentTracker>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TRACKER_COLS} FROM payment_trackers WHERE owner_id = ?1 \
         ORDER BY payment_date ASC"
    ))?;
    let rows = stmt.query_map([owner_id], tracker_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn increment_tracker_views(conn: &Connection, ad_id: &str) -> CoreResult<()> {
    conn.execute(
        "UPDATE payment_trackers SET current_views = current_views + 1 WHERE ad_id = ?1",
        [ad_id],
    )?;
    Ok(())
}

pub fn set_owner_trackers_withdrawn(
    conn: &Connection,
    owner_id: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE payment_trackers SET last_withdrawal_date = ?2 WHERE owner_id = ?1",
        params![owner_id, ts(&now)],
    )?;
    Ok(())
}

// ===== Withdrawals =====

fn withdrawal_from_row(row: &Row<'_>) -> rusqlite::Result<Withdrawal> {
    let status: String = row.get(4)?;
    Ok(Withdrawal {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        amount: row.get(2)?,
        destination: row.get(3)?,
        status: WithdrawalStatus::parse(&status)
            .ok_or_else(|| conv_err(format!("bad withdrawal status {status:?}")))?,
        gateway_transfer_id: row.get(5)?,
        failure_reason: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
        completed_at: parse_opt_ts(row.get(8)?)?,
    })
}

const WITHDRAWAL_COLS: &str = "id, owner_id, amount, destination, status, \
     gateway_transfer_id, failure_reason, created_at, completed_at";

pub fn insert_withdrawal(conn: &Connection, w: &Withdrawal) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO withdrawals (id, owner_id, amount, destination, status, \
         gateway_transfer_id, failure_reason, created_at, completed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            w.id,
            w.owner_id,
            w.amount,
            w.destination,
            w.status.as_str(),
            w.gateway_transfer_id,
            w.failure_reason,
            ts(&w.created_at),
            opt_ts(&w.completed_at),
        ],
    )?;
    Ok(())
}

pub fn find_withdrawal_by_transfer(
    conn: &Connection,
    transfer_id: &str,
) -> CoreResult<Option<Withdrawal>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {WITHDRAWAL_COLS} FROM withdrawals WHERE gateway_transfer_id = ?1"
    ))?;
    Ok(stmt.query_row([transfer_id], withdrawal_from_row).optional()?)
}

pub fn finalize_withdrawal(
    conn: &Connection,
    withdrawal_id: &str,
    status: WithdrawalStatus,
    failure_reason: Option<&str>,
    completed_at: DateTime<Utc>,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE withdrawals SET status = ?2, failure_reason = ?3, completed_at = ?4 \
         WHERE id = ?1",
        params![withdrawal_id, status.as_str(), failure_reason, ts(&completed_at)],
    )?;
    Ok(())
}

// ===== Reports =====

/// Group-by-month SUM of successful payments for an owner.
pub fn monthly_earnings(conn: &Connection, owner_id: &str) -> CoreResult<Vec<MonthlyEarnings>> {
    let mut stmt = conn.prepare_cached(
        "SELECT strftime('%Y-%m', paid_at) AS month, SUM(amount), COUNT(*) \
         FROM payments \
         WHERE web_owner_id = ?1 AND status = 'successful' AND paid_at IS NOT NULL \
         GROUP BY month ORDER BY month ASC",
    )?;
    let rows = stmt.query_map([owner_id], |row| {
        Ok(MonthlyEarnings {
            month: row.get(0)?,
            total: row.get(1)?,
            payment_count: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
