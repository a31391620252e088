//! SQLite-backed ledger store.
//!
//! One connection behind a `tokio::sync::Mutex`; every multi-record mutation
//! runs through [`LedgerDb::with_tx`], which opens an IMMEDIATE transaction so
//! concurrent requests touching the same payment or wallet serialize instead
//! of interleaving. The read-then-branch-then-write idempotence guards in the
//! engines rely on this.

use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::CoreResult;
use crate::ledger::rows;
use crate::models::{Ad, Category, MonthlyEarnings, Payment, Selection, SelectionStatus};

#[derive(Clone)]
pub struct LedgerDb {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerDb {
    pub fn new(db_path: &str) -> CoreResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection without opening a transaction. For
    /// single-statement reads.
    pub async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Run `f` inside a single atomic SQLite transaction. Any error rolls the
    /// whole transaction back; partial writes are never committed.
    pub async fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ----- convenience surface used by handlers and tests -----

    /// Insert an ad together with its pending selections, atomically.
    pub async fn create_ad(&self, ad: &Ad, selections: &[Selection]) -> CoreResult<()> {
        self.with_tx(|tx| {
            rows::insert_ad(tx, ad)?;
            for sel in selections {
                rows::insert_selection(tx, sel)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn get_ad(&self, ad_id: &str) -> CoreResult<Option<Ad>> {
        self.with_conn(|conn| rows::get_ad(conn, ad_id)).await
    }

    pub async fn list_selections(&self, ad_id: &str) -> CoreResult<Vec<Selection>> {
        self.with_conn(|conn| rows::list_selections(conn, ad_id))
            .await
    }

    pub async fn insert_category(&self, cat: &Category) -> CoreResult<()> {
        self.with_conn(|conn| rows::insert_category(conn, cat))
            .await
    }

    pub async fn get_category(&self, category_id: &str) -> CoreResult<Option<Category>> {
        self.with_conn(|conn| rows::get_category(conn, category_id))
            .await
    }

    pub async fn find_payment_by_identifier(
        &self,
        identifier: &str,
    ) -> CoreResult<Option<Payment>> {
        self.with_conn(|conn| rows::find_payment_by_identifier(conn, identifier))
            .await
    }

    /// Simple counter path for the serving script: bumps the ad's view count
    /// and advances every tracker gated on that ad.
    pub async fn record_ad_view(&self, ad_id: &str) -> CoreResult<()> {
        self.with_tx(|tx| {
            rows::increment_ad_views(tx, ad_id)?;
            rows::increment_tracker_views(tx, ad_id)?;
            Ok(())
        })
        .await
    }

    pub async fn record_ad_click(&self, ad_id: &str) -> CoreResult<()> {
        self.with_conn(|conn| rows::increment_ad_clicks(conn, ad_id))
            .await
    }

    pub async fn monthly_earnings(&self, owner_id: &str) -> CoreResult<Vec<MonthlyEarnings>> {
        self.with_conn(|conn| rows::monthly_earnings(conn, owner_id))
            .await
    }
}

/// Build a pending selection for ad creation.
pub fn new_pending_selection(ad_id: &str, website_id: &str, category_ids: Vec<String>) -> Selection {
    Selection {
        ad_id: ad_id.to_string(),
        website_id: website_id.to_string(),
        category_ids,
        approved: false,
        approved_at: None,
        confirmed: false,
        confirmed_at: None,
        status: SelectionStatus::Pending,
        is_rejected: false,
        rejection_deadline: None,
        rejection_reason: None,
        rejected_by: None,
        payment_id: None,
    }
}

/// Build a fresh ad shell owned by `advertiser_id`.
pub fn new_ad(advertiser_id: &str, title: &str) -> Ad {
    let now = Utc::now();
    Ad {
        id: uuid::Uuid::new_v4().to_string(),
        advertiser_id: advertiser_id.to_string(),
        title: title.to_string(),
        image_url: None,
        video_url: None,
        document_url: None,
        business_name: None,
        target_url: None,
        confirmed: false,
        available_for_reassignment: false,
        clicks: 0,
        views: 0,
        created_at: now,
        updated_at: now,
    }
}

fn init_schema(conn: &Connection) -> CoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ads (
            id TEXT PRIMARY KEY,
            advertiser_id TEXT NOT NULL,
            title TEXT NOT NULL,
            image_url TEXT,
            video_url TEXT,
            document_url TEXT,
            business_name TEXT,
            target_url TEXT,
            confirmed INTEGER NOT NULL DEFAULT 0,
            available_for_reassignment INTEGER NOT NULL DEFAULT 0,
            clicks INTEGER NOT NULL DEFAULT 0,
            views INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS selections (
            ad_id TEXT NOT NULL,
            website_id TEXT NOT NULL,
            category_ids TEXT NOT NULL,
            approved INTEGER NOT NULL DEFAULT 0,
            approved_at TEXT,
            confirmed INTEGER NOT NULL DEFAULT 0,
            confirmed_at TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            is_rejected INTEGER NOT NULL DEFAULT 0,
            rejection_deadline TEXT,
            rejection_reason TEXT,
            rejected_by TEXT,
            payment_id TEXT,
            PRIMARY KEY (ad_id, website_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            website_id TEXT NOT NULL,
            price REAL NOT NULL,
            user_count INTEGER NOT NULL,
            selected_ads TEXT NOT NULL DEFAULT '[]',
            visitor_tier TEXT NOT NULL DEFAULT 'standard',
            views_required INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY,
            tx_ref TEXT UNIQUE NOT NULL,
            gateway_tx_id TEXT UNIQUE,
            ad_id TEXT NOT NULL,
            website_id TEXT NOT NULL,
            category_id TEXT NOT NULL,
            advertiser_id TEXT NOT NULL,
            web_owner_id TEXT NOT NULL,
            amount REAL NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            paid_at TEXT,
            rejection_deadline TEXT,
            is_rejectable INTEGER NOT NULL DEFAULT 0,
            refund_applied REAL NOT NULL DEFAULT 0.0,
            refund_usage_amount REAL NOT NULL DEFAULT 0.0,
            refund_used INTEGER NOT NULL DEFAULT 0,
            refund_used_at TEXT,
            refund_used_for_payment TEXT,
            refund_sources TEXT NOT NULL DEFAULT '[]',
            refunded_at TEXT,
            refund_reason TEXT,
            gateway_payload TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS wallets (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            balance REAL NOT NULL DEFAULT 0.0,
            total_earned REAL NOT NULL DEFAULT 0.0,
            total_spent REAL NOT NULL DEFAULT 0.0,
            total_refunded REAL NOT NULL DEFAULT 0.0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (owner_id, kind)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS wallet_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            wallet_id TEXT NOT NULL,
            payment_id TEXT,
            ad_id TEXT,
            amount REAL NOT NULL,
            kind TEXT NOT NULL,
            related_transaction_id INTEGER,
            note TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (wallet_id) REFERENCES wallets(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS web_owner_balances (
            owner_id TEXT PRIMARY KEY,
            total_earnings REAL NOT NULL DEFAULT 0.0,
            available_balance REAL NOT NULL DEFAULT 0.0,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payment_trackers (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            ad_id TEXT NOT NULL,
            category_id TEXT NOT NULL,
            payment_id TEXT NOT NULL,
            views_required INTEGER NOT NULL,
            current_views INTEGER NOT NULL DEFAULT 0,
            payment_date TEXT NOT NULL,
            last_withdrawal_date TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS withdrawals (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            amount REAL NOT NULL,
            destination TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'processing',
            gateway_transfer_id TEXT UNIQUE,
            failure_reason TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_selections_ad ON selections(ad_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_triple \
         ON payments(ad_id, website_id, category_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_advertiser_refunded \
         ON payments(advertiser_id, status, refunded_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_wallet_tx_wallet ON wallet_transactions(wallet_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_wallet_tx_payment ON wallet_transactions(payment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trackers_owner ON payment_trackers(owner_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trackers_ad ON payment_trackers(ad_id)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WalletKind;

    fn scratch_db() -> (tempfile::TempDir, LedgerDb) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.db");
        let db = LedgerDb::new(path.to_str().expect("utf8 path")).expect("open db");
        (dir, db)
    }

    #[tokio::test]
    async fn wallet_create_is_idempotent_per_owner_kind() {
        let (_dir, db) = scratch_db();
        let now = Utc::now();
        let (a, b) = db
            .with_tx(|tx| {
                let a = rows::get_or_create_wallet(tx, "owner-1", WalletKind::WebOwner, now)?;
                let b = rows::get_or_create_wallet(tx, "owner-1", WalletKind::WebOwner, now)?;
                Ok((a, b))
            })
            .await
            .expect("wallets");
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn tx_rollback_leaves_no_partial_writes() {
        let (_dir, db) = scratch_db();
        let now = Utc::now();
        let err = db
            .with_tx(|tx| {
                let w = rows::get_or_create_wallet(tx, "owner-2", WalletKind::WebOwner, now)?;
                rows::adjust_wallet(tx, &w.id, 100.0, 100.0, 0.0, 0.0, now)?;
                Err::<(), _>(crate::error::CoreError::StateConflict("boom".into()))
            })
            .await;
        assert!(err.is_err());

        let wallet = db
            .with_conn(|conn| rows::get_wallet(conn, "owner-2", WalletKind::WebOwner))
            .await
            .expect("query");
        assert!(wallet.is_none(), "rolled-back wallet must not exist");
    }

    #[tokio::test]
    async fn ad_view_advances_counters() {
        let (_dir, db) = scratch_db();
        let ad = new_ad("adv-1", "Spring sale");
        db.create_ad(&ad, &[]).await.expect("create ad");
        db.record_ad_view(&ad.id).await.expect("view");
        db.record_ad_view(&ad.id).await.expect("view");
        let got = db.get_ad(&ad.id).await.expect("get").expect("ad");
        assert_eq!(got.views, 2);
    }
}
