//! Core domain entities for the ad marketplace ledger.
//!
//! Every struct here mirrors a SQLite row one-to-one; status fields are typed
//! enums stored as TEXT. Timestamps are RFC 3339 UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CURRENCY: &str = "USD";

/// Absolute tolerance used when comparing monetary amounts.
pub const AMOUNT_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Successful,
    Failed,
    Cancelled,
    Refunded,
    InternallyRefunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Successful => "successful",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::InternallyRefunded => "internally_refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "successful" => Some(PaymentStatus::Successful),
            "failed" => Some(PaymentStatus::Failed),
            "cancelled" => Some(PaymentStatus::Cancelled),
            "refunded" => Some(PaymentStatus::Refunded),
            "internally_refunded" => Some(PaymentStatus::InternallyRefunded),
            _ => None,
        }
    }

    /// A payment whose refund has already been processed cannot be rejected
    /// or refunded again.
    pub fn is_refund_processed(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Refunded | PaymentStatus::InternallyRefunded
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStatus {
    Pending,
    Active,
    Rejected,
}

impl SelectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStatus::Pending => "pending",
            SelectionStatus::Active => "active",
            SelectionStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SelectionStatus::Pending),
            "active" => Some(SelectionStatus::Active),
            "rejected" => Some(SelectionStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Processing,
    Completed,
    Failed,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(WithdrawalStatus::Processing),
            "completed" => Some(WithdrawalStatus::Completed),
            "failed" => Some(WithdrawalStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WithdrawalStatus::Processing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    Advertiser,
    WebOwner,
}

impl WalletKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletKind::Advertiser => "advertiser",
            WalletKind::WebOwner => "web_owner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "advertiser" => Some(WalletKind::Advertiser),
            "web_owner" => Some(WalletKind::WebOwner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Credit,
    Debit,
    RefundCredit,
    RefundDebit,
}

impl LedgerEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryKind::Credit => "credit",
            LedgerEntryKind::Debit => "debit",
            LedgerEntryKind::RefundCredit => "refund_credit",
            LedgerEntryKind::RefundDebit => "refund_debit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credit" => Some(LedgerEntryKind::Credit),
            "debit" => Some(LedgerEntryKind::Debit),
            "refund_credit" => Some(LedgerEntryKind::RefundCredit),
            "refund_debit" => Some(LedgerEntryKind::RefundDebit),
            _ => None,
        }
    }
}

/// An advertiser-submitted creative. Selections live in their own table keyed
/// by (ad_id, website_id); `confirmed` is true only when every selection is
/// approved. Ads are never hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ad {
    pub id: String,
    pub advertiser_id: String,
    pub title: String,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub document_url: Option<String>,
    pub business_name: Option<String>,
    pub target_url: Option<String>,
    pub confirmed: bool,
    pub available_for_reassignment: bool,
    pub clicks: i64,
    pub views: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One (website, category-set) assignment within an ad.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub ad_id: String,
    pub website_id: String,
    pub category_ids: Vec<String>,
    pub approved: bool,
    pub approved_at: Option<DateTime<Utc>>,
    pub confirmed: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub status: SelectionStatus,
    pub is_rejected: bool,
    pub rejection_deadline: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub rejected_by: Option<String>,
    pub payment_id: Option<String>,
}

/// A sellable slot defined by a website owner. `selected_ads` is the current
/// occupancy set; the `user_count` capacity bound is enforced best-effort at
/// approval time only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub owner_id: String,
    pub website_id: String,
    pub price: f64,
    pub user_count: i64,
    pub selected_ads: Vec<String>,
    pub visitor_tier: String,
    pub views_required: i64,
    pub created_at: DateTime<Utc>,
}

/// A consumed slice of a refunded payment, recorded on the payment that
/// consumed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundSource {
    pub payment_id: String,
    pub amount: f64,
}

/// One attempted charge for a single (ad, website, category) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub tx_ref: String,
    pub gateway_tx_id: Option<String>,
    pub ad_id: String,
    pub website_id: String,
    pub category_id: String,
    pub advertiser_id: String,
    pub web_owner_id: String,
    pub amount: f64,
    pub currency: String,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub rejection_deadline: Option<DateTime<Utc>>,
    pub is_rejectable: bool,
    /// Portion of `amount` covered by the FIFO refund pool at initiation.
    pub refund_applied: f64,
    /// Cumulative amount of THIS payment's refund credit consumed by later
    /// payments. The credit is exhausted when this reaches `amount`.
    pub refund_usage_amount: f64,
    pub refund_used: bool,
    pub refund_used_at: Option<DateTime<Utc>>,
    pub refund_used_for_payment: Option<String>,
    pub refund_sources: Vec<RefundSource>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub refund_reason: Option<String>,
    /// Raw gateway verification payload, archived verbatim.
    pub gateway_payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    /// Amount still owed to the external gateway after refund-pool credit.
    pub fn amount_due(&self) -> f64 {
        (self.amount - self.refund_applied).max(0.0)
    }

    /// Unconsumed portion of this payment's refund credit.
    pub fn refund_credit_remaining(&self) -> f64 {
        (self.amount - self.refund_usage_amount).max(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub owner_id: String,
    pub kind: WalletKind,
    pub balance: f64,
    pub total_earned: f64,
    pub total_spent: f64,
    pub total_refunded: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable ledger entry. Paired refund debit/credit rows reference each
/// other through `related_transaction_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: i64,
    pub wallet_id: String,
    pub payment_id: Option<String>,
    pub ad_id: Option<String>,
    pub amount: f64,
    pub kind: LedgerEntryKind,
    pub related_transaction_id: Option<i64>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Denormalized per-owner earnings view, updated transactionally alongside
/// payment confirmation, refund debits and withdrawals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebOwnerBalance {
    pub owner_id: String,
    pub total_earnings: f64,
    pub available_balance: f64,
    pub updated_at: DateTime<Utc>,
}

/// Gates payout eligibility by accumulated ad views, independent of balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTracker {
    pub id: String,
    pub owner_id: String,
    pub ad_id: String,
    pub category_id: String,
    pub payment_id: String,
    pub views_required: i64,
    pub current_views: i64,
    pub payment_date: DateTime<Utc>,
    pub last_withdrawal_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: String,
    pub owner_id: String,
    pub amount: f64,
    pub destination: String,
    pub status: WithdrawalStatus,
    pub gateway_transfer_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One row of the group-by-month earnings report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyEarnings {
    pub month: String,
    pub total: f64,
    pub payment_count: i64,
}
