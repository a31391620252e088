//! Durable ledger store: wallets, payments, balances, trackers, withdrawals.

mod db;
pub mod rows;

pub use db::{new_ad, new_pending_selection, LedgerDb};
