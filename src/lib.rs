//! Ad Marketplace Backend Library
//!
//! Exposes the ledger store, payment gateway adapter, and the reconciliation,
//! selection, and refund engines for use by the server binary and tests.

pub mod api;
pub mod auth;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod models;
