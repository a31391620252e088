//! Payment gateway adapter.
//!
//! The engines only ever see the [`PaymentGateway`] trait; the concrete
//! [`RestGateway`] client is constructed once at startup and injected, so
//! tests substitute a double without touching global state.

mod rest;

pub use rest::RestGateway;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

/// Gateway-side transaction outcome. Anything the gateway does not report as
/// terminal success or failure is treated as still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayTxStatus {
    Successful,
    Failed,
    Pending,
}

impl GatewayTxStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "successful" | "success" | "completed" => GatewayTxStatus::Successful,
            "failed" | "error" | "cancelled" => GatewayTxStatus::Failed,
            _ => GatewayTxStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub tx_ref: String,
    pub amount: f64,
    pub currency: String,
    pub customer_email: String,
    pub redirect_url: String,
}

/// Structured charge-initiation result. Only the fields the core consumes are
/// named; the full response is archived in `raw`.
#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub payment_link: String,
    pub gateway_tx_id: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub status: GatewayTxStatus,
    pub amount: f64,
    pub currency: String,
    pub tx_ref: String,
    pub gateway_tx_id: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    pub reference: String,
    pub amount: f64,
    pub currency: String,
    pub destination: String,
    pub narration: String,
}

#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub status: GatewayTxStatus,
    pub transfer_id: String,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Start a hosted-checkout charge. Returns the payment link the client is
    /// redirected to.
    async fn initiate_charge(&self, req: &ChargeRequest) -> CoreResult<ChargeOutcome>;

    /// Re-query a transaction's outcome. Side-effect-free on the gateway side
    /// and safe to repeat.
    async fn verify_transaction(&self, identifier: &str) -> CoreResult<VerifyOutcome>;

    /// Start an asynchronous payout transfer.
    async fn initiate_transfer(&self, req: &TransferRequest) -> CoreResult<TransferOutcome>;
}

/// Webhook body: `{event, data: {id, tx_ref, status, amount}}`. The gateway
/// may deliver the same event zero, one, or many times.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub tx_ref: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub amount: f64,
}

impl WebhookData {
    /// Gateway ids arrive as either numbers or strings; normalize to text.
    pub fn gateway_tx_id(&self) -> Option<String> {
        match &self.id {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_is_conservative() {
        assert_eq!(GatewayTxStatus::parse("successful"), GatewayTxStatus::Successful);
        assert_eq!(GatewayTxStatus::parse("FAILED"), GatewayTxStatus::Failed);
        // Unknown statuses must never be read as success.
        assert_eq!(GatewayTxStatus::parse("processing"), GatewayTxStatus::Pending);
        assert_eq!(GatewayTxStatus::parse(""), GatewayTxStatus::Pending);
    }

    #[test]
    fn webhook_id_normalizes_numbers_and_strings() {
        let numeric: WebhookEvent = serde_json::from_str(
            r#"{"event":"charge.completed","data":{"id":4093840,"tx_ref":"AD-1","status":"successful","amount":50}}"#,
        )
        .expect("parse");
        assert_eq!(numeric.data.gateway_tx_id().as_deref(), Some("4093840"));

        let textual: WebhookEvent = serde_json::from_str(
            r#"{"event":"charge.completed","data":{"id":"tx-9","tx_ref":"AD-2","status":"failed","amount":10}}"#,
        )
        .expect("parse");
        assert_eq!(textual.data.gateway_tx_id().as_deref(), Some("tx-9"));
    }
}
