//! REST client for the external payment gateway.
//!
//! Timeouts and connection failures are UNKNOWN outcomes, not failures: an
//! unconfirmed charge may still settle, so they surface as retryable and the
//! caller must re-verify rather than assume the charge died.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::gateway::{
    ChargeOutcome, ChargeRequest, GatewayTxStatus, PaymentGateway, TransferOutcome,
    TransferRequest, VerifyOutcome,
};

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct RestGateway {
    client: Client,
    base_url: String,
}

impl RestGateway {
    pub fn new(base_url: String, secret_key: &str) -> CoreResult<Self> {
        let client = Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", secret_key).parse().map_err(|_| {
                        CoreError::Validation("gateway secret key is not a valid header".into())
                    })?,
                );
                headers
            })
            .build()
            .map_err(|e| CoreError::gateway_unreachable(format!("build gateway client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_transport_err(context: &str, err: reqwest::Error) -> CoreError {
        if err.is_timeout() || err.is_connect() {
            CoreError::gateway_unreachable(format!("{context}: {err}"))
        } else {
            CoreError::gateway_rejected(format!("{context}: {err}"))
        }
    }

    async fn read_json(context: &str, resp: reqwest::Response) -> CoreResult<serde_json::Value> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CoreError::UpstreamGateway {
                message: format!("{context} {status}: {body}"),
                retryable: status.is_server_error(),
            });
        }
        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| CoreError::gateway_rejected(format!("{context}: bad response body: {e}")))
    }

    fn field<'a>(raw: &'a serde_json::Value, path: &[&str]) -> Option<&'a serde_json::Value> {
        let mut cur = raw;
        for key in path {
            cur = cur.get(key)?;
        }
        Some(cur)
    }

    fn str_field(raw: &serde_json::Value, path: &[&str]) -> Option<String> {
        match Self::field(raw, path)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn num_field(raw: &serde_json::Value, path: &[&str]) -> Option<f64> {
        Self::field(raw, path)?.as_f64()
    }
}

#[async_trait]
impl PaymentGateway for RestGateway {
    async fn initiate_charge(&self, req: &ChargeRequest) -> CoreResult<ChargeOutcome> {
        tracing::info!(tx_ref = %req.tx_ref, amount = req.amount, "initiating gateway charge");
        let resp = self
            .client
            .post(self.url("/payments"))
            .json(req)
            .send()
            .await
            .map_err(|e| Self::map_transport_err("POST /payments", e))?;
        let raw = Self::read_json("POST /payments", resp).await?;

        let payment_link = Self::str_field(&raw, &["data", "link"])
            .ok_or_else(|| CoreError::gateway_rejected("charge response missing payment link"))?;
        let gateway_tx_id = Self::str_field(&raw, &["data", "id"]);

        Ok(ChargeOutcome {
            payment_link,
            gateway_tx_id,
            raw,
        })
    }

    async fn verify_transaction(&self, identifier: &str) -> CoreResult<VerifyOutcome> {
        tracing::info!(identifier = %identifier, "verifying gateway transaction");
        let resp = self
            .client
            .get(self.url(&format!("/transactions/{identifier}/verify")))
            .send()
            .await
            .map_err(|e| Self::map_transport_err("GET /transactions/verify", e))?;
        let raw = Self::read_json("GET /transactions/verify", resp).await?;

        let status = Self::str_field(&raw, &["data", "status"])
            .map(|s| GatewayTxStatus::parse(&s))
            .unwrap_or(GatewayTxStatus::Pending);
        let amount = Self::num_field(&raw, &["data", "amount"]).unwrap_or(0.0);
        let currency = Self::str_field(&raw, &["data", "currency"]).unwrap_or_default();
        let tx_ref = Self::str_field(&raw, &["data", "tx_ref"]).unwrap_or_default();
        let gateway_tx_id = Self::str_field(&raw, &["data", "id"]).unwrap_or_default();

        Ok(VerifyOutcome {
            status,
            amount,
            currency,
            tx_ref,
            gateway_tx_id,
            raw,
        })
    }

    async fn initiate_transfer(&self, req: &TransferRequest) -> CoreResult<TransferOutcome> {
        tracing::info!(reference = %req.reference, amount = req.amount, "initiating gateway transfer");
        let resp = self
            .client
            .post(self.url("/transfers"))
            .json(req)
            .send()
            .await
            .map_err(|e| Self::map_transport_err("POST /transfers", e))?;
        let raw = Self::read_json("POST /transfers", resp).await?;

        let status = Self::str_field(&raw, &["data", "status"])
            .map(|s| GatewayTxStatus::parse(&s))
            .unwrap_or(GatewayTxStatus::Pending);
        let transfer_id = Self::str_field(&raw, &["data", "id"])
            .ok_or_else(|| CoreError::gateway_rejected("transfer response missing id"))?;

        Ok(TransferOutcome {
            status,
            transfer_id,
            raw,
        })
    }
}
