use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use crate::{config::AppConfig, error::AppError};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("STRIPE_SECRET_KEY is not configured.")]
    NotConfigured,
    #[error("Stripe API request failed: {0}")]
    Transport(String),
    #[error("Stripe API error ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Stripe API returned an unexpected response: {0}")]
    InvalidResponse(&'static str),
}

impl From<GatewayError> for AppError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::NotConfigured => AppError::Dependency(error.to_string()),
            other => AppError::Processor(other.to_string()),
        }
    }
}

/// Off-session SEPA debit against a customer's saved payment method.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentRequest {
    pub amount: i64,
    pub customer_id: String,
    pub payment_method_id: String,
    pub description: String,
    pub metadata: Vec<(&'static str, String)>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
}

/// One auto-charged invoice finalized by the processor on `finalize_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceRequest {
    pub amount: i64,
    pub customer_id: String,
    pub payment_method_id: String,
    pub description: String,
    pub finalize_at: i64,
    pub metadata: Vec<(&'static str, String)>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledInvoice {
    pub id: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_off_session_intent(
        &self,
        request: &IntentRequest,
    ) -> Result<PaymentIntent, GatewayError>;

    async fn schedule_invoice(
        &self,
        request: &InvoiceRequest,
    ) -> Result<ScheduledInvoice, GatewayError>;
}

/// Stripe REST client. Form-encoded requests, secret key as basic auth.
#[derive(Clone)]
pub struct StripeGateway {
    http_client: Client,
    api_base: String,
    secret_key: Option<String>,
    currency: String,
}

impl StripeGateway {
    pub fn new(http_client: Client, config: &AppConfig) -> Self {
        Self {
            http_client,
            api_base: config.stripe_api_base.clone(),
            secret_key: config
                .stripe_secret_key
                .clone()
                .filter(|key| !key.trim().is_empty()),
            currency: config.stripe_currency.to_ascii_lowercase(),
        }
    }

    async fn post_form(
        &self,
        path: &str,
        params: &[(String, String)],
        idempotency_key: &str,
    ) -> Result<Value, GatewayError> {
        let secret_key = self
            .secret_key
            .as_deref()
            .ok_or(GatewayError::NotConfigured)?;

        let response = self
            .http_client
            .post(format!("{}/v1/{path}", self.api_base))
            .basic_auth(secret_key, None::<&str>)
            .header("Idempotency-Key", idempotency_key)
            .form(params)
            .send()
            .await
            .map_err(|error| {
                tracing::error!(error = %error, path, "Stripe API request failed");
                GatewayError::Transport(error.to_string())
            })?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|_| GatewayError::InvalidResponse("body is not JSON"))?;

        if status.is_success() {
            return Ok(body);
        }

        let message = body
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown Stripe error")
            .to_string();
        tracing::warn!(status = status.as_u16(), path, message = %message, "Stripe rejected request");
        Err(GatewayError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_off_session_intent(
        &self,
        request: &IntentRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        let params = intent_params(request, &self.currency);
        let body = self
            .post_form("payment_intents", &params, &request.idempotency_key)
            .await?;

        let id = string_field(&body, "id").ok_or(GatewayError::InvalidResponse("missing id"))?;
        let status = string_field(&body, "status").unwrap_or_else(|| "processing".to_string());
        Ok(PaymentIntent { id, status })
    }

    async fn schedule_invoice(
        &self,
        request: &InvoiceRequest,
    ) -> Result<ScheduledInvoice, GatewayError> {
        let invoice = self
            .post_form(
                "invoices",
                &invoice_params(request),
                &format!("{}-invoice", request.idempotency_key),
            )
            .await?;
        let invoice_id =
            string_field(&invoice, "id").ok_or(GatewayError::InvalidResponse("missing id"))?;

        self.post_form(
            "invoiceitems",
            &invoice_item_params(request, &invoice_id, &self.currency),
            &format!("{}-item", request.idempotency_key),
        )
        .await?;

        Ok(ScheduledInvoice { id: invoice_id })
    }
}

fn intent_params(request: &IntentRequest, currency: &str) -> Vec<(String, String)> {
    let mut params = vec![
        ("amount".to_string(), request.amount.to_string()),
        ("currency".to_string(), currency.to_string()),
        ("customer".to_string(), request.customer_id.clone()),
        ("payment_method".to_string(), request.payment_method_id.clone()),
        ("payment_method_types[]".to_string(), "sepa_debit".to_string()),
        ("confirm".to_string(), "true".to_string()),
        ("off_session".to_string(), "true".to_string()),
        ("description".to_string(), request.description.clone()),
    ];
    push_metadata(&mut params, &request.metadata);
    params
}

fn invoice_params(request: &InvoiceRequest) -> Vec<(String, String)> {
    let mut params = vec![
        ("customer".to_string(), request.customer_id.clone()),
        (
            "collection_method".to_string(),
            "charge_automatically".to_string(),
        ),
        ("auto_advance".to_string(), "true".to_string()),
        (
            "automatically_finalizes_at".to_string(),
            request.finalize_at.to_string(),
        ),
        (
            "default_payment_method".to_string(),
            request.payment_method_id.clone(),
        ),
        (
            "payment_settings[payment_method_types][]".to_string(),
            "sepa_debit".to_string(),
        ),
        (
            "pending_invoice_items_behavior".to_string(),
            "exclude".to_string(),
        ),
        ("description".to_string(), request.description.clone()),
    ];
    push_metadata(&mut params, &request.metadata);
    params
}

fn invoice_item_params(
    request: &InvoiceRequest,
    invoice_id: &str,
    currency: &str,
) -> Vec<(String, String)> {
    vec![
        ("customer".to_string(), request.customer_id.clone()),
        ("invoice".to_string(), invoice_id.to_string()),
        ("amount".to_string(), request.amount.to_string()),
        ("currency".to_string(), currency.to_string()),
        ("description".to_string(), request.description.clone()),
    ]
}

fn push_metadata(params: &mut Vec<(String, String)>, metadata: &[(&'static str, String)]) {
    for (key, value) in metadata {
        params.push((format!("metadata[{key}]"), value.clone()));
    }
}

fn string_field(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

/// Verify a Stripe webhook signature using HMAC-SHA256.
///
/// Parses the `Stripe-Signature` header (`t=<timestamp>,v1=<signature>`,
/// possibly with several `v1` entries during secret rotation), signs
/// `<timestamp>.<body>` and compares in constant time. Stale timestamps are
/// rejected.
pub fn verify_stripe_signature(payload: &str, signature_header: &str, webhook_secret: &str) -> bool {
    verify_stripe_signature_at(
        payload,
        signature_header,
        webhook_secret,
        chrono::Utc::now().timestamp(),
    )
}

fn verify_stripe_signature_at(
    payload: &str,
    signature_header: &str,
    webhook_secret: &str,
    now: i64,
) -> bool {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = Some(t);
        } else if let Some(v1) = part.strip_prefix("v1=") {
            signatures.push(v1);
        }
    }

    let Some(ts_str) = timestamp else {
        return false;
    };
    let Ok(ts) = ts_str.parse::<i64>() else {
        return false;
    };

    if (now - ts).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(delta = (now - ts).abs(), "Stripe webhook signature too old");
        return false;
    }

    let signed_payload = format!("{ts_str}.{payload}");
    signatures.into_iter().any(|expected_hex| {
        let Some(expected_bytes) = hex_decode(expected_hex) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(webhook_secret.as_bytes()) else {
            return false;
        };
        mac.update(signed_payload.as_bytes());
        mac.verify_slice(&expected_bytes).is_ok()
    })
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use hmac::Mac;

    use super::*;

    fn sign(payload: &str, secret: &str, ts: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("key");
        mac.update(format!("{ts}.{payload}").as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }

    #[test]
    fn accepts_fresh_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = format!("t=1700000000,v1={}", sign(payload, "whsec", 1_700_000_000));
        assert!(verify_stripe_signature_at(
            payload,
            &header,
            "whsec",
            1_700_000_100
        ));
    }

    #[test]
    fn accepts_any_matching_v1_entry() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = format!(
            "t=1700000000,v1=00ff,v1={}",
            sign(payload, "whsec", 1_700_000_000)
        );
        assert!(verify_stripe_signature_at(
            payload,
            &header,
            "whsec",
            1_700_000_000
        ));
    }

    #[test]
    fn rejects_stale_or_tampered_payloads() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = format!("t=1700000000,v1={}", sign(payload, "whsec", 1_700_000_000));
        assert!(!verify_stripe_signature_at(
            payload,
            &header,
            "whsec",
            1_700_000_301
        ));
        assert!(!verify_stripe_signature_at(
            r#"{"id":"evt_2"}"#,
            &header,
            "whsec",
            1_700_000_000
        ));
        assert!(!verify_stripe_signature_at(
            payload,
            "v1=abcd",
            "whsec",
            1_700_000_000
        ));
    }

    #[test]
    fn malformed_hex_entries_never_match() {
        let payload = r#"{"id":"evt_1"}"#;
        for entry in ["abc", "zz", "é1"] {
            let header = format!("t=1700000000,v1={entry}");
            assert!(!verify_stripe_signature_at(payload, &header, "whsec", 1_700_000_000));
        }
        assert_eq!(hex_decode("0aFF"), Some(vec![0x0a, 0xff]));
        assert_eq!(hex_decode("0g"), None);
    }

    #[test]
    fn intent_params_request_off_session_sepa_debit() {
        let request = IntentRequest {
            amount: 300_000,
            customer_id: "cus_1".to_string(),
            payment_method_id: "pm_1".to_string(),
            description: "Booking b-1".to_string(),
            metadata: vec![("booking_id", "b-1".to_string())],
            idempotency_key: "key".to_string(),
        };
        let params = intent_params(&request, "eur");
        let has = |key: &str, value: &str| {
            params
                .iter()
                .any(|(k, v)| k.as_str() == key && v.as_str() == value)
        };
        assert!(has("amount", "300000"));
        assert!(has("payment_method_types[]", "sepa_debit"));
        assert!(has("confirm", "true"));
        assert!(has("off_session", "true"));
        assert!(has("metadata[booking_id]", "b-1"));
    }

    #[test]
    fn invoice_params_finalize_on_due_date() {
        let request = InvoiceRequest {
            amount: 93_000,
            customer_id: "cus_1".to_string(),
            payment_method_id: "pm_1".to_string(),
            description: "Rent March 2026".to_string(),
            finalize_at: 1_772_323_200,
            metadata: vec![("transaction_id", "t-1".to_string())],
            idempotency_key: "key".to_string(),
        };
        let params = invoice_params(&request);
        assert!(params.contains(&(
            "automatically_finalizes_at".to_string(),
            "1772323200".to_string()
        )));
        assert!(params.contains(&(
            "collection_method".to_string(),
            "charge_automatically".to_string()
        )));
        let item = invoice_item_params(&request, "in_1", "eur");
        assert!(item.contains(&("invoice".to_string(), "in_1".to_string())));
        assert!(item.contains(&("amount".to_string(), "93000".to_string())));
    }

    #[test]
    fn gateway_errors_map_to_processor_or_dependency() {
        use axum::http::StatusCode;

        assert_eq!(
            AppError::from(GatewayError::NotConfigured).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::from(GatewayError::Rejected {
                status: 402,
                message: "declined".to_string()
            })
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
