use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use ingest_core::config::Config;
use ingest_core::model::{EventType, NormalizedContext, PaymentEventType, RawEvent, RevenueProvider, Site};
use ingest_core::rollup as core_rollup;

use crate::backend::DuckDbBackend;
use crate::{crypto, event_store, rollup_store};

type HmacSha256 = Hmac<Sha256>;

const STRIPE_TOLERANCE_MS: i64 = 5 * 60 * 1000;
const SENSITIVE_METADATA_KEYS: &[&str] = &["email", "name", "user_id", "customer_id"];

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing or malformed signature header")]
    BadSignature,
    #[error("signature verification failed")]
    SignatureMismatch,
    #[error("signature timestamp outside tolerance")]
    TimestampOutOfRange,
    #[error("malformed webhook payload")]
    MalformedPayload,
    #[error("missing visitor attribution key")]
    MissingVisitorAttribution,
    #[error("unsupported event type")]
    UnsupportedEventType,
    #[error("site not configured for this provider")]
    ProviderNotConfigured,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<duckdb::Error> for WebhookError {
    fn from(e: duckdb::Error) -> Self {
        Self::Internal(e.into())
    }
}

pub struct WebhookOutcome {
    pub deduped: bool,
}

/// Verifies Stripe's `t=<unix_seconds>,v1=<hex hmac>` scheme: the signed
/// payload is `"{t}.{body}"`, and `t` must be within `STRIPE_TOLERANCE_MS`
/// of `now_ms` to defeat replay.
pub fn verify_stripe_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now_ms: i64,
) -> Result<(), WebhookError> {
    let mut timestamp = None;
    let mut v1 = None;
    for part in header.split(',') {
        let mut kv = part.splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(v)) => timestamp = v.parse::<i64>().ok(),
            (Some("v1"), Some(v)) => v1 = Some(v),
            _ => {}
        }
    }
    let (timestamp, v1) = match (timestamp, v1) {
        (Some(t), Some(v)) => (t, v),
        _ => return Err(WebhookError::BadSignature),
    };

    if (timestamp * 1000 - now_ms).abs() > STRIPE_TOLERANCE_MS {
        return Err(WebhookError::TimestampOutOfRange);
    }

    let signed_payload = format!("{timestamp}.{}", String::from_utf8_lossy(body));
    let expected = hex::decode(v1).map_err(|_| WebhookError::BadSignature)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| WebhookError::Internal(e.into()))?;
    mac.update(signed_payload.as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::SignatureMismatch)
}

/// Verifies Lemonsqueezy's plain hex HMAC-SHA256 of the raw body.
pub fn verify_lemonsqueezy_signature(secret: &str, header: &str, body: &[u8]) -> Result<(), WebhookError> {
    let expected = hex::decode(header.trim()).map_err(|_| WebhookError::BadSignature)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| WebhookError::Internal(e.into()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::SignatureMismatch)
}

struct PaymentFields {
    event_type_raw: String,
    amount_minor: i64,
    currency: String,
    transaction_id: String,
    customer_id: Option<String>,
    email: Option<String>,
    name: Option<String>,
    visitor_id: String,
    refunded: bool,
}

fn extract_payment_fields(payload: &Value) -> Result<PaymentFields, WebhookError> {
    let event_type_raw = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or(WebhookError::MalformedPayload)?
        .to_string();
    if !matches!(event_type_raw.as_str(), "order_created" | "subscription_payment_success") {
        return Err(WebhookError::UnsupportedEventType);
    }

    let data = payload.get("data").ok_or(WebhookError::MalformedPayload)?;
    let amount_minor = data
        .get("amount")
        .and_then(Value::as_i64)
        .ok_or(WebhookError::MalformedPayload)?;
    let currency = data
        .get("currency")
        .and_then(Value::as_str)
        .ok_or(WebhookError::MalformedPayload)?
        .to_ascii_lowercase();
    let transaction_id = data
        .get("id")
        .and_then(Value::as_str)
        .ok_or(WebhookError::MalformedPayload)?
        .to_string();
    let customer_id = data.get("customer_id").and_then(Value::as_str).map(str::to_string);
    let email = data.get("email").and_then(Value::as_str).map(str::to_string);
    let name = data.get("name").and_then(Value::as_str).map(str::to_string);
    let refunded = data.get("refunded").and_then(Value::as_bool).unwrap_or(false);

    let custom_data = data
        .get("meta")
        .and_then(|m| m.get("custom_data"))
        .ok_or(WebhookError::MissingVisitorAttribution)?;
    let visitor_id = custom_data
        .get("ezlytics_visitor_id")
        .or_else(|| custom_data.get("datafast_visitor_id"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or(WebhookError::MissingVisitorAttribution)?
        .to_string();

    Ok(PaymentFields {
        event_type_raw,
        amount_minor,
        currency,
        transaction_id,
        customer_id,
        email,
        name,
        visitor_id,
        refunded,
    })
}

impl DuckDbBackend {
    /// Verifies the provider signature, then processes the payload. `config`
    /// supplies both the per-provider webhook signing secret and the
    /// field-encryption secret (`REVENUE_PROVIDER_KEY_SECRET`) — these are
    /// deliberately distinct: one authenticates the request, the other
    /// protects data at rest.
    pub async fn process_webhook(
        &self,
        config: &Config,
        site: &Site,
        provider: RevenueProvider,
        signature_header: &str,
        body: &[u8],
        now_ms: i64,
    ) -> Result<WebhookOutcome, WebhookError> {
        if site.revenue_provider != provider {
            return Err(WebhookError::ProviderNotConfigured);
        }

        match provider {
            RevenueProvider::Stripe => {
                let secret = config
                    .stripe_webhook_secret
                    .as_deref()
                    .ok_or(WebhookError::ProviderNotConfigured)?;
                verify_stripe_signature(secret, signature_header, body, now_ms)?;
            }
            RevenueProvider::Lemonsqueezy => {
                let secret = config
                    .lemonsqueezy_webhook_secret
                    .as_deref()
                    .ok_or(WebhookError::ProviderNotConfigured)?;
                verify_lemonsqueezy_signature(secret, signature_header, body)?;
            }
            RevenueProvider::None => return Err(WebhookError::ProviderNotConfigured),
        }

        let payload: Value = serde_json::from_slice(body).map_err(|_| WebhookError::MalformedPayload)?;
        let fields = extract_payment_fields(&payload)?;

        let event_type = if fields.refunded {
            PaymentEventType::Refund
        } else if fields.event_type_raw == "subscription_payment_success" {
            PaymentEventType::Renewal
        } else {
            PaymentEventType::New
        };

        let conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let attribution = event_store::find_latest_pageview(&tx, &site.id, &fields.visitor_id)?;

        let mut metadata: ingest_core::model::Metadata = std::collections::BTreeMap::new();
        for (key, value) in [
            ("email", fields.email.as_deref()),
            ("name", fields.name.as_deref()),
            ("customer_id", fields.customer_id.as_deref()),
        ] {
            if let Some(v) = value {
                let stored = if SENSITIVE_METADATA_KEYS.contains(&key) {
                    crypto::encrypt_field(&config.revenue_provider_key_secret, v)?
                } else {
                    v.to_string()
                };
                metadata.insert(key.to_string(), Value::String(stored));
            }
        }
        if let Some(prior) = &attribution {
            metadata.insert(
                "attributed_pageview_id".to_string(),
                Value::String(prior.id.clone()),
            );
            metadata.insert(
                "attributed_pageview_timestamp_ms".to_string(),
                Value::from(prior.timestamp_ms),
            );
        }
        // Not sensitive, and the rebuilder needs them to recompute
        // `payment_deltas` from raw_events alone.
        metadata.insert("amount_minor".to_string(), Value::from(fields.amount_minor));
        metadata.insert("currency".to_string(), Value::String(fields.currency.clone()));
        metadata.insert(
            "payment_event_type".to_string(),
            Value::String(payment_event_type_str(event_type).to_string()),
        );

        let transaction_id = fields.transaction_id.clone();
        tx.execute(
            "INSERT INTO payments (site_id, transaction_id, amount_minor, currency, provider, event_type, visitor_id, customer_id, email, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, CURRENT_TIMESTAMP)
             ON CONFLICT (site_id, transaction_id) DO NOTHING",
            duckdb::params![
                site.id,
                transaction_id,
                fields.amount_minor,
                fields.currency,
                crate::backend::revenue_provider_str(provider),
                payment_event_type_str(event_type),
                fields.visitor_id,
                fields.customer_id,
                fields.email,
            ],
        )?;

        let normalized = attribution
            .as_ref()
            .map(|p| p.normalized.clone())
            .unwrap_or_default();

        let payment_event = RawEvent {
            id: uuid::Uuid::new_v4().to_string(),
            site_id: site.id.clone(),
            event_id: Some(format!("{transaction_id}:payment")),
            event_type: EventType::Payment,
            name: None,
            visitor_id: fields.visitor_id.clone(),
            session_id: attribution.as_ref().and_then(|p| p.session_id.clone()),
            timestamp_ms: now_ms,
            metadata: metadata.clone(),
            normalized: normalized.clone(),
            created_at: chrono::Utc::now(),
        };
        let payment_deduped = event_store::insert_event(&tx, &payment_event)?;

        let goal_name = if fields.amount_minor > 0 { "payment" } else { "free_trial" };
        let goal_event = RawEvent {
            id: uuid::Uuid::new_v4().to_string(),
            site_id: site.id.clone(),
            event_id: Some(format!("{transaction_id}:goal")),
            event_type: EventType::Goal,
            name: Some(goal_name.to_string()),
            visitor_id: fields.visitor_id.clone(),
            session_id: payment_event.session_id.clone(),
            timestamp_ms: now_ms,
            metadata: metadata.clone(),
            normalized: NormalizedContext::default(),
            created_at: chrono::Utc::now(),
        };
        let goal_deduped = event_store::insert_event(&tx, &goal_event)?;

        if !payment_deduped {
            let delta = core_rollup::payment_deltas(fields.amount_minor, event_type, now_ms);
            rollup_store::apply_metrics(&tx, &site.id, &delta)?;
        }
        if !goal_deduped {
            let (metrics, dim) = core_rollup::goal_deltas(goal_name, now_ms);
            rollup_store::apply_metrics(&tx, &site.id, &metrics)?;
            rollup_store::apply_dimension(&tx, &site.id, &dim)?;
        }

        tx.commit()?;
        Ok(WebhookOutcome {
            deduped: payment_deduped && goal_deduped,
        })
    }
}

fn payment_event_type_str(t: PaymentEventType) -> &'static str {
    match t {
        PaymentEventType::New => "new",
        PaymentEventType::Renewal => "renewal",
        PaymentEventType::Refund => "refund",
    }
}
