//! Stripe events (charges, payment intents, invoices, ...)

use std::sync::Arc;

use async_trait::async_trait;
use hr_common::{Headers, InboundEvent, Result, SinkRecord, SourceKind};
use hr_config::{ConfigError, SourceConfig};
use hr_sink::SinkConnector;
use serde_json::Value;

use crate::helpers::{base_record, epoch_to_iso, json_object, require_secret, str_at, verify_source};
use crate::Integration;

/// Currencies whose amounts are already in major units
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "bif", "clp", "djf", "gnf", "jpy", "kmf", "krw", "mga", "pyg", "rwf", "ugx", "vnd", "vuv", "xaf",
    "xof", "xpf",
];

pub struct StripeIntegration {
    config: SourceConfig,
    connector: Arc<SinkConnector>,
}

impl StripeIntegration {
    pub fn new(config: SourceConfig, connector: Arc<SinkConnector>) -> std::result::Result<Self, ConfigError> {
        require_secret(SourceKind::Stripe, &config)?;
        Ok(Self { config, connector })
    }
}

/// Convert a minor-unit amount to major units for `currency`
pub fn normalize_amount(amount: i64, currency: Option<&str>) -> Value {
    let zero_decimal = currency
        .map(|c| ZERO_DECIMAL_CURRENCIES.contains(&c.to_ascii_lowercase().as_str()))
        .unwrap_or(false);

    if zero_decimal {
        Value::from(amount)
    } else {
        Value::from(amount as f64 / 100.0)
    }
}

#[async_trait]
impl Integration for StripeIntegration {
    fn source(&self) -> SourceKind {
        SourceKind::Stripe
    }

    fn verify_request(&self, raw_payload: &[u8], headers: &Headers) -> bool {
        verify_source(SourceKind::Stripe, &self.config, raw_payload, headers)
    }

    fn transform(&self, event: &InboundEvent) -> Result<SinkRecord> {
        let payload = json_object(event)?;
        let object = payload.pointer("/data/object").cloned().unwrap_or(Value::Null);
        let currency = str_at(&object, "/currency");
        let amount = object
            .get("amount")
            .or_else(|| object.get("amount_total"))
            .and_then(Value::as_i64);

        let mut record = base_record(event);
        record.set_opt("Event_Type", str_at(&payload, "/type"));
        record.set_opt("Event_Id", str_at(&payload, "/id"));
        record.set_opt("Amount", amount.map(|a| normalize_amount(a, currency.as_deref())));
        record.set_opt("Currency", currency.map(|c| c.to_ascii_uppercase()));
        // `customer` is an id unless the event was sent with it expanded
        record.set_opt(
            "Customer",
            str_at(&object, "/customer").or_else(|| str_at(&object, "/customer/id")),
        );
        record.set_opt("Object_Id", str_at(&object, "/id"));
        record.set_opt(
            "Created_At",
            payload.get("created").and_then(Value::as_i64).and_then(epoch_to_iso),
        );
        record.set_opt("Livemode", payload.get("livemode").and_then(Value::as_bool));
        Ok(record)
    }

    fn connector(&self) -> &SinkConnector {
        &self.connector
    }
}
