//! Hand-rolled subset of the Stripe wire format used by the gateway.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub created: i64,
    pub data: StripeEventData,
    pub livemode: bool,
    pub api_version: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StripePaymentIntent {
    pub id: String,
    pub object: String,
    pub amount: i64,
    pub amount_received: Option<i64>,
    pub currency: String,
    pub customer: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    pub status: StripePaymentIntentStatus,
    pub client_secret: Option<String>,
    pub created: i64,
    pub last_payment_error: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StripePaymentIntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
}

/// The charge object carried by `charge.refunded` events. Only the fields
/// the reconciler needs.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StripeChargeObject {
    pub id: String,
    pub amount_refunded: i64,
    pub payment_intent: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn payment_intent_parses_from_api_payload() {
        let json = r#"{
            "id": "pi_123",
            "object": "payment_intent",
            "amount": 500,
            "amount_received": 500,
            "currency": "usd",
            "customer": null,
            "description": "Credit purchase",
            "metadata": {"oauth_provider": "oauth:google", "external_id": "u1"},
            "status": "succeeded",
            "client_secret": "pi_123_secret_abc",
            "created": 1735689600,
            "last_payment_error": null
        }"#;
        let intent: StripePaymentIntent = serde_json::from_str(json).unwrap();
        assert_eq!(intent.id, "pi_123");
        assert_eq!(intent.status, StripePaymentIntentStatus::Succeeded);
        assert_eq!(
            intent.metadata.unwrap().get("external_id").map(String::as_str),
            Some("u1")
        );
    }

    #[test]
    fn event_envelope_parses_with_unknown_object() {
        let json = r#"{
            "id": "evt_1",
            "type": "customer.created",
            "created": 1735689600,
            "data": {"object": {"id": "cus_1", "object": "customer"}},
            "livemode": false,
            "api_version": "2023-10-16"
        }"#;
        let event: StripeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.type_, "customer.created");
        assert_eq!(event.data.object["id"], "cus_1");
    }
}
