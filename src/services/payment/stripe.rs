use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use async_trait::async_trait;
use log::{info, warn};

use crate::models::enums::PaymentStatus;
use crate::models::identity::AccountIdentity;
use crate::services::payment::stripe_types::{
    StripeChargeObject, StripeEvent, StripePaymentIntent, StripePaymentIntentStatus,
};
use crate::services::payment::{
    CreateIntentRequest, GatewayIntent, PaymentGateway, PaymentGatewayError, WebhookEvent,
};

type HmacSha256 = Hmac<Sha256>;

const STRIPE_API_BASE: &str = "https://api.stripe.com";

/// Accepted clock skew between the signature timestamp and now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub struct StripeGateway {
    http: reqwest::Client,
    secret_key: String,
    webhook_secret: String,
    api_base: String,
    request_timeout: Duration,
}

impl std::fmt::Debug for StripeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeGateway")
            .field("secret_key", &"<redacted>")
            .field("webhook_secret", &"<redacted>")
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl StripeGateway {
    pub fn new(secret_key: String, webhook_secret: String, request_timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret_key,
            webhook_secret,
            api_base: STRIPE_API_BASE.to_string(),
            request_timeout: Duration::from_secs(request_timeout_secs),
        }
    }

    /// Points the gateway at a different API host (test servers).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Verify the `Stripe-Signature` header against the raw payload.
    fn verify_signature(&self, payload: &str, signature: &str) -> Result<(), PaymentGatewayError> {
        let elements: Vec<&str> = signature.split(',').collect();
        let mut timestamp = "";
        let mut signatures = Vec::new();

        for element in elements {
            if let Some(t) = element.strip_prefix("t=") {
                timestamp = t;
            } else if let Some(s) = element.strip_prefix("v1=") {
                signatures.push(s);
            }
        }

        if timestamp.is_empty() || signatures.is_empty() {
            return Err(PaymentGatewayError::SignatureInvalid(
                "Invalid signature format".to_string(),
            ));
        }

        let timestamp_secs = timestamp.parse::<i64>().map_err(|_| {
            PaymentGatewayError::SignatureInvalid("Invalid signature timestamp".to_string())
        })?;
        let now = chrono::Utc::now().timestamp();
        if (now - timestamp_secs).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(PaymentGatewayError::SignatureInvalid(
                "Signature timestamp outside tolerance".to_string(),
            ));
        }

        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|e| PaymentGatewayError::SignatureInvalid(format!("HMAC error: {}", e)))?;
        mac.update(signed_payload.as_bytes());
        let expected = mac.finalize().into_bytes();

        for signature in signatures {
            if let Ok(candidate) = hex::decode(signature) {
                if bool::from(expected.as_slice().ct_eq(candidate.as_slice())) {
                    return Ok(());
                }
            }
        }

        Err(PaymentGatewayError::SignatureInvalid(
            "Signature verification failed".to_string(),
        ))
    }

    async fn fetch_intent(&self, external_id: &str) -> Result<StripePaymentIntent, PaymentGatewayError> {
        let url = format!("{}/v1/payment_intents/{}", self.api_base, external_id);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.secret_key, None::<&str>)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| PaymentGatewayError::Api(format!("Stripe request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentGatewayError::Api(format!(
                "Stripe returned {}: {}",
                status, body
            )));
        }

        response
            .json::<StripePaymentIntent>()
            .await
            .map_err(|e| PaymentGatewayError::Api(format!("Failed to parse payment intent: {}", e)))
    }
}

fn map_intent_status(status: StripePaymentIntentStatus) -> PaymentStatus {
    match status {
        StripePaymentIntentStatus::RequiresPaymentMethod
        | StripePaymentIntentStatus::RequiresConfirmation
        | StripePaymentIntentStatus::RequiresAction => PaymentStatus::RequiresPaymentMethod,
        StripePaymentIntentStatus::Processing | StripePaymentIntentStatus::RequiresCapture => {
            PaymentStatus::Processing
        }
        StripePaymentIntentStatus::Canceled => PaymentStatus::Canceled,
        StripePaymentIntentStatus::Succeeded => PaymentStatus::Succeeded,
    }
}

fn intent_projection(intent: StripePaymentIntent) -> GatewayIntent {
    GatewayIntent {
        status: map_intent_status(intent.status),
        external_id: intent.id,
        client_secret: intent.client_secret,
        amount_minor: intent.amount,
        currency: intent.currency.to_uppercase(),
    }
}

fn identity_from_metadata(
    metadata: Option<&std::collections::HashMap<String, String>>,
) -> Option<AccountIdentity> {
    let metadata = metadata?;
    let oauth_provider = metadata.get("oauth_provider")?.clone();
    let external_id = metadata.get("external_id")?.clone();
    Some(AccountIdentity {
        oauth_provider,
        external_id,
        wa_id: metadata.get("wa_id").cloned(),
        tenant_id: metadata.get("tenant_id").cloned(),
    })
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider_name(&self) -> &str {
        "stripe"
    }

    fn signature_header(&self) -> &'static str {
        "Stripe-Signature"
    }

    async fn create_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<GatewayIntent, PaymentGatewayError> {
        let mut params: Vec<(&str, String)> = vec![
            ("amount", request.amount_minor.to_string()),
            ("currency", request.currency.to_lowercase()),
            ("description", "Credit purchase".to_string()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
            ("metadata[account_id]", request.account_id.to_string()),
            (
                "metadata[oauth_provider]",
                request.identity.oauth_provider.clone(),
            ),
            ("metadata[external_id]", request.identity.external_id.clone()),
            (
                "metadata[uses_purchased]",
                request.uses_purchased.to_string(),
            ),
        ];
        if let Some(wa_id) = &request.identity.wa_id {
            params.push(("metadata[wa_id]", wa_id.clone()));
        }
        if let Some(tenant_id) = &request.identity.tenant_id {
            params.push(("metadata[tenant_id]", tenant_id.clone()));
        }
        if let Some(email) = &request.customer_email {
            params.push(("receipt_email", email.clone()));
        }

        let url = format!("{}/v1/payment_intents", self.api_base);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.secret_key, None::<&str>)
            .timeout(self.request_timeout)
            .form(&params)
            .send()
            .await
            .map_err(|e| PaymentGatewayError::Api(format!("Stripe request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentGatewayError::Api(format!(
                "Stripe returned {}: {}",
                status, body
            )));
        }

        let intent = response
            .json::<StripePaymentIntent>()
            .await
            .map_err(|e| {
                PaymentGatewayError::Api(format!("Failed to parse payment intent: {}", e))
            })?;

        info!(
            "Created PaymentIntent {} for account {}",
            intent.id, request.account_id
        );
        Ok(intent_projection(intent))
    }

    async fn confirm(&self, external_id: &str) -> Result<GatewayIntent, PaymentGatewayError> {
        let intent = self.fetch_intent(external_id).await?;
        Ok(intent_projection(intent))
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookEvent, PaymentGatewayError> {
        let payload = std::str::from_utf8(payload).map_err(|_| {
            PaymentGatewayError::SignatureInvalid("Webhook body is not valid UTF-8".to_string())
        })?;

        self.verify_signature(payload, signature_header)?;

        let event: StripeEvent = serde_json::from_str(payload).map_err(|e| {
            PaymentGatewayError::SignatureInvalid(format!("Failed to parse event: {}", e))
        })?;

        match event.type_.as_str() {
            "payment_intent.succeeded" => {
                let intent: StripePaymentIntent =
                    serde_json::from_value(event.data.object).map_err(|e| {
                        PaymentGatewayError::SignatureInvalid(format!(
                            "Malformed payment_intent object: {}",
                            e
                        ))
                    })?;
                Ok(WebhookEvent::PaymentSucceeded {
                    amount_minor: intent.amount_received.unwrap_or(intent.amount),
                    identity: identity_from_metadata(intent.metadata.as_ref()),
                    external_id: intent.id,
                })
            }
            "payment_intent.payment_failed" => {
                let intent: StripePaymentIntent =
                    serde_json::from_value(event.data.object).map_err(|e| {
                        PaymentGatewayError::SignatureInvalid(format!(
                            "Malformed payment_intent object: {}",
                            e
                        ))
                    })?;
                let reason = intent
                    .last_payment_error
                    .as_ref()
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string);
                Ok(WebhookEvent::PaymentFailed {
                    external_id: intent.id,
                    reason,
                })
            }
            "charge.refunded" => {
                let charge: StripeChargeObject = serde_json::from_value(event.data.object)
                    .map_err(|e| {
                        PaymentGatewayError::SignatureInvalid(format!(
                            "Malformed charge object: {}",
                            e
                        ))
                    })?;
                Ok(WebhookEvent::Refund {
                    external_id: charge.payment_intent.unwrap_or(charge.id),
                    amount_minor: charge.amount_refunded,
                })
            }
            other => {
                warn!("Ignoring Stripe event type: {}", other);
                Ok(WebhookEvent::Ignored {
                    kind: other.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn gateway() -> StripeGateway {
        StripeGateway::new("sk_test_123".to_string(), "whsec_test".to_string(), 10)
    }

    /// Builds a Stripe-Signature header the way the provider does.
    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn succeeded_event_payload() -> String {
        serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "created": 1735689600,
            "livemode": false,
            "api_version": "2023-10-16",
            "data": {
                "object": {
                    "id": "pi_X",
                    "object": "payment_intent",
                    "amount": 500,
                    "amount_received": 500,
                    "currency": "usd",
                    "customer": null,
                    "description": null,
                    "metadata": {"oauth_provider": "oauth:google", "external_id": "u1"},
                    "status": "succeeded",
                    "client_secret": null,
                    "created": 1735689600,
                    "last_payment_error": null
                }
            }
        })
        .to_string()
    }

    #[test]
    fn verifies_valid_signature_and_maps_succeeded_event() {
        let gateway = gateway();
        let payload = succeeded_event_payload();
        let header = sign(&payload, "whsec_test", chrono::Utc::now().timestamp());

        let event = gateway.verify_webhook(payload.as_bytes(), &header).unwrap();
        match event {
            WebhookEvent::PaymentSucceeded {
                external_id,
                amount_minor,
                identity,
            } => {
                assert_eq!(external_id, "pi_X");
                assert_eq!(amount_minor, 500);
                let identity = identity.unwrap();
                assert_eq!(identity.oauth_provider, "oauth:google");
                assert_eq!(identity.external_id, "u1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn rejects_tampered_payload() {
        let gateway = gateway();
        let payload = succeeded_event_payload();
        let header = sign(&payload, "whsec_test", chrono::Utc::now().timestamp());
        let tampered = payload.replace("500", "9000");

        let result = gateway.verify_webhook(tampered.as_bytes(), &header);
        assert!(matches!(
            result,
            Err(PaymentGatewayError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn rejects_signature_signed_with_wrong_secret() {
        let gateway = gateway();
        let payload = succeeded_event_payload();
        let header = sign(&payload, "whsec_other", chrono::Utc::now().timestamp());

        let result = gateway.verify_webhook(payload.as_bytes(), &header);
        assert!(matches!(
            result,
            Err(PaymentGatewayError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let gateway = gateway();
        let payload = succeeded_event_payload();
        let stale = chrono::Utc::now().timestamp() - SIGNATURE_TOLERANCE_SECS - 60;
        let header = sign(&payload, "whsec_test", stale);

        let result = gateway.verify_webhook(payload.as_bytes(), &header);
        assert!(matches!(
            result,
            Err(PaymentGatewayError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn rejects_malformed_header() {
        let gateway = gateway();
        let payload = succeeded_event_payload();

        let result = gateway.verify_webhook(payload.as_bytes(), "v1=deadbeef");
        assert!(matches!(
            result,
            Err(PaymentGatewayError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn unknown_event_kind_is_ignored_not_rejected() {
        let gateway = gateway();
        let payload = serde_json::json!({
            "id": "evt_2",
            "type": "customer.created",
            "created": 1735689600,
            "livemode": false,
            "api_version": null,
            "data": {"object": {"id": "cus_1"}}
        })
        .to_string();
        let header = sign(&payload, "whsec_test", chrono::Utc::now().timestamp());

        let event = gateway.verify_webhook(payload.as_bytes(), &header).unwrap();
        assert_eq!(
            event,
            WebhookEvent::Ignored {
                kind: "customer.created".to_string()
            }
        );
    }

    #[tokio::test]
    async fn create_intent_posts_form_and_parses_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/payment_intents")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("amount".into(), "500".into()),
                mockito::Matcher::UrlEncoded("currency".into(), "usd".into()),
                mockito::Matcher::UrlEncoded(
                    "metadata[oauth_provider]".into(),
                    "oauth:google".into(),
                ),
                mockito::Matcher::UrlEncoded("metadata[external_id]".into(), "u1".into()),
            ]))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "id": "pi_123",
                    "object": "payment_intent",
                    "amount": 500,
                    "amount_received": null,
                    "currency": "usd",
                    "customer": null,
                    "description": "Credit purchase",
                    "metadata": {},
                    "status": "requires_payment_method",
                    "client_secret": "pi_123_secret",
                    "created": 1735689600,
                    "last_payment_error": null
                })
                .to_string(),
            )
            .create_async()
            .await;

        let gateway = gateway().with_api_base(server.url());
        let request = CreateIntentRequest {
            account_id: Uuid::new_v4(),
            identity: AccountIdentity::new("oauth:google", "u1"),
            amount_minor: 500,
            currency: "USD".to_string(),
            uses_purchased: 50,
            customer_email: None,
            return_url: None,
        };

        let intent = gateway.create_intent(&request).await.unwrap();
        assert_eq!(intent.external_id, "pi_123");
        assert_eq!(intent.status, PaymentStatus::RequiresPaymentMethod);
        assert_eq!(intent.client_secret.as_deref(), Some("pi_123_secret"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn create_intent_surfaces_provider_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/payment_intents")
            .with_status(503)
            .with_body("{\"error\": {\"message\": \"overloaded\"}}")
            .create_async()
            .await;

        let gateway = gateway().with_api_base(server.url());
        let request = CreateIntentRequest {
            account_id: Uuid::new_v4(),
            identity: AccountIdentity::new("oauth:google", "u1"),
            amount_minor: 500,
            currency: "USD".to_string(),
            uses_purchased: 50,
            customer_email: None,
            return_url: None,
        };

        let result = gateway.create_intent(&request).await;
        assert!(matches!(result, Err(PaymentGatewayError::Api(_))));
    }

    #[tokio::test]
    async fn confirm_fetches_current_intent_state() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/payment_intents/pi_123")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "id": "pi_123",
                    "object": "payment_intent",
                    "amount": 500,
                    "amount_received": 500,
                    "currency": "usd",
                    "customer": null,
                    "description": null,
                    "metadata": {},
                    "status": "succeeded",
                    "client_secret": null,
                    "created": 1735689600,
                    "last_payment_error": null
                })
                .to_string(),
            )
            .create_async()
            .await;

        let gateway = gateway().with_api_base(server.url());
        let intent = gateway.confirm("pi_123").await.unwrap();
        assert_eq!(intent.status, PaymentStatus::Succeeded);
        assert_eq!(intent.amount_minor, 500);
    }
}
