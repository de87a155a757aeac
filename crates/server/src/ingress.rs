//! Webhook ingress. Both endpoints only enqueue; processing happens in the
//! worker so that provider retries collapse onto one job per event.

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Form, Json, Router,
};
use carelink_core::chrono::Utc;
use carelink_core::config::WebhookConfig;
use carelink_core::domain::job::{
    IdempotencyKey, InboundMessagePayload, JobType, PaymentEventPayload,
};
use carelink_core::errors::{ApplicationError, DomainError, InterfaceError};
use carelink_core::webhook_signature::{verify_signature, verify_twilio_signature, SignatureError};
use carelink_db::JobQueue;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

pub const PAYMENT_SIGNATURE_HEADER: &str = "stripe-signature";
pub const SMS_SIGNATURE_HEADER: &str = "x-twilio-signature";

#[derive(Clone)]
pub struct IngressState {
    jobs: JobQueue,
    payment_signing_secret: Option<SecretString>,
    signature_tolerance_secs: u64,
    sms_auth_token: Option<SecretString>,
    public_base_url: String,
}

impl IngressState {
    pub fn new(jobs: JobQueue, webhooks: &WebhookConfig) -> Self {
        Self {
            jobs,
            payment_signing_secret: webhooks.payment_signing_secret.clone(),
            signature_tolerance_secs: webhooks.signature_tolerance_secs,
            sms_auth_token: webhooks.sms_auth_token.clone(),
            public_base_url: webhooks
                .public_base_url
                .as_deref()
                .unwrap_or_default()
                .trim()
                .trim_end_matches('/')
                .to_owned(),
        }
    }
}

pub fn router(state: IngressState) -> Router {
    Router::new()
        .route("/webhooks/sms", post(sms_webhook))
        .route("/webhooks/payments", post(payment_webhook))
        .with_state(state)
}

/// The fields read out of a Twilio form. Every posted field is covered by the
/// signature, so the full form is extracted first.
#[derive(Debug)]
pub struct SmsWebhookForm {
    pub message_sid: String,
    pub from: String,
    pub body: String,
}

impl SmsWebhookForm {
    fn from_params(params: &BTreeMap<String, String>) -> Self {
        let field = |name: &str| params.get(name).cloned().unwrap_or_default();
        Self { message_sid: field("MessageSid"), from: field("From"), body: field("Body") }
    }
}

#[derive(Debug, Deserialize)]
struct PaymentEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Option<PaymentEventData>,
}

#[derive(Debug, Deserialize)]
struct PaymentEventData {
    #[serde(default)]
    object: Value,
}

impl PaymentEvent {
    fn into_payload(self) -> PaymentEventPayload {
        let object = self.data.map(|data| data.object).unwrap_or(Value::Null);
        let metadata = object.get("metadata");
        let user_id = ["externalId", "userId"]
            .iter()
            .find_map(|key| metadata.and_then(|meta| meta.get(*key)).and_then(Value::as_str))
            .map(str::to_owned);
        let status = object.get("status").and_then(Value::as_str).map(str::to_owned);
        PaymentEventPayload { event_id: self.id, event_type: self.event_type, user_id, status }
    }
}

/// Maps an [`InterfaceError`] to a JSON response with a user-safe message.
pub struct ErrorResponse(pub InterfaceError);

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let (status, correlation_id) = match &self.0 {
            InterfaceError::BadRequest { correlation_id, .. } => {
                (StatusCode::BAD_REQUEST, correlation_id)
            }
            InterfaceError::Unauthorized { correlation_id, .. } => {
                (StatusCode::UNAUTHORIZED, correlation_id)
            }
            InterfaceError::ServiceUnavailable { correlation_id, .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, correlation_id)
            }
            InterfaceError::Internal { correlation_id, .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, correlation_id)
            }
        };
        let body = json!({ "error": self.0.user_message(), "correlation_id": correlation_id });
        (status, Json(body)).into_response()
    }
}

fn reject(error: ApplicationError, correlation_id: &str, route: &'static str) -> ErrorResponse {
    warn!(
        event_name = "ingress.rejected",
        correlation_id,
        route,
        error = %error,
        "webhook rejected"
    );
    ErrorResponse(error.into_interface(correlation_id))
}

fn invalid(message: &str) -> ApplicationError {
    ApplicationError::Domain(DomainError::InvariantViolation(message.to_owned()))
}

pub async fn sms_webhook(
    State(state): State<IngressState>,
    uri: Uri,
    headers: HeaderMap,
    Form(params): Form<BTreeMap<String, String>>,
) -> Result<(StatusCode, Json<Value>), ErrorResponse> {
    let correlation_id = format!("req-{}", Uuid::new_v4());

    if let Some(token) = &state.sms_auth_token {
        let header = headers
            .get(SMS_SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| reject(SignatureError::MalformedHeader.into(), &correlation_id, "sms"))?;
        let path = uri.path_and_query().map_or_else(|| uri.path(), |path| path.as_str());
        let url = format!("{}{path}", state.public_base_url);
        verify_twilio_signature(token.expose_secret().as_bytes(), header, &url, &params)
            .map_err(|error| reject(error.into(), &correlation_id, "sms"))?;
    }

    let form = SmsWebhookForm::from_params(&params);
    if form.message_sid.trim().is_empty() || form.from.trim().is_empty() {
        return Err(reject(invalid("MessageSid and From are required"), &correlation_id, "sms"));
    }

    let payload = InboundMessagePayload {
        from: form.from,
        body: form.body,
        message_sid: form.message_sid.clone(),
        channel: "sms".to_owned(),
    };
    let payload = serde_json::to_value(payload)
        .map_err(|error| reject(invalid(&error.to_string()), &correlation_id, "sms"))?;

    let job_id = state
        .jobs
        .ensure_unique_job(
            IdempotencyKey::twilio(&form.message_sid),
            JobType::InboundMessageProcessing,
            payload,
            None,
        )
        .await
        .map_err(|error| {
            reject(ApplicationError::Persistence(error.to_string()), &correlation_id, "sms")
        })?;

    info!(
        event_name = "ingress.sms_accepted",
        correlation_id = %correlation_id,
        job_id = %job_id,
        "inbound sms accepted"
    );
    Ok((StatusCode::OK, Json(json!({ "job_id": job_id.0 }))))
}

pub async fn payment_webhook(
    State(state): State<IngressState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ErrorResponse> {
    let correlation_id = format!("req-{}", Uuid::new_v4());

    if let Some(secret) = &state.payment_signing_secret {
        let header = headers
            .get(PAYMENT_SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                reject(SignatureError::MalformedHeader.into(), &correlation_id, "payments")
            })?;
        verify_signature(
            secret.expose_secret().as_bytes(),
            header,
            &body,
            Utc::now(),
            state.signature_tolerance_secs,
        )
        .map_err(|error| reject(error.into(), &correlation_id, "payments"))?;
    }

    let event: PaymentEvent = serde_json::from_slice(&body)
        .map_err(|error| reject(invalid(&error.to_string()), &correlation_id, "payments"))?;
    if event.id.trim().is_empty() {
        return Err(reject(invalid("event id is required"), &correlation_id, "payments"));
    }

    let key = IdempotencyKey::stripe(&event.id);
    let payload = serde_json::to_value(event.into_payload())
        .map_err(|error| reject(invalid(&error.to_string()), &correlation_id, "payments"))?;
    let job_id = state
        .jobs
        .ensure_unique_job(key, JobType::PaymentEventProcessing, payload, None)
        .await
        .map_err(|error| {
            reject(ApplicationError::Persistence(error.to_string()), &correlation_id, "payments")
        })?;

    info!(
        event_name = "ingress.payment_accepted",
        correlation_id = %correlation_id,
        job_id = %job_id,
        "payment event accepted"
    );
    Ok((StatusCode::OK, Json(json!({ "job_id": job_id.0 }))))
}
