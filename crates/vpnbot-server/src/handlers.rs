//! HTTP Handlers

use std::str::FromStr;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use vpnbot_payments::{CreatePaymentRequest, Payment, PaymentError, PaymentStatus, Plan, Subscription};

use crate::state::AppState;

/// Signature header sent by CloudPayments
const SIGNATURE_HEADER: &str = "content-hmac";
const SIGNATURE_HEADER_ALT: &str = "x-content-hmac";

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub webhook_signatures_required: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub id: i64,
    pub user_chat_id: i64,
    pub subscription_id: i64,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method: String,
    pub provider_transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl PaymentResponse {
    fn new(payment: Payment, payment_url: Option<String>) -> Self {
        Self {
            id: payment.id,
            user_chat_id: payment.user_chat_id,
            subscription_id: payment.subscription_id,
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            payment_method: payment.payment_method,
            provider_transaction_id: payment.provider_transaction_id,
            payment_url,
            created_at: payment.created_at,
            confirmed_at: payment.confirmed_at,
        }
    }
}

impl From<Payment> for PaymentResponse {
    fn from(payment: Payment) -> Self {
        Self::new(payment, None)
    }
}

#[derive(Debug, Deserialize)]
pub struct ListPaymentsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub user_chat_id: i64,
    pub plan: String,
}

// ============================================================================
// Error mapping
// ============================================================================

fn status_for(err: &PaymentError) -> StatusCode {
    match err {
        PaymentError::Validation(_) | PaymentError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        PaymentError::Signature(_) => StatusCode::UNAUTHORIZED,
        PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
        PaymentError::Gateway(_) => StatusCode::BAD_GATEWAY,
        PaymentError::Storage(_) | PaymentError::Activation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PaymentError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn api_error(err: PaymentError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, "Request failed");
    } else {
        tracing::debug!(error = %err, "Request rejected");
    }

    (
        status,
        Json(ErrorResponse {
            error: err.user_message(),
            code: err.code().into(),
        }),
    )
}

/// Body decoding failures are reported before the service sees the request
fn invalid_request(rejection: JsonRejection) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: rejection.body_text(),
            code: "INVALID_REQUEST".into(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        webhook_signatures_required: !state.allow_unsigned_webhooks,
    })
}

/// Create a payment and its gateway charge
pub async fn create_payment(
    State(state): State<AppState>,
    payload: Result<Json<CreatePaymentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PaymentResponse>), ApiError> {
    let Json(request) = payload.map_err(invalid_request)?;

    let created = state.payments.create_payment(request).await.map_err(api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(PaymentResponse::new(created.payment, created.payment_url)),
    ))
}

pub async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let payment = state.payments.get_payment(id).await.map_err(api_error)?;
    Ok(Json(payment.into()))
}

/// List payments by status (`?status=pending`)
pub async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<ListPaymentsQuery>,
) -> Result<Json<Vec<PaymentResponse>>, ApiError> {
    let status = query
        .status
        .ok_or_else(|| PaymentError::Validation("status query parameter is required".into()))
        .and_then(|s| PaymentStatus::from_str(&s))
        .map_err(api_error)?;

    let payments = state.payments.list_payments_by_status(status).await.map_err(api_error)?;
    Ok(Json(payments.into_iter().map(Into::into).collect()))
}

pub async fn list_user_payments(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
) -> Result<Json<Vec<PaymentResponse>>, ApiError> {
    let payments = state.payments.list_user_payments(chat_id).await.map_err(api_error)?;
    Ok(Json(payments.into_iter().map(Into::into).collect()))
}

/// Operator retry of a failed subscription activation
pub async fn retry_activation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let payment = state.payments.retry_activation(id).await.map_err(api_error)?;
    Ok(Json(payment.into()))
}

pub async fn create_subscription(
    State(state): State<AppState>,
    payload: Result<Json<CreateSubscriptionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Subscription>), ApiError> {
    let Json(request) = payload.map_err(invalid_request)?;

    let plan = Plan::parse(&request.plan).map_err(api_error)?;
    let subscription = state
        .subscriptions
        .create(request.user_chat_id, plan)
        .await
        .map_err(api_error)?;

    tracing::info!(
        subscription_id = subscription.id,
        user_chat_id = subscription.user_chat_id,
        plan = plan.as_str(),
        "Created subscription"
    );

    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn list_user_subscriptions(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
) -> Result<Json<Vec<Subscription>>, ApiError> {
    let subscriptions = state.subscriptions.list_active(chat_id).await.map_err(api_error)?;
    Ok(Json(subscriptions))
}

/// CloudPayments webhook handler
///
/// The signature covers the raw body, so the body is taken as bytes and only
/// decoded after verification.
pub async fn cloudpayments_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let header = headers
        .get(SIGNATURE_HEADER)
        .or_else(|| headers.get(SIGNATURE_HEADER_ALT));

    match header {
        Some(value) => {
            // A header that is present but unreadable counts as a bad signature, never as absent
            let signature = value.to_str().map_err(|_| {
                tracing::warn!("Webhook signature header is not visible ASCII");
                api_error(PaymentError::Signature("unreadable signature header".into()))
            })?;
            if !state.payments.verify_webhook_signature(&body, signature) {
                tracing::warn!("Webhook signature mismatch");
                return Err(api_error(PaymentError::Signature("signature mismatch".into())));
            }
        }
        None if state.allow_unsigned_webhooks => {
            tracing::warn!("Accepting unsigned webhook (WEBHOOK_ALLOW_UNSIGNED is set)");
        }
        None => {
            tracing::warn!("Webhook without signature header");
            return Err(api_error(PaymentError::Signature("missing Content-HMAC header".into())));
        }
    }

    let outcome = state.payments.process_webhook(&body).await.map_err(api_error)?;
    tracing::debug!(
        payment_id = outcome.payment.id,
        status = %outcome.payment.status,
        applied = outcome.applied,
        activated = outcome.activated,
        "Webhook processed"
    );

    Ok(StatusCode::OK)
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Payments
        .route("/api/payments", post(create_payment).get(list_payments))
        .route("/api/payments/{id}", get(get_payment))
        .route("/api/payments/{id}/activate", post(retry_activation))
        .route("/api/users/{chat_id}/payments", get(list_user_payments))
        // Subscriptions
        .route("/api/subscriptions", post(create_subscription))
        .route("/api/users/{chat_id}/subscriptions", get(list_user_subscriptions))
        // Gateway
        .route("/webhook/cloudpayments", post(cloudpayments_webhook))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use vpnbot_payments::gateway::{self, ChargeOutcome, ChargeRequest, NormalizedWebhook, signature};
    use vpnbot_payments::{
        KeyIssuingActivator, MemoryPaymentStore, MemorySubscriptionStore, PaymentGateway, PaymentService,
        ServiceConfig,
    };

    const SECRET: &str = "api_secret";

    struct StubGateway;

    #[async_trait]
    impl PaymentGateway for StubGateway {
        async fn create_charge(&self, request: &ChargeRequest) -> vpnbot_payments::Result<ChargeOutcome> {
            if request.amount > Decimal::from(10_000) {
                return Err(PaymentError::Gateway("cloudpayments error: Amount too large".into()));
            }
            Ok(ChargeOutcome {
                transaction_id: format!("TX{}", request.invoice_id),
                payment_url: Some("https://pay.example/3ds".into()),
            })
        }

        fn parse_notification(&self, payload: &[u8]) -> vpnbot_payments::Result<NormalizedWebhook> {
            gateway::parse_notification(payload)
        }

        fn verify_signature(&self, payload: &[u8], sig: &str) -> bool {
            signature::verify(payload, sig, SECRET)
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    fn app(allow_unsigned_webhooks: bool) -> Router {
        let subscriptions = Arc::new(MemorySubscriptionStore::new());
        let payments = PaymentService::new(
            Arc::new(MemoryPaymentStore::new()),
            Arc::new(StubGateway),
            Arc::new(KeyIssuingActivator::new(subscriptions.clone())),
            ServiceConfig::default(),
        );

        router(AppState {
            payments: Arc::new(payments),
            subscriptions,
            allow_unsigned_webhooks,
        })
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn webhook(body: &[u8], signature: Option<&str>) -> Request<Body> {
        let mut request = Request::post("/webhook/cloudpayments");
        if let Some(signature) = signature {
            request = request.header("Content-HMAC", signature);
        }
        request.body(Body::from(body.to_vec())).unwrap()
    }

    fn notification(transaction_id: &str, status: &str) -> Vec<u8> {
        json!({
            "TransactionId": transaction_id,
            "Amount": 49.99,
            "Currency": "RUB",
            "Status": status,
        })
        .to_string()
        .into_bytes()
    }

    async fn create_payment(app: &Router, subscription_id: i64) -> Value {
        let (status, body) = send(
            app,
            post_json(
                "/api/payments",
                &json!({"user_chat_id": 42, "subscription_id": subscription_id, "amount": "49.99"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&app(false), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["webhook_signatures_required"], true);
    }

    #[tokio::test]
    async fn test_create_and_get_payment() {
        let app = app(false);
        let created = create_payment(&app, 1).await;

        assert_eq!(created["status"], "pending");
        assert_eq!(created["amount"], "49.99");
        assert_eq!(created["currency"], "RUB");
        assert_eq!(created["payment_method"], "cloudpayments");
        assert_eq!(created["provider_transaction_id"], "TX1");
        assert_eq!(created["payment_url"], "https://pay.example/3ds");

        let (status, fetched) = send(&app, get("/api/payments/1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["id"], created["id"]);
        assert!(fetched.get("payment_url").is_none());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_invalid_request() {
        let app = app(false);
        let request = Request::post("/api/payments")
            .header("content-type", "application/json")
            .body(Body::from("{\"user_chat_id\": \"abc\"}"))
            .unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_validation_and_gateway_errors() {
        let app = app(false);

        let (status, body) = send(
            &app,
            post_json("/api/payments", &json!({"user_chat_id": 42, "subscription_id": 1, "amount": "0"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");

        let (status, body) = send(
            &app,
            post_json("/api/payments", &json!({"user_chat_id": 42, "subscription_id": 1, "amount": "20000"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "GATEWAY_ERROR");

        let (_, failed) = send(&app, get("/api/payments?status=failed")).await;
        assert_eq!(failed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_payment_is_404() {
        let (status, body) = send(&app(false), get("/api/payments/99")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_list_requires_valid_status() {
        let app = app(false);
        let (status, _) = send(&app, get("/api/payments")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, get("/api/payments?status=refunded")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_signed_webhook_completes_payment_and_activates() {
        let app = app(false);

        let (status, subscription) = send(
            &app,
            post_json("/api/subscriptions", &json!({"user_chat_id": 42, "plan": "1month"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(subscription["is_active"], false);

        let created = create_payment(&app, subscription["id"].as_i64().unwrap()).await;
        let tx = created["provider_transaction_id"].as_str().unwrap().to_string();

        let body = notification(&tx, "Completed");
        let sig = signature::sign(&body, SECRET).unwrap();
        let (status, response) = send(&app, webhook(&body, Some(&sig))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response, Value::Null);

        let (_, payments) = send(&app, get("/api/users/42/payments")).await;
        assert_eq!(payments[0]["status"], "completed");
        assert!(payments[0]["confirmed_at"].is_string());

        let (_, active) = send(&app, get("/api/users/42/subscriptions")).await;
        assert_eq!(active.as_array().unwrap().len(), 1);
        assert!(active[0]["activation_key"].is_string());
    }

    #[tokio::test]
    async fn test_alternate_signature_header() {
        let app = app(false);
        create_payment(&app, 1).await;

        let body = notification("TX1", "Declined");
        let sig = signature::sign(&body, SECRET).unwrap();
        let request = Request::post("/webhook/cloudpayments")
            .header("X-Content-HMAC", sig)
            .body(Body::from(body))
            .unwrap();

        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_webhook_signature_is_mandatory() {
        let app = app(false);
        create_payment(&app, 1).await;
        let body = notification("TX1", "Completed");

        let (status, response) = send(&app, webhook(&body, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(response["code"], "INVALID_SIGNATURE");

        let forged = signature::sign(&body, "wrong_secret").unwrap();
        let (status, _) = send(&app, webhook(&body, Some(&forged))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (_, payment) = send(&app, get("/api/payments/1")).await;
        assert_eq!(payment["status"], "pending");
    }

    #[tokio::test]
    async fn test_unsigned_webhooks_when_allowed() {
        let app = app(true);
        create_payment(&app, 1).await;
        let body = notification("TX1", "Cancelled");

        let (status, _) = send(&app, webhook(&body, None)).await;
        assert_eq!(status, StatusCode::OK);

        // A present but wrong signature is still rejected
        let (status, _) = send(&app, webhook(&body, Some("bm90IGEgc2lnbmF0dXJl"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unreadable_signature_rejected_when_unsigned_allowed() {
        let app = app(true);
        create_payment(&app, 1).await;

        let request = Request::post("/webhook/cloudpayments")
            .header("Content-HMAC", HeaderValue::from_bytes(b"forged\xff").unwrap())
            .body(Body::from(notification("TX1", "Cancelled")))
            .unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "INVALID_SIGNATURE");

        let (_, payment) = send(&app, get("/api/payments/1")).await;
        assert_eq!(payment["status"], "pending");
    }

    #[tokio::test]
    async fn test_webhook_errors() {
        let app = app(true);

        let (status, body) = send(&app, webhook(b"{not json", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MALFORMED_PAYLOAD");

        let (status, body) = send(&app, webhook(&notification("TX999", "Completed"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_activation_failure_then_retry() {
        let app = app(true);
        // Subscription 7 does not exist yet, so activation fails
        create_payment(&app, 7).await;

        let (status, body) = send(&app, webhook(&notification("TX1", "Completed"), None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "ACTIVATION_ERROR");

        let (_, payment) = send(&app, get("/api/payments/1")).await;
        assert_eq!(payment["status"], "completed");

        let (status, body) = send(&app, post_json("/api/payments/1/activate", &json!({}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "ACTIVATION_ERROR");
    }

    #[tokio::test]
    async fn test_retry_activation_of_pending_payment() {
        let app = app(false);
        create_payment(&app, 1).await;

        let (status, body) = send(&app, post_json("/api/payments/1/activate", &json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_plan() {
        let (status, body) = send(
            &app(false),
            post_json("/api/subscriptions", &json!({"user_chat_id": 42, "plan": "12months"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }
}
