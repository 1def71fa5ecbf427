use axum::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::FromRequest;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use http::{Request, StatusCode};
use serde::de::DeserializeOwned;

use crate::app::App;
use crate::payment::integrator::{
    apply_update, status_changed, subscription_canceled, verify_webhook, PaymentUpdate,
    SubscriptionCancellation,
};
use crate::Result;

use super::{AppExt, Router};

pub const SIGNATURE_HEADER: &str = "x-signature";

pub fn router() -> Router {
    Router::new()
        .route("/payments/status", post(status))
        .route("/payments/subscription/canceled", post(canceled))
}

/// Json body authenticated with the HMAC-SHA256 signature header.
pub struct Signed<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for Signed<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = Response;

    async fn from_request(req: Request<Body>, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let Some(signature) = req
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|s| s.to_str().ok())
            .map(|s| s.to_string())
        else {
            return Err(StatusCode::FORBIDDEN.into_response());
        };
        let Some(app) = req.extensions().get::<App>().cloned() else {
            tracing::error!("app extension unavailable");
            return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
        };

        let body = Bytes::from_request(req, state)
            .await
            .map_err(IntoResponse::into_response)?;
        if !verify_webhook(&app.config.payments.webhook_secret, &body, &signature) {
            tracing::warn!("rejected webhook with bad signature");
            return Err(StatusCode::FORBIDDEN.into_response());
        }
        serde_json::from_slice(&body)
            .map(Signed)
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())
    }
}

pub async fn status(Extension(app): AppExt, Signed(update): Signed<PaymentUpdate>) -> Result<impl IntoResponse> {
    let payment = apply_update(&app.db, &update)?;
    let donation = status_changed(&app, payment.id).await?;
    Ok(Json(serde_json::json!({
        "payment": payment.id,
        "status": payment.status,
        "donation": donation.id,
    })))
}

pub async fn canceled(
    Extension(app): AppExt,
    Signed(cancellation): Signed<SubscriptionCancellation>,
) -> Result<impl IntoResponse> {
    let recurrence = subscription_canceled(&app, &cancellation).await?;
    Ok(Json(serde_json::json!({
        "recurrence": recurrence.map(|r| r.id),
    })))
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    use super::*;
    use crate::axum::app_router;
    use crate::donation::{find_donation_by_payment, Donation};
    use crate::payment::integrator::sign_webhook;
    use crate::payment::{Order, Payment, PaymentMethod, PaymentStatus};
    use crate::Config;

    fn request(secret: &str, body: &str) -> Request<Body> {
        let signature = sign_webhook(secret, body.as_bytes()).unwrap();
        Request::post("/payments/status")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn payment(app: &App) -> Payment {
        let order = Order {
            user_email: "jane@example.org".to_string(),
            last_name: "Doe".to_string(),
            total_gross: dec!(10),
            ..Order::new(&app.db).unwrap()
        };
        app.db.set(&order).unwrap();
        let payment = Payment::new(&app.db, &order, PaymentMethod::Creditcard).unwrap();
        app.db.set(&payment).unwrap();
        payment
    }

    #[tokio::test]
    async fn bad_signature_is_forbidden() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        let payment = payment(&app);
        let body = format!(r#"{{"id": {}, "status": "confirmed"}}"#, payment.id);
        let response = app_router(app.clone())
            .oneshot(request("wrong-secret", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let stored: Payment = app.db.get(payment.id).unwrap();
        assert_eq!(stored.status, PaymentStatus::Input);
    }

    #[tokio::test]
    async fn confirmed_update_completes_donation() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        let payment = payment(&app);
        let body = format!(
            r#"{{"id": {}, "status": "confirmed", "received_amount": "10", "captured_amount": "10"}}"#,
            payment.id
        );
        let secret = app.config.payments.webhook_secret.clone();
        let response = app_router(app.clone())
            .oneshot(request(&secret, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let donation: Donation = find_donation_by_payment(&app.db, payment.id).unwrap().unwrap();
        assert!(donation.completed);
    }
}
