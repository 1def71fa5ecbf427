//! Delivery feedback and account changes reported by the mail relay and
//! the account directory. Bodies are signed like the payment webhooks.

use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Extension, Json};

use crate::db::Id;
use crate::events::{dispatch, Event};
use crate::newsletter::subscribe::handle_unsubscribe_mail;
use crate::Result;

use super::payments::Signed;
use super::{AppExt, Router};

pub fn router() -> Router {
    Router::new()
        .route("/feedback/bounce", post(bounce))
        .route("/feedback/unsubscribe-mail", post(unsubscribe_mail))
        .route("/feedback/account", post(account))
}

#[derive(Clone, Debug, Deserialize)]
pub struct BounceNotice {
    pub email: String,
    #[serde(default)]
    pub user: Option<Id>,
}

/// Hard bounce for an address.
pub async fn bounce(Extension(app): AppExt, Signed(notice): Signed<BounceNotice>) -> impl IntoResponse {
    dispatch(
        &app,
        Event::EmailBounced {
            email: notice.email,
            user: notice.user,
        },
    )
    .await;
    Json(serde_json::json!({ "ok": true }))
}

#[derive(Clone, Debug, Deserialize)]
pub struct InboundMail {
    pub sender: String,
    pub subject: String,
}

/// Mail that reached the unsubscribe mailbox.
pub async fn unsubscribe_mail(
    Extension(app): AppExt,
    Signed(mail): Signed<InboundMail>,
) -> Result<impl IntoResponse> {
    let subscriber = handle_unsubscribe_mail(&app.db, &mail.sender, &mail.subject)?;
    Ok(Json(serde_json::json!({
        "subscriber": subscriber.map(|s| s.id),
    })))
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AccountEvent {
    UserEmailChanged { user: Id },
    UserMerged { old: Id, new: Id },
    UserCanceled { user: Id },
}

impl From<AccountEvent> for Event {
    fn from(event: AccountEvent) -> Self {
        match event {
            AccountEvent::UserEmailChanged { user } => Event::UserEmailChanged { user },
            AccountEvent::UserMerged { old, new } => Event::UserMerged { old, new },
            AccountEvent::UserCanceled { user } => Event::UserCanceled { user },
        }
    }
}

pub async fn account(Extension(app): AppExt, Signed(event): Signed<AccountEvent>) -> impl IntoResponse {
    dispatch(&app, event.into()).await;
    Json(serde_json::json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use chrono::Utc;
    use http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::axum::app_router;
    use crate::axum::payments::SIGNATURE_HEADER;
    use crate::newsletter::{Newsletter, Subscriber, METHOD_BOUNCED};
    use crate::payment::integrator::sign_webhook;
    use crate::{App, Config};

    fn signed(app: &App, uri: &str, body: &str) -> Request<Body> {
        let signature = sign_webhook(&app.config.payments.webhook_secret, body.as_bytes()).unwrap();
        Request::post(uri)
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn setup() -> (App, Subscriber) {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        let newsletter = Newsletter::new(&app.db, "fragdenstaat", "FragDenStaat").unwrap();
        app.db.set(&newsletter).unwrap();
        let subscriber = Subscriber {
            email: Some("jane@example.org".to_string()),
            subscribed: Some(Utc::now()),
            ..Subscriber::new(&app.db, newsletter.id).unwrap()
        };
        app.db.set(&subscriber).unwrap();
        (app, subscriber)
    }

    #[tokio::test]
    async fn bounce_unsubscribes_address() {
        let (app, subscriber) = setup();
        let response = app_router(app.clone())
            .oneshot(signed(&app, "/feedback/bounce", r#"{"email": "Jane@example.org"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stored: Subscriber = app.db.get(subscriber.id).unwrap();
        assert!(stored.is_unsubscribed());
        assert_eq!(stored.unsubscribe_method, METHOD_BOUNCED);
    }

    #[tokio::test]
    async fn unsigned_bounce_is_forbidden() {
        let (app, subscriber) = setup();
        let response = app_router(app.clone())
            .oneshot(
                Request::post("/feedback/bounce")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"email": "jane@example.org"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let stored: Subscriber = app.db.get(subscriber.id).unwrap();
        assert!(!stored.is_unsubscribed());
    }

    #[tokio::test]
    async fn unsubscribe_mail_from_subscriber() {
        let (app, subscriber) = setup();
        let body = format!(
            r#"{{"sender": "jane@example.org", "subject": "unsubscribe-newsletter-{}-mailing-1"}}"#,
            subscriber.id
        );
        let response = app_router(app.clone())
            .oneshot(signed(&app, "/feedback/unsubscribe-mail", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stored: Subscriber = app.db.get(subscriber.id).unwrap();
        assert!(stored.is_unsubscribed());
        assert_eq!(stored.unsubscribe_reference, "mailing-1");
    }

    #[tokio::test]
    async fn account_cancel_unsubscribes_user() {
        let (app, _) = setup();
        let newsletter = Newsletter::new(&app.db, "other", "Other").unwrap();
        app.db.set(&newsletter).unwrap();
        let subscriber = Subscriber {
            user: Some(7),
            subscribed: Some(Utc::now()),
            ..Subscriber::new(&app.db, newsletter.id).unwrap()
        };
        app.db.set(&subscriber).unwrap();

        let response = app_router(app.clone())
            .oneshot(signed(&app, "/feedback/account", r#"{"event": "user_canceled", "user": 7}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stored: Subscriber = app.db.get(subscriber.id).unwrap();
        assert!(stored.is_unsubscribed());
    }
}
