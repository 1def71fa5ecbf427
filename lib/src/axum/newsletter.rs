use std::str::FromStr;

use askama::Template;
use axum::extract::{Path, Query};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Extension, Form, Json};
use strum::IntoEnumIterator;

use crate::db::Id;
use crate::mailing::archive::{find_archived, render_archive_list, render_archive_page};
use crate::newsletter::subscribe::{confirm_subscriber, subscribe as subscribe_email, unsubscribe_by_code, SubscribeOptions};
use crate::newsletter::{get_newsletter, submit_feedback, Subscriber, UnsubscribeReason};
use crate::Result;

use super::{AppExt, MaybeUser, Router};

pub fn router() -> Router {
    Router::new()
        .route("/newsletter/:slug/subscribe", post(subscribe))
        .route("/newsletter/confirm/:id/:code/", get(confirm))
        .route("/newsletter/unsubscribe/:id/:code/", get(unsubscribe).post(unsubscribe))
        .route("/newsletter/unsubscribe/feedback", post(feedback))
        .route("/newsletter/:slug/archive/", get(archive))
        .route("/newsletter/:slug/archive/:year/:month/:day/:id/", get(archived))
}

#[derive(Template)]
#[template(path = "page/message.html")]
pub struct MessagePage<'a> {
    pub site_name: &'a str,
    pub title: &'a str,
    pub message: &'a str,
}

#[derive(Template)]
#[template(path = "page/unsubscribed.html")]
struct UnsubscribedPage<'a> {
    site_name: &'a str,
    subscriber: Option<Id>,
    code: &'a str,
    reasons: Vec<(String, &'static str)>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscribeForm {
    pub email: String,
    pub name: String,
    pub reference: String,
    pub keyword: String,
}

pub async fn subscribe(
    Extension(app): AppExt,
    user: MaybeUser,
    Path(slug): Path<String>,
    Form(form): Form<SubscribeForm>,
) -> Result<impl IntoResponse> {
    let newsletter = get_newsletter(&app.db, &slug)?;
    let options = SubscribeOptions {
        user: user.as_ref().map(|u| u.id),
        name: form.name,
        reference: form.reference,
        keyword: form.keyword,
        ..Default::default()
    };
    let (result, _) = subscribe_email(&app, &newsletter, &form.email, options).await?;
    Ok(Json(serde_json::json!({ "result": result.to_string() })))
}

/// Activation link. Unknown subscribers and wrong codes are not found.
pub async fn confirm(Extension(app): AppExt, Path((id, code)): Path<(Id, String)>) -> Result<impl IntoResponse> {
    confirm_subscriber(&app, id, &code).await?;
    let page = MessagePage {
        site_name: &app.config.site.name,
        title: "Anmeldung bestätigt",
        message: "Vielen Dank, Ihre Anmeldung zum Newsletter ist bestätigt.",
    };
    Ok(Html(page.render()?))
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct UnsubscribeQuery {
    pub reference: String,
}

/// Unsubscribe link. Answers with the same page for unknown links, the
/// feedback form is only offered after a real unsubscribe.
pub async fn unsubscribe(
    Extension(app): AppExt,
    Path((id, code)): Path<(Id, String)>,
    Query(query): Query<UnsubscribeQuery>,
) -> Result<impl IntoResponse> {
    let subscriber = unsubscribe_by_code(&app.db, id, &code, &query.reference)?;
    let page = UnsubscribedPage {
        site_name: &app.config.site.name,
        subscriber: subscriber.as_ref().map(|s| s.id),
        code: &code,
        reasons: UnsubscribeReason::iter().map(|r| (r.to_string(), r.label())).collect(),
    };
    Ok(Html(page.render()?))
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FeedbackForm {
    pub subscriber: Id,
    pub code: String,
    pub reason: String,
    pub comment: String,
}

pub async fn feedback(Extension(app): AppExt, Form(form): Form<FeedbackForm>) -> Result<impl IntoResponse> {
    let subscriber = app
        .db
        .get_opt::<Subscriber>(form.subscriber)?
        .filter(|s| !form.code.is_empty() && s.activation_code == form.code);
    if let Some(subscriber) = subscriber {
        let reason = UnsubscribeReason::from_str(&form.reason).unwrap_or_default();
        submit_feedback(&app.db, &subscriber, reason, &form.comment)?;
    }
    let page = MessagePage {
        site_name: &app.config.site.name,
        title: "Danke",
        message: "Vielen Dank für Ihre Rückmeldung.",
    };
    Ok(Html(page.render()?))
}

pub async fn archive(Extension(app): AppExt, Path(slug): Path<String>) -> Result<impl IntoResponse> {
    Ok(Html(render_archive_list(&app.db, &app.config, &slug)?))
}

pub async fn archived(
    Extension(app): AppExt,
    Path((slug, year, month, day, id)): Path<(String, i32, u32, u32, Id)>,
) -> Result<impl IntoResponse> {
    let (newsletter, mailing) = find_archived(&app.db, &slug, year, month, day, id)?;
    Ok(Html(render_archive_page(&app.db, &app.config, &newsletter, &mailing)?))
}
