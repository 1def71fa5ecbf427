use askama::Template;
use axum::extract::{Path, Query};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Extension, Form, Json};
use http::StatusCode;
use uuid::Uuid;

use crate::donation::donor::{confirm_donor_email, ConfirmFlags};
use crate::donation::form::{submit_donation, validate, DonationForm};
use crate::donation::Donor;
use crate::{Error, Result};

use super::newsletter::MessagePage;
use super::{AppExt, MaybeUser, Router};

pub fn router() -> Router {
    Router::new()
        .route("/donation/", post(donate))
        .route("/donation/donor/:uuid/confirm/", get(confirm))
}

/// Field errors come back as json with status 400, a valid form redirects
/// to the payment page.
pub async fn donate(
    Extension(app): AppExt,
    user: MaybeUser,
    Form(form): Form<DonationForm>,
) -> Result<Response> {
    if let Err(errors) = validate(&form) {
        return Ok((StatusCode::BAD_REQUEST, Json(errors)).into_response());
    }
    let submission = submit_donation(&app, &form, user.as_ref()).await?;
    Ok(Redirect::to(&submission.payment_url).into_response())
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfirmQuery {
    pub newsletter: bool,
}

pub async fn confirm(
    Extension(app): AppExt,
    user: MaybeUser,
    Path(uuid): Path<Uuid>,
    Query(query): Query<ConfirmQuery>,
) -> Result<impl IntoResponse> {
    let donor = app
        .db
        .find::<Donor, _>(|d| d.uuid == uuid)?
        .ok_or_else(|| Error::not_found(format!("donor {uuid}")))?;
    let flags = ConfirmFlags {
        newsletter: query.newsletter,
        staff: user.is_staff(),
    };
    confirm_donor_email(&app, donor.id, flags).await?;
    let page = MessagePage {
        site_name: &app.config.site.name,
        title: "E-Mail-Adresse bestätigt",
        message: "Vielen Dank, Ihre E-Mail-Adresse ist bestätigt.",
    };
    Ok(Html(page.render()?))
}
