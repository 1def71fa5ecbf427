//! Domain events and their handlers.
//!
//! State transitions that have side effects elsewhere (welcome mail, admin
//! notification, subscriber cleanup after account changes) raise an
//! [`Event`] at the call site. [`dispatch`] runs the handlers in order and
//! returns once all of them are done. A failing handler is logged and does
//! not stop the others.

use crate::app::App;
use crate::db::Id;
use crate::newsletter::listeners;
use crate::{notify, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A subscriber got confirmed.
    Subscribed { subscriber: Id },
    /// The account's email address changed.
    UserEmailChanged { user: Id },
    /// Account `old` was merged into account `new`.
    UserMerged { old: Id, new: Id },
    /// The account was closed.
    UserCanceled { user: Id },
    /// Mail to the address hard bounced.
    EmailBounced { email: String, user: Option<Id> },
    /// A donation was received and the donor notified.
    DonationReceived { donation: Id },
    /// The recurrence detector found a new, ongoing series.
    RecurrenceCreated { recurrence: Id },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Subscribed { .. } => "subscribed",
            Event::UserEmailChanged { .. } => "user_email_changed",
            Event::UserMerged { .. } => "user_merged",
            Event::UserCanceled { .. } => "user_canceled",
            Event::EmailBounced { .. } => "email_bounced",
            Event::DonationReceived { .. } => "donation_received",
            Event::RecurrenceCreated { .. } => "recurrence_created",
        }
    }
}

pub async fn dispatch(app: &App, event: Event) {
    tracing::debug!(event = event.name(), "dispatching {:?}", event);
    let result: Result<()> = match &event {
        Event::Subscribed { subscriber } => listeners::send_welcome(app, *subscriber).await,
        Event::UserEmailChanged { user } => listeners::user_email_changed(&app.db, *user),
        Event::UserMerged { old, new } => listeners::merge_user(&app.db, *old, *new),
        Event::UserCanceled { user } => listeners::cancel_user(&app.db, *user),
        Event::EmailBounced { email, user } => listeners::email_bounced(&app.db, email, *user),
        Event::DonationReceived { donation } => notify::donation_received(app, *donation).await,
        Event::RecurrenceCreated { recurrence } => {
            notify::recurrence_created(app, *recurrence).await
        }
    };
    if let Err(e) = result {
        tracing::warn!(event = event.name(), "event handler failed: {e}");
    }
}

/// Dispatches several events in order.
pub async fn dispatch_all(app: &App, events: Vec<Event>) {
    for event in events {
        dispatch(app, event).await;
    }
}
