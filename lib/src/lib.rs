//! Donation, newsletter and mailing backend.
//!
//! The crate keeps donors, donations and recurring donation series, runs
//! newsletter subscriptions with tag-based segmentation, renders and sends
//! transactional and bulk mail with open tracking, and produces annual
//! donation receipts.
//!
//! Most operations take an [`App`], which bundles the database, the
//! configuration and the outbound collaborators (mail transport, pdf
//! toolchain). Pure data operations only take a [`Database`].

#[macro_use]
extern crate serde_derive;

pub mod app;
pub mod config;
pub mod db;
pub mod donation;
pub mod email;
pub mod error;
pub mod events;
pub mod init;
pub mod mailing;
pub mod mock;
pub mod money;
pub mod newsletter;
pub mod notify;
pub mod payment;
pub mod receipt;
pub mod tasks;
pub mod tracing;
pub mod user;
pub mod util;

#[cfg(feature = "axum")]
pub mod axum;

pub use app::App;
pub use config::Config;
pub use db::{Database, Id};
pub use error::{Error, ErrorKind, Result};
pub use mailing::Context;
pub use user::User;
