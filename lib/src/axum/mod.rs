//! Public http routes.

pub mod donation;
pub mod error;
pub mod extract;
pub mod feedback;
pub mod newsletter;
pub mod payments;
pub mod pixel;

pub use extract::user::MaybeUser;

use axum::Extension;

use crate::{App, Config, Database, ErrorKind, Result};

pub type Router = axum::Router;

pub type AppExt = Extension<App>;

/// Registers the route groups on the provided router.
///
/// # Configurable routes
///
/// Groups (`newsletter`, `donation`, `payments`, `feedback`, `pixel`) listed in
/// `routes.disable` are left out unless also listed in `routes.enable`.
pub fn router(mut router: Router, config: &Config) -> Router {
    router = conditional_merge("newsletter", router, newsletter::router(), config);
    router = conditional_merge("donation", router, donation::router(), config);
    router = conditional_merge("payments", router, payments::router(), config);
    router = conditional_merge("feedback", router, feedback::router(), config);
    conditional_merge("pixel", router, pixel::router(), config)
}

fn conditional_merge(route: &str, routera: Router, routerb: Router, config: &Config) -> Router {
    if config.routes.enable.iter().any(|r| r == route) || !config.routes.disable.iter().any(|r| r == route) {
        routera.merge(routerb)
    } else {
        routera
    }
}

/// Router with every enabled group and the application attached.
pub fn app_router(app: App) -> Router {
    router(Router::new(), &app.config.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(Extension(app))
}

/// Opens the configured database, prepares initial state and serves the
/// routes until the process is stopped.
pub async fn start(config: Config) -> Result<()> {
    let db = Database::open(&config.db.path)?;
    start_with(db, config).await
}

pub async fn start_with(db: Database, config: Config) -> Result<()> {
    crate::init::initialize(&config, &db)?;

    // Synthetic state for trying out the routes locally.
    if config.dev.enabled && config.dev.mock {
        match crate::mock::generate(&config, &db) {
            Err(e) if matches!(e.kind, ErrorKind::Precondition(_)) => {
                tracing::debug!("keeping existing mock data")
            }
            other => other?,
        }
    }

    let addr = config.address;
    let app = App::new(db, config)?;
    let router = app_router(app);

    tracing::info!("starting server at {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
