use std::str::FromStr;

use anyhow::{Context, Result};
use clap::ArgMatches;

use donorbase::tracing::Level;
use donorbase::{config, App, Config, Database, Id};

/// Loads the config from `--config` if given, otherwise from the default
/// location, falling back to defaults when there is no file.
pub fn load_config(matches: &ArgMatches) -> Result<Config> {
    let mut config: Config = match matches.get_one::<String>("config") {
        Some(path) => config::load_from(path).with_context(|| format!("failed loading config {path}"))?,
        None => config::load().unwrap_or_default(),
    };
    if let Some(level) = matches.get_one::<String>("verbosity") {
        config.tracing.level = Level::from_str(level)?;
        config.tracing.enabled = true;
    }
    Ok(config)
}

pub fn open_db(config: &Config) -> Result<Database> {
    Database::open(&config.db.path).with_context(|| format!("failed opening database at {}", config.db.path))
}

pub fn open_app(config: Config) -> Result<App> {
    let db = open_db(&config)?;
    donorbase::init::initialize(&config, &db)?;
    Ok(App::new(db, config)?)
}

/// Collects the values of a repeated id argument.
pub fn ids(matches: &ArgMatches, name: &str) -> Vec<Id> {
    matches
        .get_many::<Id>(name)
        .map(|ids| ids.copied().collect())
        .unwrap_or_default()
}
