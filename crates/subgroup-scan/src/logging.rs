//! Opt-in `tracing` subscriber for binaries and tests.
//!
//! The library itself only emits events. `SUBGROUP_SCAN_LOG` takes an
//! `EnvFilter` directive (e.g. `subgroup_scan=debug`) and
//! `SUBGROUP_SCAN_LOG_FORMAT` selects `flat` (default) or `json` output.

use crate::error::{Error, Result};
use std::env::{self, VarError};
use std::io;
use tracing_subscriber::layer::SubscriberExt;

pub const LOG_ENV: &str = "SUBGROUP_SCAN_LOG";
pub const LOG_FORMAT_ENV: &str = "SUBGROUP_SCAN_LOG_FORMAT";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Flat,
    Json,
}

impl OutputFormat {
    pub fn from_env() -> Result<Self> {
        match env::var(LOG_FORMAT_ENV).as_deref() {
            Ok("flat") | Err(VarError::NotPresent) => Ok(Self::Flat),
            Ok("json") => Ok(Self::Json),
            Ok(value) => Err(Error::InvalidConfig(format!(
                "invalid {LOG_FORMAT_ENV} value '{value}': expected one of flat or json"
            ))),
            Err(VarError::NotUnicode(value)) => Err(Error::InvalidConfig(format!(
                "invalid {LOG_FORMAT_ENV} value '{}': expected one of flat or json",
                value.to_string_lossy()
            ))),
        }
    }
}

/// Installs the global subscriber. Does nothing if one is already installed,
/// so every test may call it.
pub fn init() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_env(LOG_ENV);
    let subscriber = tracing_subscriber::Registry::default().with(filter);

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = match OutputFormat::from_env()? {
        OutputFormat::Flat => Box::new(
            subscriber.with(tracing_subscriber::fmt::layer().with_writer(io::stderr)),
        ),
        OutputFormat::Json => Box::new(
            subscriber.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(io::stderr),
            ),
        ),
    };
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::trace!("global subscriber already installed");
    }
    Ok(())
}
