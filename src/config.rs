//! Service configuration.
//!
//! Read from the process environment (after `.env` is loaded) through a
//! lookup function, so parsing can be exercised without touching real env vars.

use crate::sheet_parser::UploadSettings;
use anyhow::{Context, Result};
use std::time::Duration;

const DEFAULT_BIND: &str = "0.0.0.0:3000";
const DEFAULT_TEMPLATE_IRI_BASE: &str = "https://repo.metadatacenter.org/templates/";
const DEFAULT_DEBOUNCE_MS: u64 = 500;
const DEFAULT_MAX_UPLOAD_MB: usize = 100;
const DEFAULT_SESSION_IDLE_MINUTES: u64 = 120;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Endpoint of the remote validation service.
    pub validator_url: String,
    /// Optional URL reachability endpoint. Without it URLs are checked for syntax only.
    pub url_check_url: Option<String>,
    pub upload: UploadSettings,
    pub field_check_debounce: Duration,
    pub max_upload_bytes: usize,
    /// Sessions untouched for this long are discarded.
    pub session_idle_ttl: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let validator_url = get("VALIDATOR_URL").context("VALIDATOR_URL environment variable not set")?;

        let debounce_ms = match get("FIELD_CHECK_DEBOUNCE_MS") {
            Some(v) => v
                .trim()
                .parse::<u64>()
                .with_context(|| format!("FIELD_CHECK_DEBOUNCE_MS is not a number: {}", v))?,
            None => DEFAULT_DEBOUNCE_MS,
        };
        let max_upload_mb = match get("MAX_UPLOAD_MB") {
            Some(v) => v
                .trim()
                .parse::<usize>()
                .with_context(|| format!("MAX_UPLOAD_MB is not a number: {}", v))?,
            None => DEFAULT_MAX_UPLOAD_MB,
        };
        let max_upload_bytes = max_upload_mb
            .checked_mul(1024 * 1024)
            .with_context(|| format!("MAX_UPLOAD_MB is too large: {}", max_upload_mb))?;
        let idle_minutes = match get("SESSION_IDLE_MINUTES") {
            Some(v) => v
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|m| *m > 0)
                .with_context(|| format!("SESSION_IDLE_MINUTES must be a positive number: {}", v))?,
            None => DEFAULT_SESSION_IDLE_MINUTES,
        };

        Ok(Self {
            bind_addr: get_or("SHEET_REPAIR_BIND", DEFAULT_BIND),
            validator_url,
            url_check_url: get("URL_CHECK_URL"),
            upload: UploadSettings {
                main_sheet: get_or("MAIN_SHEET", "MAIN"),
                metadata_sheet: get_or("METADATA_SHEET", ".metadata"),
                template_iri_field: get_or("TEMPLATE_IRI_FIELD", "metadata_schema_iri"),
                schema_id_field: get_or("SCHEMA_ID_FIELD", "metadata_schema_id"),
                template_iri_base: get_or("TEMPLATE_IRI_BASE", DEFAULT_TEMPLATE_IRI_BASE),
            },
            field_check_debounce: Duration::from_millis(debounce_ms),
            max_upload_bytes,
            session_idle_ttl: Duration::from_secs(idle_minutes.saturating_mul(60)),
        })
    }
}
