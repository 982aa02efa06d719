//! ---
//! ats_section: "01-core-functionality"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Tracing subscriber setup for the daemon."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

pub const LOG_ENV: &str = "ATS_LOG";

/// Relay transitions at info, HTTP client chatter only when it goes wrong.
pub const DEFAULT_DIRECTIVE: &str = "info,hyper=warn,hyper_util=warn,reqwest=warn,h2=warn";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Where the active filter directive came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    AtsLog,
    RustLog,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFilter {
    pub directive: String,
    pub source: FilterSource,
    /// Set when a directive was present but unparsable.
    pub rejected: Option<String>,
}

/// Pick the filter directive from `ATS_LOG`, then `RUST_LOG`, then the default.
///
/// A blank variable counts as unset. An unparsable `ATS_LOG` falls back to the
/// default rather than to `RUST_LOG` so a typo never silently widens the output.
pub fn resolve_filter(ats_log: Option<&str>, rust_log: Option<&str>) -> ResolvedFilter {
    fn non_blank(value: Option<&str>) -> Option<&str> {
        value.map(str::trim).filter(|v| !v.is_empty())
    }

    if let Some(directive) = non_blank(ats_log) {
        return match EnvFilter::try_new(directive) {
            Ok(_) => ResolvedFilter {
                directive: directive.to_owned(),
                source: FilterSource::AtsLog,
                rejected: None,
            },
            Err(err) => ResolvedFilter {
                directive: DEFAULT_DIRECTIVE.to_owned(),
                source: FilterSource::Default,
                rejected: Some(format!("{}={} ({})", LOG_ENV, directive, err)),
            },
        };
    }
    if let Some(directive) = non_blank(rust_log) {
        if EnvFilter::try_new(directive).is_ok() {
            return ResolvedFilter {
                directive: directive.to_owned(),
                source: FilterSource::RustLog,
                rejected: None,
            };
        }
        return ResolvedFilter {
            directive: DEFAULT_DIRECTIVE.to_owned(),
            source: FilterSource::Default,
            rejected: Some(format!("RUST_LOG={}", directive)),
        };
    }
    ResolvedFilter {
        directive: DEFAULT_DIRECTIVE.to_owned(),
        source: FilterSource::Default,
        rejected: None,
    }
}

/// File name handed to the daily appender, which appends the date itself.
pub fn log_file_name(service_name: &str, config: &LoggingConfig) -> String {
    let prefix = config
        .file_prefix
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(service_name);
    format!("{}.log", prefix)
}

/// Install the subscriber for the daemon.
///
/// Stdout carries JSON or pretty output. Unless `logging.file_enabled` is off, a
/// daily JSON file with span context is kept so a transfer can be reconstructed
/// after an incident.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let resolved = resolve_filter(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    let filter = EnvFilter::try_new(&resolved.directive)
        .with_context(|| format!("invalid log directive {}", resolved.directive))?;

    let file_layer = if config.file_enabled {
        std::fs::create_dir_all(&config.directory).with_context(|| {
            format!(
                "unable to create log directory {}",
                config.directory.display()
            )
        })?;
        let appender = daily(&config.directory, log_file_name(service_name, config));
        let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(file_guard);
        Some(
            fmt::layer()
                .with_target(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_writer(file_writer)
                .boxed(),
        )
    } else {
        None
    };

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = STDOUT_GUARD.set(stdout_guard);

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    if let Some(rejected) = &resolved.rejected {
        warn!(rejected = %rejected, fallback = DEFAULT_DIRECTIVE, "ignoring invalid log directive");
    }
    info!(
        service = %service_name,
        filter = %resolved.directive,
        filter_source = ?resolved.source,
        log_file = ?config.file_enabled.then(|| log_file_name(service_name, config)),
        log_dir = %config.directory.display(),
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ats_log_wins_over_rust_log() {
        let resolved = resolve_filter(Some("ats_core=debug"), Some("trace"));
        assert_eq!(resolved.directive, "ats_core=debug");
        assert_eq!(resolved.source, FilterSource::AtsLog);
        assert!(resolved.rejected.is_none());
    }

    #[test]
    fn blank_ats_log_defers_to_rust_log() {
        let resolved = resolve_filter(Some("  "), Some("warn"));
        assert_eq!(resolved.directive, "warn");
        assert_eq!(resolved.source, FilterSource::RustLog);
    }

    #[test]
    fn invalid_ats_log_falls_back_to_the_default() {
        let resolved = resolve_filter(Some("ats_core=loud"), Some("trace"));
        assert_eq!(resolved.directive, DEFAULT_DIRECTIVE);
        assert_eq!(resolved.source, FilterSource::Default);
        assert!(resolved.rejected.unwrap().starts_with("ATS_LOG=ats_core=loud"));
    }

    #[test]
    fn default_directive_parses_and_quiets_http_clients() {
        let resolved = resolve_filter(None, None);
        assert_eq!(resolved.source, FilterSource::Default);
        assert!(EnvFilter::try_new(&resolved.directive).is_ok());
        assert!(resolved.directive.contains("reqwest=warn"));
    }

    #[test]
    fn log_file_is_named_from_prefix_or_service() {
        let mut config = LoggingConfig::default();
        assert_eq!(log_file_name("atsd", &config), "atsd.log");
        config.file_prefix = Some("pump-house".to_owned());
        assert_eq!(log_file_name("atsd", &config), "pump-house.log");
        config.file_prefix = Some(" ".to_owned());
        assert_eq!(log_file_name("atsd", &config), "atsd.log");
    }
}
