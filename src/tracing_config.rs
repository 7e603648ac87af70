//! Tracing subscriber configuration
//!
//! The library only emits events; the `vegseg` binary installs a subscriber
//! through [`TracingConfig`]. `RUST_LOG` takes precedence over the verbosity
//! flags when set.

#[cfg(any(feature = "cli", feature = "server"))]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TracingFormat {
    /// Colored console output (default)
    #[default]
    Console,
    /// Plain output without colors, for CI and containers
    Compact,
    /// One JSON object per event
    #[cfg(feature = "tracing-json")]
    Json,
}

/// Tracing configuration builder
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Verbosity level (maps to log levels)
    pub verbosity: u8,
    pub format: TracingFormat,
    /// Explicit filter directive; overrides verbosity and `RUST_LOG`
    pub env_filter: Option<String>,
    /// Session ID logged at startup for correlation
    pub session_id: Option<String>,
}

impl TracingConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn with_session_id<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Filter directive for the configured verbosity
    ///
    /// Dependencies stay at `warn` until `-vv`.
    #[must_use]
    pub fn verbosity_to_filter(&self) -> String {
        let own = match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        let deps = if self.verbosity >= 2 { "debug" } else { "warn" };
        format!("{deps},vegseg={own},tower_http={own}")
    }

    /// Install the global subscriber
    ///
    /// # Errors
    /// Invalid filter directives, or a subscriber already installed
    #[cfg(any(feature = "cli", feature = "server"))]
    pub fn init(self) -> anyhow::Result<()> {
        use tracing_subscriber::fmt;

        let filter = match &self.env_filter {
            Some(directive) => EnvFilter::try_new(directive)?,
            None => EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(self.verbosity_to_filter()))?,
        };
        let registry = Registry::default().with(filter);

        match self.format {
            TracingFormat::Console => {
                let fmt_layer = fmt::layer()
                    .with_ansi(true)
                    .with_target(false)
                    .with_level(true)
                    .compact();
                registry.with(fmt_layer).try_init()?;
            },
            TracingFormat::Compact => {
                let fmt_layer = fmt::layer().with_ansi(false).with_target(false).compact();
                registry.with(fmt_layer).try_init()?;
            },
            #[cfg(feature = "tracing-json")]
            TracingFormat::Json => {
                let fmt_layer = fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true);
                registry.with(fmt_layer).try_init()?;
            },
        }

        if let Some(session_id) = &self.session_id {
            tracing::info!(session_id = %session_id, "vegseg session started");
        }
        Ok(())
    }
}

/// Initialize tracing with CLI defaults and a fresh session id
///
/// # Errors
/// As [`TracingConfig::init`]
#[cfg(any(feature = "cli", feature = "server"))]
pub fn init_cli_tracing(verbosity: u8, format: TracingFormat) -> anyhow::Result<()> {
    TracingConfig::new()
        .with_verbosity(verbosity)
        .with_format(format)
        .with_session_id(uuid::Uuid::new_v4().to_string())
        .init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(
            TracingConfig::new().verbosity_to_filter(),
            "warn,vegseg=info,tower_http=info"
        );
        assert_eq!(
            TracingConfig::new().with_verbosity(1).verbosity_to_filter(),
            "warn,vegseg=debug,tower_http=debug"
        );
        assert_eq!(
            TracingConfig::new().with_verbosity(5).verbosity_to_filter(),
            "debug,vegseg=trace,tower_http=trace"
        );
    }

    #[test]
    fn test_config_builder() {
        let config = TracingConfig::new()
            .with_verbosity(2)
            .with_format(TracingFormat::Compact)
            .with_env_filter("vegseg=trace")
            .with_session_id("test-session");

        assert_eq!(config.verbosity, 2);
        assert_eq!(config.format, TracingFormat::Compact);
        assert_eq!(config.env_filter.as_deref(), Some("vegseg=trace"));
        assert_eq!(config.session_id.as_deref(), Some("test-session"));
    }
}
