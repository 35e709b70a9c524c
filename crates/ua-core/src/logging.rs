//! Subscriber setup for binaries and tests
//!
//! The core only emits `tracing` events. Each layer logs under its own
//! module path, so verbosity can be tuned per layer:
//!
//! | layer | target |
//! |---|---|
//! | transactions | `sipua_core::transaction` |
//! | dialogs and usages | `sipua_core::dialog` |
//! | routing and UAC/UAS | `sipua_core::core` |
//! | tokio driver | `sipua_core::runtime` |
//!
//! `RUST_LOG` directives override the ones configured here.

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{Error, Result};

/// Stack layers with their own verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Transaction,
    Dialog,
    Core,
    Runtime,
}

impl Layer {
    pub fn target(self) -> &'static str {
        match self {
            Layer::Transaction => "sipua_core::transaction",
            Layer::Dialog => "sipua_core::dialog",
            Layer::Core => "sipua_core::core",
            Layer::Runtime => "sipua_core::runtime",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for everything without a more specific directive
    pub level: Level,
    /// Per-layer overrides
    pub layers: Vec<(Layer, Level)>,
    /// JSON lines instead of the human readable format
    pub json: bool,
    /// Report when the per-agent driver span opens and closes
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            layers: Vec::new(),
            json: false,
            span_events: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    /// Protocol tracing: routing and dialogs at debug, timers at trace.
    pub fn protocol_trace() -> Self {
        Self::new(Level::INFO)
            .with_layer(Layer::Core, Level::DEBUG)
            .with_layer(Layer::Dialog, Level::DEBUG)
            .with_layer(Layer::Transaction, Level::TRACE)
    }

    pub fn with_layer(mut self, layer: Layer, level: Level) -> Self {
        self.layers.retain(|(l, _)| *l != layer);
        self.layers.push((layer, level));
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_span_events(mut self) -> Self {
        self.span_events = true;
        self
    }

    /// Directive string equivalent to this configuration, e.g.
    /// `info,sipua_core::dialog=debug`.
    pub fn directives(&self) -> String {
        let mut directives = vec![self.level.as_str().to_ascii_lowercase()];
        for (layer, level) in &self.layers {
            directives.push(format!("{}={}", layer.target(), level.as_str().to_ascii_lowercase()));
        }
        directives.join(",")
    }

    /// Filter from the configured directives, extended by `RUST_LOG`.
    pub fn filter(&self) -> Result<EnvFilter> {
        let mut directives = self.directives();
        if let Ok(env) = std::env::var(EnvFilter::DEFAULT_ENV) {
            if !env.trim().is_empty() {
                directives.push(',');
                directives.push_str(&env);
            }
        }
        EnvFilter::try_new(&directives).map_err(|e| Error::Config(format!("Invalid log filter {:?}: {}", directives, e)))
    }
}

/// Installs the global `fmt` subscriber. Fails when one is already set.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let builder = fmt::Subscriber::builder()
        .with_env_filter(config.filter()?)
        .with_span_events(span_events)
        .with_target(true);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| Error::Config(format!("Failed to install subscriber: {}", e)))
}

/// Routes logs through the test harness's captured output.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logging() {
    let filter = LoggingConfig::protocol_trace()
        .filter()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_per_layer() {
        let config = LoggingConfig::new(Level::WARN)
            .with_layer(Layer::Dialog, Level::DEBUG)
            .with_layer(Layer::Dialog, Level::TRACE);
        assert_eq!(config.directives(), "warn,sipua_core::dialog=trace");
    }

    #[test]
    fn test_protocol_trace_filter_builds() {
        let config = LoggingConfig::protocol_trace();
        assert!(config.directives().contains("sipua_core::transaction=trace"));
        assert!(config.filter().is_ok());
    }

    #[test]
    fn test_layer_targets_are_module_paths() {
        assert_eq!(Layer::Transaction.target(), module_path!().replace("logging", "transaction"));
        assert_eq!(Layer::Runtime.target(), "sipua_core::runtime");
    }

    #[test]
    fn test_second_install_fails() {
        init_test_logging();
        assert!(matches!(setup_logging(&LoggingConfig::default()), Err(Error::Config(_))));
    }
}
