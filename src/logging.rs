//! Dynamic log configuration.
//!
//! `logs.yaml` carries two component levels: the supervisor's own output
//! and the `nginx` target fed by the proxy child's stdout/stderr. Levels
//! are applied through a `tracing_subscriber` reload handle so a hot
//! reload can change verbosity without restarting. Nginx stderr lines are
//! surfaced as `warn` or `error` depending on `stderr_show`
//! (falling back to `stderr_as`, then to `error`).

use crate::config::LogConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Log target used for proxy child output.
pub const NGINX_TARGET: &str = "nginx";

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Normalize a configured level string. Unknown or empty values fall back
/// to `info`.
pub fn parse_level(level: &str) -> Level {
    match level.trim().to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Applies `logs.yaml` to the live subscriber and routes nginx stderr.
pub struct LogController {
    handle: Option<FilterHandle>,
    stderr_warn: AtomicBool,
}

impl LogController {
    /// Install the global subscriber and return the controller. Called
    /// once from `main`.
    pub fn init() -> Arc<Self> {
        let filter = EnvFilter::new(filter_directives(Level::INFO, Level::INFO));
        let (filter_layer, handle) = reload::Layer::new(filter);
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer())
            .init();
        Arc::new(Self {
            handle: Some(handle),
            stderr_warn: AtomicBool::new(false),
        })
    }

    /// A controller that records stderr routing but leaves the subscriber
    /// alone. Tests use this to avoid fighting over the global dispatcher.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            handle: None,
            stderr_warn: AtomicBool::new(false),
        })
    }

    /// Apply the levels from a freshly loaded configuration.
    pub fn apply(&self, config: &LogConfig) {
        let sslly = parse_level(&config.sslly.level);
        let nginx = parse_level(&config.nginx.level);

        // stderr_show defaults to stderr_as, which defaults to error.
        let stderr_as = if config.nginx.stderr_as.trim().is_empty() {
            "error".to_string()
        } else {
            config.nginx.stderr_as.clone()
        };
        let stderr_show = if config.nginx.stderr_show.trim().is_empty() {
            stderr_as
        } else {
            config.nginx.stderr_show.clone()
        };
        self.stderr_warn
            .store(parse_level(&stderr_show) == Level::WARN, Ordering::Relaxed);

        if let Some(handle) = &self.handle {
            let directives = filter_directives(sslly, nginx);
            if let Err(e) = handle.reload(EnvFilter::new(&directives)) {
                tracing::warn!(error = %e, "failed to apply log configuration");
            }
        }
    }

    /// Whether nginx stderr lines should surface as `warn` instead of
    /// `error`.
    pub fn nginx_stderr_is_warn(&self) -> bool {
        self.stderr_warn.load(Ordering::Relaxed)
    }
}

fn filter_directives(sslly: Level, nginx: Level) -> String {
    format!(
        "warn,sslly_nginx={},{}={}",
        level_str(sslly),
        NGINX_TARGET,
        level_str(nginx)
    )
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NginxLogConfig;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("Info"), Level::INFO);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level(""), Level::INFO);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_stderr_show_defaults_to_stderr_as() {
        let controller = LogController::disabled();

        // Default: error.
        controller.apply(&LogConfig::default());
        assert!(!controller.nginx_stderr_is_warn());

        // stderr_as warn, stderr_show unset -> warn.
        controller.apply(&LogConfig {
            nginx: NginxLogConfig {
                stderr_as: "warn".to_string(),
                ..NginxLogConfig::default()
            },
            ..LogConfig::default()
        });
        assert!(controller.nginx_stderr_is_warn());

        // Explicit stderr_show wins over stderr_as.
        controller.apply(&LogConfig {
            nginx: NginxLogConfig {
                stderr_as: "warn".to_string(),
                stderr_show: "error".to_string(),
                ..NginxLogConfig::default()
            },
            ..LogConfig::default()
        });
        assert!(!controller.nginx_stderr_is_warn());
    }

    #[test]
    fn test_filter_directives() {
        assert_eq!(
            filter_directives(Level::DEBUG, Level::WARN),
            "warn,sslly_nginx=debug,nginx=warn"
        );
    }
}
