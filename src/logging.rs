use crate::error::AppError;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter directive, e.g. `cloudspend=debug`.
pub const LOG_ENV: &str = "CLOUDSPEND_LOG";

const DEFAULT_FILTER: &str = "warn";

fn env_filter(directive: Option<&str>) -> EnvFilter {
    directive
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a compact stderr subscriber so stdout stays free for command output.
pub fn init_logging() -> Result<(), AppError> {
    let directive = std::env::var(LOG_ENV).ok();
    fmt()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter(directive.as_deref()))
        .try_init()
        .map_err(|e| AppError::Config(format!("failed to initialize logging: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_defaults_to_warn() {
        assert_eq!(env_filter(None).to_string(), "warn");
    }

    #[test]
    fn filter_accepts_directives() {
        assert_eq!(
            env_filter(Some("cloudspend=debug")).to_string(),
            "cloudspend=debug"
        );
    }
}
