use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Initialization options for logging
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset or invalid
    pub default_filter: String,
    /// Colour output; off when stderr is a log file
    pub ansi: bool,
    /// Include the event target (module path)
    pub with_target: bool,
}

impl LoggingConfig {
    /// Interactive front end: coloured, terse.
    pub fn front_end() -> Self {
        Self {
            default_filter: "info".into(),
            ansi: true,
            with_target: false,
        }
    }

    /// Detached worker whose stderr is the per-tunnel log file.
    pub fn worker() -> Self {
        Self {
            default_filter: "info".into(),
            ansi: false,
            with_target: true,
        }
    }

    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// Install a stderr subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), anyhow::Error> {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_target(config.with_target);

    Registry::default()
        .with(config.filter())
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
