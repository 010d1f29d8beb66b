use dotenvy::dotenv;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_DIRECTIVES: &str = "info,actix_server=warn";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub directives: String,
    pub json: bool,
}

impl LogSettings {
    /// Reads `RUST_LOG` and `LOG_FORMAT`, after loading `.env` so values kept
    /// there apply to logging as well as to [`crate::config::Config`].
    pub fn from_env() -> Self {
        dotenv().ok();
        Self::from_vars(
            std::env::var("RUST_LOG").ok(),
            std::env::var("LOG_FORMAT").ok(),
        )
    }

    fn from_vars(rust_log: Option<String>, log_format: Option<String>) -> Self {
        let directives = rust_log
            .filter(|v| !v.trim().is_empty() && EnvFilter::try_new(v).is_ok())
            .unwrap_or_else(|| DEFAULT_DIRECTIVES.to_string());
        let json = log_format.is_some_and(|v| v.eq_ignore_ascii_case("json"));
        Self { directives, json }
    }
}

/// `RUST_LOG` filters (default `info`); `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let settings = LogSettings::from_env();
    let env_filter = EnvFilter::new(&settings.directives);

    if settings.json {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .with_current_span(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(false).init();
    }
}
