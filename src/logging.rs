use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// `RUST_LOG` wins over `level`. `format` is `"json"` for one JSON object per
/// event, anything else selects the human-readable formatter.
///
/// Note: This function can only be called once per process.
pub fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

/// Mask the user-info part of a connection string for safe display
///
/// `postgres://user:pw@host/db` becomes `postgres://***@host/db`. Strings
/// that are not URLs are shown as `***` unless they carry no `@` at all.
pub fn mask_dsn(dsn: &str) -> String {
    match url::Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.username().is_empty() && parsed.password().is_none() {
                return dsn.to_string();
            }
            let _ = parsed.set_password(None);
            if parsed.set_username("***").is_err() {
                return "***".to_string();
            }
            parsed.to_string()
        }
        Err(_) if dsn.contains('@') => "***".to_string(),
        Err(_) => dsn.to_string(),
    }
}
