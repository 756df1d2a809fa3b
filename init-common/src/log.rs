//! Logging setup shared by the chef-init binaries.
//!
//! Diagnostics always go to stderr. Stdout belongs to the forwarded service
//! logs and the client's own output.

use std::fmt;
use std::time::Instant;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown log level `{0}` (expected debug, info, warn, error, fatal)")]
pub struct UnknownLevel(pub String);

/// Map a client-style log level onto a tracing filter directive.
///
/// `fatal` has no tracing equivalent and maps to `error`.
pub fn level_directive(level: &str) -> Result<&'static str, UnknownLevel> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" => Ok("warn"),
        "error" | "fatal" => Ok("error"),
        _ => Err(UnknownLevel(level.to_string())),
    }
}

/// Install the global subscriber. `RUST_LOG`, when set, wins over `level`.
///
/// Calling it twice is harmless; the second call is ignored.
pub fn init(level: &str) -> Result<(), UnknownLevel> {
    let directive = level_directive(level)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(filter)
        .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_levels_map_to_tracing() {
        assert_eq!(level_directive("debug").unwrap(), "debug");
        assert_eq!(level_directive("INFO").unwrap(), "info");
        assert_eq!(level_directive("warn").unwrap(), "warn");
        assert_eq!(level_directive("fatal").unwrap(), "error");
    }

    #[test]
    fn unknown_level_is_rejected() {
        let err = level_directive("verbose").unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }

    #[test]
    fn init_twice_is_harmless() {
        init("info").unwrap();
        init("debug").unwrap();
    }
}
