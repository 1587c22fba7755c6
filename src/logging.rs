use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("MSR145_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Map a `-v` count onto a level. Zero means "no override".
pub fn verbosity_level(count: u8) -> Option<LevelFilter> {
    match count {
        0 => None,
        1 => Some(LevelFilter::Debug),
        _ => Some(LevelFilter::Trace),
    }
}

/// Initialize stderr logging for the binary.
///
/// An explicit `level` wins over `MSR145_LOG`/`RUST_LOG`; with neither set the
/// level is `info`. Safe to call more than once, only the first call installs
/// the logger.
pub fn init_logging(level: Option<LevelFilter>) {
    let level = level.unwrap_or_else(env_level);
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        env_logger::Builder::from_env(env)
            .filter_level(level)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(verbosity_level(0), None);
        assert_eq!(verbosity_level(1), Some(LevelFilter::Debug));
        assert_eq!(verbosity_level(4), Some(LevelFilter::Trace));
    }

    #[test]
    fn level_names_round_trip_through_parse() {
        for level in [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ] {
            assert_eq!(level_to_str(level).parse::<LevelFilter>().unwrap(), level);
        }
    }
}
