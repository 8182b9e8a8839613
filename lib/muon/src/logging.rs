pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

/// Builds the default terminal logger. Components take their logger as a
/// constructor parameter, so alternative drains can be swapped in without
/// touching this function.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Logger that swallows everything. Used as the fallback when a component is
/// constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
