pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Build the root logger from a `[log]` config section. When the section is
/// absent we fall back to a terminal logger on stderr.
pub fn init(config: Option<&LoggerConfig>) -> Result<Logger, sloggers::Error> {
    match config {
        Some(config) => config.build_logger(),
        None => {
            let config: LoggerConfig = serdeconv::from_toml_str(
                r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
            )
            .expect("default logger config must parse");
            config.build_logger()
        }
    }
}

/// Logger that swallows everything. Test helper.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
