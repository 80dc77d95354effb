//! Facade over `slog`. Components take an `impl Into<Option<&Logger>>`
//! parent at construction and derive a child logger from it, falling back to
//! `discard()` when none is supplied.

pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds a terminal logger writing structured records to stderr.
pub fn terminal() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("inline logger config must parse");

    config.build_logger().expect("terminal logger must build")
}

/// Logger that swallows every record.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_accepts_records() {
        let log = discard();
        info!(log, "swallowed"; "key" => 1);
    }

    #[test]
    fn test_terminal_builds() {
        let log = terminal();
        debug!(log, "built"; "destination" => "stderr");
    }
}
