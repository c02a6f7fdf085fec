//! Logger bootstrap shared by the stevedore binaries.

use std::io::Write;

const LOG_ENV: &str = "STEVEDORE_LOG";

/// Initialise the process-wide logger.
///
/// Defaults to `info` and honours the `STEVEDORE_LOG` filter variable.
/// Repeated calls are harmless so library tests can call this too.
pub fn init() {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(log::LevelFilter::Info)
        .parse_env(LOG_ENV)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        });
    let _ = builder.try_init();
}
