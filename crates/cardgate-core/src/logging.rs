//! Logging bootstrapper shared by the daemon and any embedding binary.

use env_logger::Env;
use serde_json::json;
use std::env;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "CARDGATE_LOG_FORMAT";
const LEVEL_ENV: &str = "CARDGATE_LOG_LEVEL";

/// Crates whose records follow the requested level; everything else is held
/// at `warn`.
const CARDGATE_TARGETS: [&str; 2] = ["cardgate_core", "cardgate_daemon"];

/// Initialize the global logger.
///
/// The first caller wins; later calls are no-ops. When `RUST_LOG` is unset the
/// level comes from `CARDGATE_LOG_LEVEL`, then `default_level`, and applies to
/// the cardgate crates only. Output is one JSON object per line unless
/// `CARDGATE_LOG_FORMAT=plain`.
pub fn init(default_level: &str) {
    let _ = INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let env = Env::default().default_filter_or(default_filter(&level));

    let format = env::var(FORMAT_ENV)
        .unwrap_or_else(|_| String::from("json"))
        .to_lowercase();

    let mut builder = env_logger::Builder::from_env(env);
    if format == "json" {
        builder.format(|buf, record| {
            let payload = json!({
                "timestamp": buf.timestamp().to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", payload)
        });
    } else {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} {} {} - {}",
                buf.timestamp(),
                record.level().to_string().to_lowercase(),
                record.target(),
                record.args()
            )
        });
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {}", err);
    }
}

/// `warn,cardgate_core=<level>,cardgate_daemon=<level>`
fn default_filter(level: &str) -> String {
    CARDGATE_TARGETS
        .iter()
        .fold(String::from("warn"), |mut filter, target| {
            filter.push_str(&format!(",{target}={level}"));
            filter
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_scopes_level_to_cardgate() {
        assert_eq!(
            default_filter("debug"),
            "warn,cardgate_core=debug,cardgate_daemon=debug"
        );
    }
}
