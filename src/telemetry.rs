//! Error-report and log subscriber setup for the embedding process.

use color_eyre::{eyre::eyre, Result};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const DEFAULT_LEVEL: Level = Level::INFO;

/// Installs `color_eyre` and a pretty fmt subscriber. Call once at startup.
///
/// The level comes from `RUST_LOG` (`error`, `warn`, `info`, `debug`,
/// `trace`) and falls back to `info`.
pub fn setup() -> Result<()> {
    color_eyre::install()?;

    let level = std::env::var("RUST_LOG")
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(DEFAULT_LEVEL);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
    Ok(())
}

fn parse_level(raw: &str) -> Option<Level> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("homedash=trace"), None);
    }
}
