use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

/// Resolved logging options. Precedence for the level: CLI flag, then the
/// `[logging]` section, then info. Format defaults to json; capture runs
/// headless, so machine-readable output is the baseline and `pretty` is the
/// opt-in for a human watching the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogOptions {
    pub fn resolve(config: &Config, cli_level: Option<&str>) -> anyhow::Result<Self> {
        let logging = config.logging.as_ref();
        let level = match cli_level.or_else(|| logging.and_then(|section| section.level.as_deref()))
        {
            Some(raw) => parse_level(raw)?,
            None => LevelFilter::INFO,
        };
        Ok(Self {
            level,
            format: logging
                .and_then(|section| section.format)
                .unwrap_or(LogFormat::Json),
        })
    }
}

pub fn init(config: &Config, cli_level: Option<&str>) -> anyhow::Result<()> {
    install_subscriber(LogOptions::resolve(config, cli_level)?)
}

fn parse_level(raw: &str) -> anyhow::Result<LevelFilter> {
    let level = match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        other => anyhow::bail!("unrecognized log level `{other}` (use trace/debug/info/warn/error/off)"),
    };
    Ok(level)
}

fn install_subscriber(options: LogOptions) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(options.level)
        .with_target(true);
    match options.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow::anyhow!("install tracing subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use super::{LogOptions, parse_level};
    use crate::config::{Config, LogFormat};
    use tracing_subscriber::filter::LevelFilter;

    fn minimal_config() -> Config {
        Config::from_toml_str(
            r#"
[storage]
path = "/tmp/netclip"
"#,
        )
        .expect("config should parse")
    }

    fn configured_logging() -> Config {
        Config::from_toml_str(
            r#"
[storage]
path = "/tmp/netclip"

[logging]
level = "warn"
format = "pretty"
"#,
        )
        .expect("config should parse")
    }

    #[test]
    fn defaults_are_info_and_json() {
        let options = LogOptions::resolve(&minimal_config(), None).unwrap();
        assert_eq!(options.level, LevelFilter::INFO);
        assert_eq!(options.format, LogFormat::Json);
    }

    #[test]
    fn cli_level_beats_the_config_section() {
        let options = LogOptions::resolve(&configured_logging(), Some("debug")).unwrap();
        assert_eq!(options.level, LevelFilter::DEBUG);
        assert_eq!(options.format, LogFormat::Pretty);
    }

    #[test]
    fn config_level_applies_without_a_cli_flag() {
        let options = LogOptions::resolve(&configured_logging(), None).unwrap();
        assert_eq!(options.level, LevelFilter::WARN);
    }

    #[test]
    fn level_parsing_trims_and_accepts_the_warning_alias() {
        assert_eq!(parse_level(" TRACE ").unwrap(), LevelFilter::TRACE);
        assert_eq!(parse_level("warning").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_level("off").unwrap(), LevelFilter::OFF);
    }

    #[test]
    fn unknown_levels_are_rejected() {
        let err = LogOptions::resolve(&minimal_config(), Some("loud")).unwrap_err();
        assert!(
            err.to_string().contains("unrecognized log level `loud`"),
            "unexpected error: {err}"
        );
    }
}
