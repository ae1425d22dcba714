//! Persistent configuration for clara-kiosk.
//!
//! Config file lives at `~/.config/clara/kiosk.toml`.

use std::path::{Path, PathBuf};

use clara_link::{AppState, Endpoint, LinkConfig};
use serde::{Deserialize, Serialize};

/// Backend endpoint used when neither the CLI nor the config file names one.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws/clara";

/// User configuration (persisted in kiosk.toml).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Backend WebSocket endpoint. Default: ws://localhost:8000/ws/clara
    pub endpoint: Option<String>,
    /// Reconnect timing and limits. Missing keys take their defaults.
    pub link: Option<LinkConfig>,
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clara")
        .join("kiosk.toml")
}

impl Config {
    /// Load from `path`. A missing file is not an error; an unreadable or
    /// malformed one is logged and ignored.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str(&s) {
                Ok(c) => return c,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Bad config file, using defaults"),
            },
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Can't read config file, using defaults"),
        }
        Self::default()
    }
}

/// Effective settings after merging CLI args > config file > defaults.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub endpoint: Endpoint,
    pub link: LinkConfig,
    /// One-shot local state applied at startup.
    pub start_state: Option<AppState>,
}

impl Resolved {
    pub fn merge(cli: &super::Cli, config: &Config) -> Self {
        let endpoint = cli
            .endpoint
            .clone()
            .or_else(|| config.endpoint.clone())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        Self {
            endpoint: Endpoint::new(endpoint),
            link: config.link.clone().unwrap_or_default(),
            start_state: cli.state.and_then(AppState::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> super::super::Cli {
        super::super::Cli::parse_from(std::iter::once("clara-kiosk").chain(args.iter().copied()))
    }

    #[test]
    fn test_parse_link_table() {
        let config: Config = toml::from_str(
            r#"
            endpoint = "ws://10.0.0.5:8000/ws/clara"

            [link]
            debounce_ms = 2500
            idle_timeout_ms = 600000
            "#,
        )
        .unwrap();
        let link = config.link.unwrap();
        assert_eq!(link.debounce_ms, 2500);
        assert_eq!(link.idle_timeout_ms, Some(600_000));
        assert_eq!(link.grace_ms, LinkConfig::default().grace_ms);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = Config {
            endpoint: Some("ws://from-file/ws/clara".into()),
            link: None,
        };
        let resolved = Resolved::merge(&cli(&["--endpoint", "ws://from-cli/ws/clara"]), &file);
        assert_eq!(resolved.endpoint.as_str(), "ws://from-cli/ws/clara");
        assert_eq!(resolved.link, LinkConfig::default());
    }

    #[test]
    fn test_start_state_flag() {
        let resolved = Resolved::merge(&cli(&["--endpoint", "ws://x/ws", "--state", "5"]), &Config::default());
        assert_eq!(resolved.start_state, Some(AppState::CHAT));
        assert!(super::super::Cli::try_parse_from(["clara-kiosk", "--state", "9"]).is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load(Path::new("/nonexistent/clara/kiosk.toml"));
        assert!(config.endpoint.is_none());
        assert!(config.link.is_none());
    }
}
