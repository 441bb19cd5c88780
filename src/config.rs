use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default broker port the extension dials.
pub const DEFAULT_PORT: u16 = 5555;

/// Environment variable carrying a comma-separated experiment allow-list.
pub const EXPERIMENTS_ENV: &str = "SUPERSURF_EXPERIMENTS";

/// Wire-frame debug logging mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DebugMode {
    /// No frame logging.
    #[default]
    Off,
    /// Log frames truncated to 500 characters.
    Truncate,
    /// Log complete frames.
    NoTruncate,
}

impl DebugMode {
    /// Parse the config/CLI representation: `false`, `"truncate"`, or
    /// `"no_truncate"`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "false" | "off" => Some(Self::Off),
            "truncate" | "true" => Some(Self::Truncate),
            "no_truncate" => Some(Self::NoTruncate),
            _ => None,
        }
    }

    /// Whether any frame logging is enabled.
    #[must_use]
    pub fn is_enabled(self) -> bool {
        self != Self::Off
    }
}

// ---------------------------------------------------------------------------
// Config file (parsed from TOML)
// ---------------------------------------------------------------------------

/// Parsed TOML config file. All fields optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigFile {
    pub port: Option<u16>,
    /// `false`, `"truncate"`, or `"no_truncate"`.
    pub debug: Option<toml::Value>,
    /// Startup allow-list for infra-gating experiments.
    pub enabled_experiments: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

/// Fully resolved configuration, flags > env > file > defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub debug: DebugMode,
    pub enabled_experiments: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: "127.0.0.1".to_owned(),
            debug: DebugMode::Off,
            enabled_experiments: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading the config file.
    Io(std::io::Error),
    /// The config file is not valid TOML.
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config file error: {e}"),
            Self::Parse(msg) => write!(f, "config parse error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and merging
// ---------------------------------------------------------------------------

/// Default config file location: `<user config dir>/supersurf/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("supersurf").join("config.toml"))
}

/// Load the config file from an explicit path or the default location.
///
/// A missing file is not an error; it yields the empty `ConfigFile`.
///
/// # Errors
///
/// Returns `ConfigError` when the file exists but cannot be read or
/// parsed.
pub fn load_config_file(explicit: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) if p.exists() => p,
            _ => return Ok(ConfigFile::default()),
        },
    };
    let text = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
    toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Merge a parsed file, environment, and CLI overrides into a resolved
/// [`Config`].
#[must_use]
pub fn resolve_config(
    file: &ConfigFile,
    env_experiments: Option<&str>,
    cli_port: Option<u16>,
    cli_debug: Option<DebugMode>,
) -> Config {
    let mut config = Config::default();

    if let Some(port) = file.port {
        config.port = port;
    }
    if let Some(debug) = file.debug.as_ref().and_then(debug_from_toml) {
        config.debug = debug;
    }
    if let Some(list) = &file.enabled_experiments {
        config.enabled_experiments.clone_from(list);
    }

    if let Some(raw) = env_experiments {
        let parsed: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        if !parsed.is_empty() {
            config.enabled_experiments = parsed;
        }
    }

    if let Some(port) = cli_port {
        config.port = port;
    }
    if let Some(debug) = cli_debug {
        config.debug = debug;
    }

    config
}

/// The `debug` key accepts `false` or one of the mode strings.
fn debug_from_toml(value: &toml::Value) -> Option<DebugMode> {
    match value {
        toml::Value::Boolean(false) => Some(DebugMode::Off),
        toml::Value::Boolean(true) => Some(DebugMode::Truncate),
        toml::Value::String(s) => DebugMode::parse(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.port, 5555);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.debug, DebugMode::Off);
        assert!(config.enabled_experiments.is_empty());
    }

    #[test]
    fn parse_debug_modes() {
        assert_eq!(DebugMode::parse("false"), Some(DebugMode::Off));
        assert_eq!(DebugMode::parse("truncate"), Some(DebugMode::Truncate));
        assert_eq!(DebugMode::parse("no_truncate"), Some(DebugMode::NoTruncate));
        assert_eq!(DebugMode::parse("bogus"), None);
    }

    #[test]
    fn file_values_apply() {
        let file: ConfigFile = toml::from_str(
            r#"
            port = 6001
            debug = "no_truncate"
            enabled_experiments = ["multiplexer"]
            "#,
        )
        .unwrap();
        let config = resolve_config(&file, None, None, None);
        assert_eq!(config.port, 6001);
        assert_eq!(config.debug, DebugMode::NoTruncate);
        assert_eq!(config.enabled_experiments, vec!["multiplexer"]);
    }

    #[test]
    fn debug_accepts_boolean_false() {
        let file: ConfigFile = toml::from_str("debug = false").unwrap();
        let config = resolve_config(&file, None, None, None);
        assert_eq!(config.debug, DebugMode::Off);
    }

    #[test]
    fn env_experiments_override_file() {
        let file: ConfigFile = toml::from_str(r#"enabled_experiments = ["a"]"#).unwrap();
        let config = resolve_config(&file, Some("page_diffing, smart_waiting"), None, None);
        assert_eq!(config.enabled_experiments, vec![
            "page_diffing",
            "smart_waiting"
        ]);
    }

    #[test]
    fn empty_env_is_ignored() {
        let file: ConfigFile = toml::from_str(r#"enabled_experiments = ["a"]"#).unwrap();
        let config = resolve_config(&file, Some("  "), None, None);
        assert_eq!(config.enabled_experiments, vec!["a"]);
    }

    #[test]
    fn cli_beats_file() {
        let file: ConfigFile = toml::from_str("port = 6001").unwrap();
        let config = resolve_config(&file, None, Some(7777), Some(DebugMode::Truncate));
        assert_eq!(config.port, 7777);
        assert_eq!(config.debug, DebugMode::Truncate);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let loaded = load_config_file(Some(Path::new("/nonexistent/supersurf.toml")));
        assert!(loaded.is_err());
        // No explicit path and no default file present: empty config.
        // (Cannot assert on the default path's absence in every
        // environment, so only the explicit-path error is checked here.)
    }

    #[test]
    fn load_from_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = 6010\n").unwrap();
        let file = load_config_file(Some(&path)).unwrap();
        assert_eq!(file.port, Some(6010));
    }
}
