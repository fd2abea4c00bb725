//! Configuration module for pin-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::gpio::Backend;
use crate::protocol::PinOverflow;
use clap::Parser;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the pin server
#[derive(Parser, Debug)]
#[command(name = "pin-server")]
#[command(version = "0.1.0")]
#[command(about = "Control GPIO pins over a line-oriented TCP protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host and port for listening (also accepted as `-ip`)
    #[arg(long = "ip", value_name = "HOST:PORT")]
    pub listen: Option<String>,

    /// Pin-control backend
    #[arg(short, long, value_enum)]
    pub backend: Option<Backend>,

    /// GPIO register device for the gpiomem backend
    #[arg(long)]
    pub gpio_device: Option<PathBuf>,

    /// What to do with pin numbers above 255
    #[arg(long, value_enum)]
    pub pin_overflow: Option<PinOverflow>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Rewrite the single-dash `-ip` flag into the `--ip` form clap expects.
///
/// Only arguments in flag position are rewritten: a `-ip` that is the value
/// of the preceding flag, or that follows `--`, is passed through.
pub fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut out = Vec::new();
    let mut value_next = false;
    let mut after_separator = false;

    for arg in args {
        let flag_position = !value_next && !after_separator;
        value_next = false;

        match arg.to_str() {
            Some("-ip") if flag_position => {
                out.push(OsString::from("--ip"));
                value_next = true;
                continue;
            }
            Some(s) if flag_position && s.starts_with("-ip=") => {
                out.push(OsString::from(format!("-{}", s)));
                continue;
            }
            Some("--") if flag_position => after_separator = true,
            Some(s) if flag_position => value_next = takes_value(s),
            _ => {}
        }
        out.push(arg);
    }

    out
}

/// Whether a flag consumes the following argument. Every option except
/// help and version takes a value.
fn takes_value(arg: &str) -> bool {
    match arg {
        "-h" | "--help" | "-V" | "--version" => false,
        s if s.starts_with("--") => !s.contains('='),
        s => s.len() == 2 && s.starts_with('-'),
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Pin-control configuration
#[derive(Debug, Deserialize)]
pub struct GpioConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    #[serde(default = "default_device")]
    pub device: PathBuf,
    #[serde(default)]
    pub pin_overflow: PinOverflow,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            device: default_device(),
            pin_overflow: PinOverflow::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:1382".to_string()
}

fn default_backend() -> Backend {
    Backend::Gpiomem
}

fn default_device() -> PathBuf {
    PathBuf::from("/dev/gpiomem")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backend: Backend,
    pub device: PathBuf,
    pub pin_overflow: PinOverflow,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse_from(normalize_args(std::env::args_os()));
        Self::from_cli(cli)
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backend: cli.backend.unwrap_or(toml_config.gpio.backend),
            device: cli.gpio_device.unwrap_or(toml_config.gpio.device),
            pin_overflow: cli.pin_overflow.unwrap_or(toml_config.gpio.pin_overflow),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let args = std::iter::once("pin-server")
            .chain(args.iter().copied())
            .map(OsString::from);
        CliArgs::parse_from(normalize_args(args))
    }

    #[test]
    fn test_default_config() {
        let config = Config::from_cli(cli(&[])).unwrap();
        assert_eq!(config.listen, "127.0.0.1:1382");
        assert_eq!(config.backend, Backend::Gpiomem);
        assert_eq!(config.device, PathBuf::from("/dev/gpiomem"));
        assert_eq!(config.pin_overflow, PinOverflow::Wrap);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_single_dash_ip() {
        let config = Config::from_cli(cli(&["-ip", "0.0.0.0:2000"])).unwrap();
        assert_eq!(config.listen, "0.0.0.0:2000");

        let config = Config::from_cli(cli(&["-ip=localhost:2001"])).unwrap();
        assert_eq!(config.listen, "localhost:2001");

        let config = Config::from_cli(cli(&["--ip", "[::1]:2002"])).unwrap();
        assert_eq!(config.listen, "[::1]:2002");
    }

    #[test]
    fn test_dash_ip_as_flag_value() {
        let args = ["pin-server", "--gpio-device", "-ip", "-ip", "0.0.0.0:2000"].map(OsString::from);
        assert_eq!(
            normalize_args(args),
            ["pin-server", "--gpio-device", "-ip", "--ip", "0.0.0.0:2000"]
                .map(OsString::from)
                .to_vec()
        );

        let config = Config::from_cli(cli(&["--log-level", "debug", "-ip", ":2003"])).unwrap();
        assert_eq!(config.listen, ":2003");
        assert_eq!(config.log_level, "debug");

        let config = Config::from_cli(cli(&["--log-level=warn", "-ip", ":2004"])).unwrap();
        assert_eq!(config.listen, ":2004");
    }

    #[test]
    fn test_normalize_stops_at_separator() {
        let args = ["pin-server", "-b", "sim", "--", "-ip"].map(OsString::from);
        assert_eq!(
            normalize_args(args),
            ["pin-server", "-b", "sim", "--", "-ip"].map(OsString::from).to_vec()
        );
    }

    #[test]
    fn test_cli_flags() {
        let config = Config::from_cli(cli(&[
            "--backend",
            "sim",
            "--pin-overflow",
            "reject",
            "--log-level",
            "debug",
        ]))
        .unwrap();

        assert_eq!(config.backend, Backend::Sim);
        assert_eq!(config.pin_overflow, PinOverflow::Reject);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:1382"

            [gpio]
            backend = "sim"
            device = "/dev/mem"
            pin_overflow = "reject"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:1382");
        assert_eq!(config.gpio.backend, Backend::Sim);
        assert_eq!(config.gpio.device, PathBuf::from("/dev/mem"));
        assert_eq!(config.gpio.pin_overflow, PinOverflow::Reject);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_toml_partial() {
        let config: TomlConfig = toml::from_str("[gpio]\nbackend = \"sim\"\n").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:1382");
        assert_eq!(config.gpio.backend, Backend::Sim);
        assert_eq!(config.gpio.device, PathBuf::from("/dev/gpiomem"));
    }

    #[test]
    fn test_cli_overrides_file() {
        let path = std::env::temp_dir().join(format!("pin-server-{}.toml", std::process::id()));
        std::fs::write(&path, "[server]\nlisten = \"0.0.0.0:9\"\n[gpio]\nbackend = \"sim\"\n").unwrap();

        let config = Config::from_cli(cli(&[
            "--config",
            path.to_str().unwrap(),
            "-ip",
            "127.0.0.1:7",
        ]))
        .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.listen, "127.0.0.1:7");
        assert_eq!(config.backend, Backend::Sim);
    }

    #[test]
    fn test_missing_config_file() {
        let err = Config::from_cli(cli(&["--config", "/nonexistent/pin-server.toml"])).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
    }
}
