//! Application configuration using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults
//! 2. A TOML file (`config/edl_daq.toml` unless another path is given)
//! 3. Environment variables prefixed with `EDL_DAQ_`, nested keys split on
//!    a double underscore (`EDL_DAQ_APPLICATION__LOG_LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use edl_daq::config::AppConfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = AppConfig::load()?;
//! config.validate().map_err(anyhow::Error::msg)?;
//! println!("Polling every {} ms", config.session.acquisition.poll_interval_ms);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use daq_driver_edl::mock::SimulatorConfig;
use daq_driver_edl::SessionConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::logging::LogFormat;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/edl_daq.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "EDL_DAQ_";

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application identity and logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Driver session settings (link, acquisition loop, protocol limits)
    #[serde(default)]
    pub session: SessionConfig,
    /// Simulated amplifier used when no hardware backend is available
    #[serde(default)]
    pub simulator: SimulatorConfig,
    /// Timings of the bench procedures
    #[serde(default)]
    pub procedures: ProcedureConfig,
    /// Where and how long to record
    #[serde(default)]
    pub recording: RecordingConfig,
}

/// Application-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name reported in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format of the log layer
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Timing of the host procedures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureConfig {
    /// How long CompAll is held pressed during offset compensation
    #[serde(default = "default_compensation_hold", with = "humantime_serde")]
    pub compensation_hold: Duration,
    /// Pause before purging and recording, letting the protocol settle
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,
}

impl Default for ProcedureConfig {
    fn default() -> Self {
        Self {
            compensation_hold: default_compensation_hold(),
            settle: default_settle(),
        }
    }
}

/// Recording defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Directory relative output paths are resolved against
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Packets requested per record command
    #[serde(default = "default_packets")]
    pub packets: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            packets: default_packets(),
        }
    }
}

impl RecordingConfig {
    /// Resolve `path` against the output directory unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.output_dir.join(path)
        }
    }
}

fn default_name() -> String {
    "edl-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_compensation_hold() -> Duration {
    Duration::from_secs(5)
}

fn default_settle() -> Duration {
    Duration::from_millis(500)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_packets() -> usize {
    10_000
}

impl AppConfig {
    /// Load from the default file location and the environment.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The provider stack behind [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        self.session.validate()?;

        if self.simulator.channels != self.session.acquisition.channels {
            return Err(format!(
                "Simulator produces {} channels but the session expects {}",
                self.simulator.channels, self.session.acquisition.channels
            ));
        }

        if self.simulator.devices.is_empty() {
            return Err("Simulator must expose at least one device".to_string());
        }

        if self.recording.packets == 0 {
            return Err("recording.packets must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.procedures.compensation_hold, Duration::from_secs(5));
        assert_eq!(config.procedures.settle, Duration::from_millis(500));
        assert_eq!(config.session.acquisition.channels, 5);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let config = AppConfig::load_from("does-not-exist.toml")?;
            assert_eq!(config.application.log_level, "info");
            assert_eq!(config.recording.packets, 10_000);
            Ok(())
        });
    }

    #[test]
    fn test_load_toml_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "edl.toml",
                r#"
                [application]
                log_level = "debug"
                log_format = "json"

                [session.acquisition]
                min_batch_packets = 20
                max_polls = 50

                [simulator]
                packets_per_poll = 40
                total_packets = 400

                [procedures]
                compensation_hold = "250ms"
                "#,
            )?;

            let config = AppConfig::load_from("edl.toml")?;
            assert_eq!(config.application.log_level, "debug");
            assert!(matches!(config.application.log_format, LogFormat::Json));
            assert_eq!(config.session.acquisition.min_batch_packets, 20);
            assert_eq!(config.session.acquisition.max_polls, Some(50));
            assert_eq!(config.session.acquisition.channels, 5);
            assert_eq!(config.simulator.total_packets, Some(400));
            assert_eq!(
                config.procedures.compensation_hold,
                Duration::from_millis(250)
            );
            assert_eq!(config.procedures.settle, Duration::from_millis(500));
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "edl.toml",
                r#"
                [application]
                log_level = "debug"
                "#,
            )?;
            jail.set_env("EDL_DAQ_APPLICATION__LOG_LEVEL", "warn");
            jail.set_env("EDL_DAQ_SESSION__CONNECTION__DISCONNECT_ATTEMPTS", "7");

            let config = AppConfig::load_from("edl.toml")?;
            assert_eq!(config.application.log_level, "warn");
            assert_eq!(config.session.connection.disconnect_attempts, 7);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_channel_mismatch() {
        let mut config = AppConfig::default();
        config.simulator.channels = 3;
        let err = config.validate().unwrap_err();
        assert!(err.contains("channels"));
    }

    #[test]
    fn test_unbounded_read_loop_rejected() {
        let mut config = AppConfig::default();
        config.session.acquisition.max_polls = None;
        config.session.acquisition.timeout_ms = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_output_path() {
        let recording = RecordingConfig::default();
        assert_eq!(
            recording.resolve(Path::new("run.f32")),
            PathBuf::from("data/run.f32")
        );
        assert_eq!(
            recording.resolve(Path::new("/tmp/run.f32")),
            PathBuf::from("/tmp/run.f32")
        );
    }
}
