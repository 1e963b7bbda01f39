//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Every field has a
//! default, so an empty document and a missing file are both valid
//! configurations.
use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{producer, sink};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The generator section is inconsistent
    #[error("Invalid generator configuration: {0}")]
    Producer(#[from] producer::Error),
    /// The sender section is inconsistent
    #[error("Invalid sender configuration: {0}")]
    Sink(#[from] sink::Error),
    /// Zero value error
    #[error("stats_period_seconds cannot be zero")]
    ZeroStatsPeriod,
}

fn default_stats_period_seconds() -> u64 {
    60
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The catalog and the production clock
    #[serde(default)]
    pub generator: producer::Config,
    /// The collector and the write path
    #[serde(default)]
    pub sender: sink::Config,
    /// Period of the throughput report
    #[serde(default = "default_stats_period_seconds")]
    pub stats_period_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            generator: producer::Config::default(),
            sender: sink::Config::default(),
            stats_period_seconds: default_stats_period_seconds(),
        }
    }
}

impl Config {
    /// Period of the throughput report
    #[must_use]
    pub fn stats_period(&self) -> Duration {
        Duration::from_secs(self.stats_period_seconds)
    }

    /// Check every section for inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), Error> {
        self.generator.valid()?;
        self.sender.valid()?;
        if self.stats_period_seconds == 0 {
            return Err(Error::ZeroStatsPeriod);
        }
        Ok(())
    }
}

/// Parse a YAML document. Blank contents yield the default configuration.
///
/// # Errors
///
/// Returns an error if the document is malformed or carries unknown keys.
pub fn parse(contents: &str) -> Result<Config, Error> {
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(contents)?)
}

/// Load configuration from the file at `path`. A missing file yields the
/// default configuration.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config_from_path(path: &Path) -> Result<Config, Error> {
    debug!("Attempting to open configuration file at: {}", path.display());
    match fs::read_to_string(path) {
        Ok(contents) => parse(&contents),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(
                "No configuration file at {}, using defaults.",
                path.display()
            );
            Ok(Config::default())
        }
        Err(err) => Err(Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(err),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use byte_unit::Byte;

    use super::{Config, Error, load_config_from_path, parse};
    use crate::{producer, sink};

    #[test]
    fn config_deserializes() -> Result<(), Error> {
        let contents = r#"
generator:
  seed: [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53,
         59, 61, 67, 71, 73, 79, 83, 89, 97, 101, 103, 107, 109, 113, 127, 131]
  catalog:
    num_metrics: 3
    int_ratio: 100
    float_ratio: 0
    mandatory_tags:
      host: 3
  metric_buffer_size: 10
  start: "2024-01-01 00:00:00"
  end: "2024-01-01"
  step_millis: 1000
  continuous: true
sender:
  server: localhost
  port: 9000
  connection_buffer_size: 4 KiB
  debug: false
stats_period_seconds: 5
"#;
        let config = parse(contents)?;
        assert_eq!(config.generator.catalog.num_metrics, 3);
        assert_eq!(config.generator.catalog.int_ratio, 100);
        assert_eq!(config.generator.catalog.mandatory_tags.get("host"), Some(&3));
        assert_eq!(config.generator.catalog.tag_size, 6);
        assert_eq!(config.generator.seed.map(|s| s[0]), Some(2));
        assert_eq!(config.generator.start.as_deref(), Some("2024-01-01 00:00:00"));
        assert!(config.generator.continuous);
        assert_eq!(config.sender.addr(), "localhost:9000");
        assert_eq!(config.sender.connection_buffer_size, Byte::from_u64(4096));
        assert_eq!(config.sender.connection_max_retries, 3);
        assert!(!config.sender.debug);
        assert_eq!(config.stats_period_seconds, 5);
        config.validate()
    }

    #[test]
    fn empty_document_is_default() -> Result<(), Error> {
        assert_eq!(parse("")?, Config::default());
        assert_eq!(parse("\n  \n")?, Config::default());
        Ok(())
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.generator, producer::Config::default());
        assert_eq!(config.generator.metric_buffer_size, 100_000);
        assert_eq!(config.generator.step_millis, 60_000);
        assert_eq!(config.sender, sink::Config::default());
        assert_eq!(config.sender.addr(), "telegraf:8094");
        assert_eq!(config.sender.connection_buffer_size, Byte::from_u64(1000));
        assert!(config.sender.debug);
        assert_eq!(config.stats_period_seconds, 60);
    }

    #[test]
    fn unknown_key_rejected() {
        let res = parse("sender:\n  hostname: telegraf\n");
        assert!(matches!(res, Err(Error::SerdeYaml(_))));
    }

    #[test]
    fn invalid_ratio_fails_validation() -> Result<(), Error> {
        let config = parse("generator:\n  catalog:\n    int_ratio: 80\n    float_ratio: 30\n")?;
        assert!(matches!(
            config.validate(),
            Err(Error::Producer(producer::Error::Catalog(_)))
        ));
        Ok(())
    }

    #[test]
    fn malformed_timestamp_fails_validation() -> Result<(), Error> {
        let config = parse("generator:\n  end: \"2024/01/02\"\n")?;
        assert!(matches!(
            config.validate(),
            Err(Error::Producer(producer::Error::Clock(_)))
        ));
        Ok(())
    }

    #[test]
    fn zero_flush_period_fails_validation() -> Result<(), Error> {
        let config = parse("sender:\n  connection_flush_period_millis: 0\n")?;
        assert!(matches!(
            config.validate(),
            Err(Error::Sink(sink::Error::Zero))
        ));
        Ok(())
    }

    #[test]
    fn missing_file_is_default() -> Result<(), Box<dyn std::error::Error>> {
        let temp_dir = tempfile::tempdir()?;
        let config = load_config_from_path(&temp_dir.path().join("absent.yaml"))?;
        assert_eq!(config, Config::default());
        Ok(())
    }

    #[test]
    fn loads_file() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "stats_period_seconds: 1")?;
        writeln!(file, "sender:")?;
        writeln!(file, "  port: 1234")?;
        let config = load_config_from_path(file.path())?;
        assert_eq!(config.stats_period_seconds, 1);
        assert_eq!(config.sender.port, 1234);
        Ok(())
    }
}
