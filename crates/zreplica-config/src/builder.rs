//! Configuration builder for layered configuration loading

use crate::{Config, ConfigError, ConfigResult};
use config::{ConfigBuilder as ConfigBuilderInner, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

/// Configuration builder for loading configuration from multiple sources
#[derive(Debug)]
pub struct ConfigBuilder {
    inner: ConfigBuilderInner<config::builder::DefaultState>,
    sources: Vec<ConfigSource>,
    env_separator: String,
}

#[derive(Debug, Clone)]
enum ConfigSource {
    File { path: PathBuf, format: FileFormat },
    Defaults,
    Environment { prefix: String },
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            inner: config::Config::builder(),
            sources: Vec::new(),
            env_separator: "__".to_string(),
        }
    }

    /// Add default configuration values
    pub fn add_defaults(mut self) -> Self {
        self.sources.push(ConfigSource::Defaults);
        self
    }

    /// Add a configuration file source; missing files are skipped
    pub fn add_source_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let format = Self::detect_format(&path);
        self.sources.push(ConfigSource::File { path, format });
        self
    }

    /// Add environment variable source with prefix
    pub fn add_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.sources.push(ConfigSource::Environment {
            prefix: prefix.into(),
        });
        self
    }

    /// Set environment variable separator (default: "__")
    pub fn env_separator<S: Into<String>>(mut self, separator: S) -> Self {
        self.env_separator = separator.into();
        self
    }

    /// Build the configuration
    pub fn build(mut self) -> ConfigResult<Config> {
        let defaults_value = serde_yaml::to_value(Config::default())
            .map_err(|e| ConfigError::other(format!("Failed to serialize defaults: {}", e)))?;
        self.inner = self
            .inner
            .add_source(config::Config::try_from(&defaults_value)?);

        for source in &self.sources {
            match source {
                ConfigSource::File { path, format } => {
                    if path.exists() {
                        self.inner = self
                            .inner
                            .add_source(File::from(path.clone()).format(*format));
                    }
                }
                ConfigSource::Environment { prefix } => {
                    self.inner = self.inner.add_source(
                        Environment::with_prefix(prefix)
                            .separator(&self.env_separator)
                            .try_parsing(true)
                            .list_separator(",")
                            .with_list_parse_key("ssh.options"),
                    );
                }
                ConfigSource::Defaults => {
                    // Already the base layer
                }
            }
        }

        let config = self.inner.build()?;
        let result: Config = config.try_deserialize()?;

        Self::validate(&result)?;

        Ok(result)
    }

    /// Detect file format from extension
    fn detect_format(path: &Path) -> FileFormat {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("json") => FileFormat::Json,
            _ => FileFormat::Yaml,
        }
    }

    /// Validate the configuration
    pub fn validate(config: &Config) -> ConfigResult<()> {
        validate_name("replication.tag_prefix", &config.replication.tag_prefix)?;
        if let Some(host_id) = &config.replication.host_id {
            validate_name("replication.host_id", host_id)?;
        }

        if config.transfer.progress_interval_ms == 0 {
            return Err(ConfigError::validation(
                "transfer.progress_interval_ms must be greater than 0",
            ));
        }

        for (key, path) in [
            ("tools.zfs", &config.tools.zfs),
            ("tools.ssh", &config.tools.ssh),
            ("tools.zstd", &config.tools.zstd),
        ] {
            if path.trim().is_empty() {
                return Err(ConfigError::validation(format!("{} must not be empty", key)));
            }
        }

        if config.ssh.port == Some(0) {
            return Err(ConfigError::validation("ssh.port must not be 0"));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&config.logging.level.as_str()) {
            return Err(ConfigError::validation(
                "Log level must be one of: trace, debug, info, warn, error",
            ));
        }

        Ok(())
    }
}

/// Tag components end up inside snapshot names
fn validate_name(key: &str, value: &str) -> ConfigResult<()> {
    if value.is_empty() {
        return Err(ConfigError::validation(format!("{} must not be empty", key)));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
    {
        return Err(ConfigError::validation(format!(
            "{} contains invalid character '{}'",
            key, bad
        )));
    }
    Ok(())
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_config(suffix: &str, content: &str) -> NamedTempFile {
        let mut temp_file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        writeln!(temp_file, "{}", content).unwrap();
        temp_file
    }

    #[test]
    fn test_builder_defaults() {
        let config = ConfigBuilder::new().add_defaults().build().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.replication.min_free_fraction.get(), 0.10);
        assert_eq!(config.tools.zfs, "zfs");
    }

    #[test]
    fn test_builder_yaml_file() {
        let temp_file = temp_config(
            ".yaml",
            r#"
replication:
  min_free_fraction: 0.25
  host_id: backup01
transfer:
  compress: false
  buffer_size: 0
ssh:
  port: 2222
  options: ["BatchMode=yes"]
"#,
        );

        let config = ConfigBuilder::new()
            .add_defaults()
            .add_source_file(temp_file.path())
            .build()
            .unwrap();

        assert_eq!(config.replication.min_free_fraction.get(), 0.25);
        assert_eq!(config.replication.host_id.as_deref(), Some("backup01"));
        assert!(config.transfer.compression().is_none());
        assert!(!config.transfer.buffer_size.is_enabled());
        assert_eq!(config.ssh.port, Some(2222));
        assert_eq!(config.ssh.options, vec!["BatchMode=yes".to_string()]);
        assert_eq!(config.replication.tag_prefix, "zreplica");
    }

    #[test]
    fn test_builder_toml_file() {
        let temp_file = temp_config(
            ".toml",
            r#"
[tools]
zfs = "/usr/sbin/zfs"

[logging]
level = "debug"
"#,
        );

        let config = ConfigBuilder::new()
            .add_defaults()
            .add_source_file(temp_file.path())
            .build()
            .unwrap();

        assert_eq!(config.tools.zfs, "/usr/sbin/zfs");
        assert_eq!(config.tools.ssh, "ssh");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let config = ConfigBuilder::new()
            .add_defaults()
            .add_source_file("/nonexistent/zreplica.yaml")
            .build()
            .unwrap();
        assert_eq!(config, Config::default());
    }

    #[rstest]
    #[case("replication:\n  min_free_fraction: 1.5\n", "fraction")]
    #[case("replication:\n  tag_prefix: \"bad/prefix\"\n", "invalid character")]
    #[case("tools:\n  zstd: \"\"\n", "tools.zstd")]
    #[case("logging:\n  level: loud\n", "Log level")]
    #[case("transfer:\n  compression_level: 30\n", "Compression level")]
    fn test_builder_validation(#[case] content: &str, #[case] expected: &str) {
        let temp_file = temp_config(".yaml", content);

        let result = ConfigBuilder::new()
            .add_defaults()
            .add_source_file(temp_file.path())
            .build();

        let message = result.unwrap_err().to_string();
        assert!(message.contains(expected), "unexpected error: {}", message);
    }
}
