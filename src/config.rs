//! Configuration for a chunked aggregation run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::processor::chunk_reader::{MalformedRows, ReadOptions};

/// Top-level configuration, loadable from YAML or JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub input: InputConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Parameters of the monthly average report
    #[serde(default)]
    pub filter: FilterConfig,
}

/// Source CSV and how it is read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputConfig {
    /// Transactions CSV
    pub path: PathBuf,

    /// Rows per batch
    #[serde(default = "default_step")]
    pub step: usize,

    /// `fail` aborts on the first malformed row, `skip` drops it
    #[serde(default)]
    pub on_malformed: MalformedRows,

    #[serde(default)]
    pub allow_missing_columns: bool,

    #[serde(default)]
    pub ignore_excess_columns: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("transactions.csv"),
            step: default_step(),
            on_malformed: MalformedRows::default(),
            allow_missing_columns: false,
            ignore_excess_columns: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Directory receiving one Arrow IPC file per batch
    #[serde(default)]
    pub partition_dir: Option<PathBuf>,

    /// JSON report of the finalized tables
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessingConfig {
    /// Parse and fold batches on the rayon pool
    #[serde(default)]
    pub parallel: bool,

    /// Rayon thread pool size, rayon's default when unset
    #[serde(default)]
    pub rayon_threads: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterConfig {
    #[serde(default = "default_year")]
    pub year: i32,

    #[serde(default = "default_exp_type")]
    pub exp_type: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            year: default_year(),
            exp_type: default_exp_type(),
        }
    }
}

impl Config {
    /// Creates a configuration for `path` with every other setting defaulted.
    pub fn for_input(path: &Path) -> Self {
        Self {
            input: InputConfig {
                path: path.to_path_buf(),
                ..InputConfig::default()
            },
            ..Config::default()
        }
    }

    /// Load configuration from a YAML or JSON file.
    /// Format is picked from the extension; anything else is parsed as YAML.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config = match ext {
            "json" => Self::from_json(&contents)?,
            _ => Self::from_yaml(&contents)?,
        };
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.input.step == 0 {
            anyhow::bail!("input.step must be > 0");
        }
        if self.processing.rayon_threads == Some(0) {
            anyhow::bail!("processing.rayon_threads must be > 0");
        }
        if !(1..=9999).contains(&self.filter.year) {
            anyhow::bail!("filter.year must be a four digit year");
        }
        if self.filter.exp_type.trim().is_empty() {
            anyhow::bail!("filter.exp_type must not be empty");
        }
        Ok(())
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            on_malformed: self.input.on_malformed,
            allow_missing_columns: self.input.allow_missing_columns,
            ignore_excess_columns: self.input.ignore_excess_columns,
        }
    }
}

fn default_step() -> usize { 5_000_000 }
fn default_year() -> i32 { 2020 }
fn default_exp_type() -> String { "Entertainment".to_string() }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = Config::from_yaml("input:\n  path: data/transactions.csv\n").unwrap();
        assert_eq!(config.input.path, PathBuf::from("data/transactions.csv"));
        assert_eq!(config.input.step, 5_000_000);
        assert_eq!(config.input.on_malformed, MalformedRows::Fail);
        assert!(!config.processing.parallel);
        assert_eq!(config.filter.year, 2020);
        assert_eq!(config.filter.exp_type, "Entertainment");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_file_overrides() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"input": {{"path": "t.csv", "step": 1000, "on_malformed": "skip"}},
                "processing": {{"parallel": true, "rayon_threads": 4}},
                "filter": {{"year": 2018, "exp_type": "Food"}}}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.input.step, 1000);
        assert_eq!(config.read_options().on_malformed, MalformedRows::Skip);
        assert_eq!(config.processing.rayon_threads, Some(4));
        assert_eq!(config.filter.exp_type, "Food");
    }

    #[test]
    fn test_validation_rejects_zero_step_and_threads() {
        let mut config = Config::for_input(Path::new("t.csv"));
        config.input.step = 0;
        assert!(config.validate().is_err());

        let mut config = Config::for_input(Path::new("t.csv"));
        config.processing.rayon_threads = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut config = Config::for_input(Path::new("t.csv"));
        config.output.partition_dir = Some(PathBuf::from("parts"));
        let yaml = config.to_yaml().unwrap();
        assert_eq!(Config::from_yaml(&yaml).unwrap(), config);
    }
}
