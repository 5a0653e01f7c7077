//! Multi-task clinical outcome prediction
//!
//! Turns a single-output backbone (MLP, CNN or ViT) into a shared-trunk network
//! with one head per label, and keeps per-label loss and best-epoch bookkeeping
//! for training runs over tabular data, images, or both.

pub mod data;
pub mod model;
pub mod predict;
pub mod training;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Synthetic loss key aggregating all tasks
pub const TOTAL_KEY: &str = "total";

/// Head name prefixes; task names may not start with any of them
pub const RESERVED_PREFIXES: [&str; 3] = ["fc_", "block_", "heads_"];

/// A single predicted outcome and the width of its output head
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    /// 1 for regression and survival risk, class count for classification
    pub num_outputs: usize,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, num_outputs: usize) -> Self {
        TaskSpec {
            name: name.into(),
            num_outputs,
        }
    }
}

/// Ordered set of tasks.
///
/// The order is fixed at configuration time and is the one order used for
/// head names, loss keys and report lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<TaskSpec>", into = "Vec<TaskSpec>")]
pub struct TaskSet {
    tasks: Vec<TaskSpec>,
}

impl TaskSet {
    /// Validate and build a task set
    pub fn new(tasks: Vec<TaskSpec>) -> Result<Self> {
        if tasks.is_empty() {
            return Err(NervusError::Configuration(
                "task set must contain at least one task".to_string(),
            ));
        }

        for (i, task) in tasks.iter().enumerate() {
            if task.name.is_empty() {
                return Err(NervusError::Configuration(format!(
                    "task #{} has an empty name",
                    i
                )));
            }
            if task.name == TOTAL_KEY {
                return Err(NervusError::Configuration(format!(
                    "task name '{}' is reserved for the aggregate loss",
                    TOTAL_KEY
                )));
            }
            if let Some(prefix) = RESERVED_PREFIXES
                .iter()
                .find(|p| task.name.starts_with(*p))
            {
                return Err(NervusError::Configuration(format!(
                    "task name '{}' starts with reserved head prefix '{}'",
                    task.name, prefix
                )));
            }
            if task.num_outputs == 0 {
                return Err(NervusError::Configuration(format!(
                    "task '{}' must have at least one output",
                    task.name
                )));
            }
            if tasks[..i].iter().any(|t| t.name == task.name) {
                return Err(NervusError::Configuration(format!(
                    "duplicate task name '{}'",
                    task.name
                )));
            }
        }

        Ok(TaskSet { tasks })
    }

    /// Build from `(name, num_outputs)` pairs
    pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (S, usize)>) -> Result<Self> {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, n)| TaskSpec::new(name, n))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Always false for a validated set; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskSpec> {
        self.tasks.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.name == name)
    }
}

impl TryFrom<Vec<TaskSpec>> for TaskSet {
    type Error = NervusError;

    fn try_from(tasks: Vec<TaskSpec>) -> Result<Self> {
        TaskSet::new(tasks)
    }
}

impl From<TaskSet> for Vec<TaskSpec> {
    fn from(set: TaskSet) -> Self {
        set.tasks
    }
}

/// Kind of outcome being predicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Classification,
    Regression,
    #[serde(alias = "deepsurv")]
    Survival,
}

impl TaskKind {
    pub fn is_survival(&self) -> bool {
        matches!(self, TaskKind::Survival)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Classification => write!(f, "classification"),
            TaskKind::Regression => write!(f, "regression"),
            TaskKind::Survival => write!(f, "deepsurv"),
        }
    }
}

impl FromStr for TaskKind {
    type Err = NervusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "classification" => Ok(TaskKind::Classification),
            "regression" => Ok(TaskKind::Regression),
            "deepsurv" | "survival" => Ok(TaskKind::Survival),
            other => Err(NervusError::Configuration(format!(
                "invalid task kind: {}",
                other
            ))),
        }
    }
}

/// Application-wide errors
#[derive(Debug, Error)]
pub enum NervusError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("Unknown phase: {0} (expected 'train' or 'val')")]
    UnknownPhase(String),

    #[error("Config file error: {0}")]
    Config(String),

    #[error("Weight record error: {0}")]
    Record(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NervusError>;

/// Application configuration loaded from config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub task: TaskConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub kind: TaskKind,
    pub labels: TaskSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// `MLP`, a network name such as `ResNet18`, or `MLP+<network>`
    pub model: String,
    /// Number of tabular inputs (excluding any image-derived column)
    pub num_inputs: usize,
    /// Image channels, 1 or 3
    pub in_channel: usize,
    /// Square image side length
    pub image_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// CEL, MSE, RMSE, MAE or NLL
    pub criterion: String,
    /// Adam, AdamW, SGD or RMSprop
    pub optimizer: String,
    /// `best` or `each`
    pub save_weight: String,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub results_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            task: TaskConfig {
                kind: TaskKind::Classification,
                labels: TaskSet {
                    tasks: vec![TaskSpec::new("grade", 3), TaskSpec::new("malignant", 2)],
                },
            },
            model: ModelConfig {
                model: "MLP".to_string(),
                num_inputs: 24,
                in_channel: 1,
                image_size: 64,
            },
            training: TrainingConfig {
                epochs: 10,
                batch_size: 64,
                learning_rate: 1e-3,
                criterion: "CEL".to_string(),
                optimizer: "Adam".to_string(),
                save_weight: "best".to_string(),
                seed: 42,
            },
            output: OutputConfig {
                results_dir: "results".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            NervusError::Config(format!("Failed to read config file {}: {}", path, e))
        })?;
        toml::from_str(&content)
            .map_err(|e| NervusError::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| NervusError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_set_keeps_order() {
        let tasks = TaskSet::from_pairs([("grade", 3), ("malignant", 2), ("size", 1)]).unwrap();
        let names: Vec<&str> = tasks.names().collect();
        assert_eq!(names, vec!["grade", "malignant", "size"]);
        assert_eq!(tasks.position("malignant"), Some(1));
        assert_eq!(tasks.get("size").map(|t| t.num_outputs), Some(1));
    }

    #[test]
    fn test_task_set_rejects_bad_names() {
        assert!(TaskSet::new(vec![]).is_err());
        assert!(TaskSet::from_pairs([("a", 2), ("a", 3)]).is_err());
        assert!(TaskSet::from_pairs([("total", 2)]).is_err());
        assert!(TaskSet::from_pairs([("fc_grade", 2)]).is_err());
        assert!(TaskSet::from_pairs([("heads_x", 2)]).is_err());
        assert!(TaskSet::from_pairs([("grade", 0)]).is_err());
    }

    #[test]
    fn test_task_kind_parsing() {
        assert_eq!("deepsurv".parse::<TaskKind>().unwrap(), TaskKind::Survival);
        assert_eq!(
            "Classification".parse::<TaskKind>().unwrap(),
            TaskKind::Classification
        );
        assert!(matches!(
            "ranking".parse::<TaskKind>(),
            Err(NervusError::Configuration(_))
        ));
    }

    #[test]
    fn test_config_round_trip_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.task.labels, config.task.labels);
        assert_eq!(parsed.task.kind, TaskKind::Classification);
        assert_eq!(parsed.model.model, "MLP");
    }

    #[test]
    fn test_config_rejects_invalid_labels() {
        let text = r#"
            [task]
            kind = "regression"
            labels = [{ name = "total", num_outputs = 1 }]

            [model]
            model = "MLP"
            num_inputs = 4
            in_channel = 1
            image_size = 32

            [training]
            epochs = 1
            batch_size = 2
            learning_rate = 0.001
            criterion = "MSE"
            optimizer = "Adam"
            save_weight = "best"
            seed = 1

            [output]
            results_dir = "results"
        "#;
        assert!(toml::from_str::<Config>(text).is_err());
    }
}
