//! Best-weight snapshots and weight files
//!
//! A [`BestWeights`] value lives for one training run. It holds a copy of the
//! model from the epoch with the best aggregate validation loss; files are
//! named after that epoch, counted from 1.

use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;

use crate::{NervusError, Result};

/// Extension added by the weight recorder
const WEIGHT_EXTENSION: &str = "mpk";

/// When weights are written during training
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStrategy {
    /// Only the final best weights, once training ends
    Best,
    /// Every improvement, with the last one marked as best
    Each,
}

impl fmt::Display for SaveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveStrategy::Best => write!(f, "best"),
            SaveStrategy::Each => write!(f, "each"),
        }
    }
}

impl FromStr for SaveStrategy {
    type Err = NervusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "best" => Ok(SaveStrategy::Best),
            "each" => Ok(SaveStrategy::Each),
            other => Err(NervusError::Configuration(format!(
                "Invalid save_weight: {} (expected 'best' or 'each')",
                other
            ))),
        }
    }
}

/// File stem of a weight file, e.g. `weight_epoch-004_best`
pub fn weight_file_stem(display_epoch: usize, as_best: bool) -> String {
    let suffix = if as_best { "_best" } else { "" };
    format!("weight_epoch-{:03}{}", display_epoch, suffix)
}

fn with_extension(stem: PathBuf) -> PathBuf {
    stem.with_extension(WEIGHT_EXTENSION)
}

/// Best model of a run and the epoch it came from
#[derive(Debug, Clone)]
pub struct BestWeights<B: Backend, M: Module<B>> {
    model: Option<M>,
    /// 0-based
    epoch: Option<usize>,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: Module<B>> Default for BestWeights<B, M> {
    fn default() -> Self {
        BestWeights {
            model: None,
            epoch: None,
            _backend: PhantomData,
        }
    }
}

impl<B: Backend, M: Module<B>> BestWeights<B, M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep a copy of `model` as the best so far
    pub fn store(&mut self, model: &M, epoch: usize) {
        self.model = Some(model.clone());
        self.epoch = Some(epoch);
    }

    pub fn epoch(&self) -> Option<usize> {
        self.epoch
    }

    pub fn model(&self) -> Option<&M> {
        self.model.as_ref()
    }

    pub fn into_model(self) -> Option<M> {
        self.model
    }

    /// Write the snapshot to `dir`.
    ///
    /// With `as_best`, a plain file already written for the same epoch is
    /// renamed instead of being written again.
    pub fn save(&self, dir: &Path, as_best: bool) -> Result<PathBuf> {
        let (model, epoch) = match (&self.model, self.epoch) {
            (Some(model), Some(epoch)) => (model, epoch),
            _ => {
                return Err(NervusError::MissingData(
                    "no best weights stored yet".to_string(),
                ))
            }
        };

        std::fs::create_dir_all(dir)?;
        let plain = with_extension(dir.join(weight_file_stem(epoch + 1, false)));

        if !as_best {
            save_weights(model, &plain)?;
            return Ok(plain);
        }

        let best = with_extension(dir.join(weight_file_stem(epoch + 1, true)));
        if plain.exists() {
            std::fs::rename(&plain, &best)?;
            log::debug!("Renamed {} to {}", plain.display(), best.display());
        } else {
            save_weights(model, &best)?;
        }
        Ok(best)
    }
}

/// Save a module with the named MessagePack recorder
pub fn save_weights<B: Backend, M: Module<B>>(model: &M, path: &Path) -> Result<()> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path.to_path_buf(), &recorder)
        .map_err(|e| NervusError::Record(format!("Failed to save {}: {}", path.display(), e)))?;
    log::info!("Saved weights to {}", path.display());
    Ok(())
}

/// Load weights into a freshly built module of the same architecture
pub fn load_weights<B: Backend, M: Module<B>>(model: M, path: &Path, device: &B::Device) -> Result<M> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| NervusError::Record(format!("Failed to load {}: {}", path.display(), e)))
}

/// Timestamped results directory of one run
#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    /// `<results_dir>/<%Y-%m-%d-%H-%M-%S>`
    pub fn create(results_dir: &Path) -> Result<Self> {
        let stamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string();
        Self::at(results_dir.join(stamp))
    }

    pub fn at(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(RunDir { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn weights(&self) -> PathBuf {
        self.root.join("weights")
    }

    pub fn learning_curves(&self) -> PathBuf {
        self.root.join("learning_curves")
    }

    pub fn likelihoods(&self) -> PathBuf {
        self.root.join("likelihoods")
    }

    /// Timestamp the run directory is named after
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Most recent run under `results_dir`. Timestamp names sort in time
    /// order.
    pub fn latest(results_dir: &Path) -> Result<Self> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(results_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                runs.push(entry.path());
            }
        }
        runs.sort();
        let root = runs.pop().ok_or_else(|| {
            NervusError::MissingData(format!("no runs in {}", results_dir.display()))
        })?;
        Ok(RunDir { root })
    }

    /// The `_best` weight file of this run
    pub fn best_weights(&self) -> Result<PathBuf> {
        let mut found = Vec::new();
        if self.weights().is_dir() {
            for entry in std::fs::read_dir(self.weights())? {
                let path = entry?.path();
                let is_best = path
                    .file_stem()
                    .is_some_and(|stem| stem.to_string_lossy().ends_with("_best"));
                if is_best {
                    found.push(path);
                }
            }
        }
        found.sort();
        found.pop().ok_or_else(|| {
            NervusError::MissingData(format!(
                "no best weights in {}",
                self.weights().display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mlp::{Mlp, MlpConfig};
    use crate::model::WeightNorms;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray<f32>;

    fn model() -> Mlp<TestBackend> {
        Mlp::new(&Default::default(), MlpConfig::new(4, 2))
    }

    #[test]
    fn test_weight_file_names() {
        assert_eq!(weight_file_stem(4, false), "weight_epoch-004");
        assert_eq!(weight_file_stem(12, true), "weight_epoch-012_best");
    }

    #[test]
    fn test_save_strategy_parsing() {
        assert_eq!("each".parse::<SaveStrategy>().unwrap(), SaveStrategy::Each);
        assert!("last".parse::<SaveStrategy>().is_err());
    }

    #[test]
    fn test_save_requires_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let best = BestWeights::<TestBackend, Mlp<TestBackend>>::new();
        assert!(matches!(
            best.save(dir.path(), true),
            Err(NervusError::MissingData(_))
        ));
    }

    #[test]
    fn test_best_save_writes_best_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut best = BestWeights::<TestBackend, _>::new();
        best.store(&model(), 2);

        let path = best.save(dir.path(), true).unwrap();
        assert_eq!(path, dir.path().join("weight_epoch-003_best.mpk"));
        assert!(path.exists());
    }

    #[test]
    fn test_each_save_renames_last_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut best = BestWeights::<TestBackend, _>::new();
        best.store(&model(), 0);
        best.save(dir.path(), false).unwrap();
        best.store(&model(), 1);
        let plain = best.save(dir.path(), false).unwrap();
        assert!(plain.exists());

        let path = best.save(dir.path(), true).unwrap();
        assert!(!plain.exists());
        assert!(path.exists());
        assert!(dir.path().join("weight_epoch-001.mpk").exists());
    }

    #[test]
    fn test_saved_weights_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let original = model();
        let path = dir.path().join("weights");
        save_weights(&original, &path).unwrap();

        let restored = load_weights(model(), &path, &device).unwrap();
        assert_eq!(norms(&original), norms(&restored));
    }

    fn norms(model: &Mlp<TestBackend>) -> Vec<f32> {
        model
            .weight_norms()
            .into_iter()
            .map(|n| n.into_scalar().elem::<f32>())
            .collect()
    }

    #[test]
    fn test_run_dir_layout() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDir::create(dir.path()).unwrap();
        assert!(run.root().starts_with(dir.path()));
        assert!(run.root().exists());
        assert!(run.weights().ends_with("weights"));
        assert!(run.likelihoods().ends_with("likelihoods"));
    }

    #[test]
    fn test_latest_run_and_its_best_weights() {
        let dir = tempfile::tempdir().unwrap();
        let older = RunDir::at(dir.path().join("2024-01-05-10-00-00")).unwrap();
        let newer = RunDir::at(dir.path().join("2024-03-01-09-30-00")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a run").unwrap();

        let mut best = BestWeights::<TestBackend, _>::new();
        best.store(&model(), 1);
        best.save(&older.weights(), true).unwrap();
        best.save(&newer.weights(), false).unwrap();

        let latest = RunDir::latest(dir.path()).unwrap();
        assert_eq!(latest.name(), "2024-03-01-09-30-00");
        assert!(matches!(
            latest.best_weights(),
            Err(NervusError::MissingData(_))
        ));

        best.save(&newer.weights(), true).unwrap();
        assert_eq!(
            latest.best_weights().unwrap(),
            newer.weights().join("weight_epoch-002_best.mpk")
        );
    }

    #[test]
    fn test_latest_needs_a_run() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RunDir::latest(dir.path()),
            Err(NervusError::MissingData(_))
        ));
    }
}
