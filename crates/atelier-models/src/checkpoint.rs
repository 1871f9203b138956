//! Checkpoint files of a run.
//!
//! Layout: `<checkpoint_dir>/<run_id>/<component>_<label>.safetensors`, plus
//! the run options as `train_opt.json`. The label `latest` resolves to the
//! most recently written checkpoint of the component.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use tracing::{debug, info};

use atelier_core::{Error, Result, RunConfig};

pub const LATEST: &str = "latest";
pub const OPTIONS_FILE: &str = "train_opt.json";
const EXTENSION: &str = "safetensors";
const ATTRIBUTE_PREFIX: &str = "AE_";

/// Run id of an attribute encoder, with the `AE_` prefix added when missing
pub fn attribute_encoder_id(id: &str) -> String {
    if id.starts_with(ATTRIBUTE_PREFIX) {
        id.to_string()
    } else {
        format!("{ATTRIBUTE_PREFIX}{id}")
    }
}

/// Checkpoint directory of one run
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_run(cfg: &RunConfig) -> Self {
        Self::new(cfg.run_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, component: &str, label: &str) -> PathBuf {
        self.dir.join(format!("{component}_{label}.{EXTENSION}"))
    }

    /// Path of an existing checkpoint; `latest` picks the newest file of
    /// the component labelled `latest` or with a numeric epoch label
    pub fn resolve(&self, component: &str, label: &str) -> Result<PathBuf> {
        if label != LATEST {
            let path = self.path(component, label);
            return if path.is_file() {
                Ok(path)
            } else {
                Err(Error::MissingFile(path))
            };
        }

        let prefix = format!("{component}_");
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Err(Error::MissingFile(self.path(component, label))),
        };
        for entry in entries {
            let path = entry?.path();
            let Some(label) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|n| n.strip_suffix(&format!(".{EXTENSION}")))
                .map(str::to_string)
            else {
                continue;
            };
            if label != LATEST && (label.is_empty() || !label.chars().all(|c| c.is_ascii_digit())) {
                continue;
            }
            let modified = fs::metadata(&path)?.modified()?;
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }
        newest
            .map(|(_, path)| path)
            .ok_or_else(|| Error::MissingFile(self.path(component, label)))
    }

    fn prepare(&self, component: &str, label: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        Ok(self.path(component, label))
    }

    pub fn save_varmap(&self, component: &str, label: &str, varmap: &VarMap) -> Result<PathBuf> {
        let path = self.prepare(component, label)?;
        varmap.save(&path)?;
        debug!(path = %path.display(), "saved parameters");
        Ok(path)
    }

    /// Overwrite the variables of `varmap` from a checkpoint; shapes must match
    pub fn load_varmap(&self, component: &str, label: &str, varmap: &mut VarMap) -> Result<PathBuf> {
        let path = self.resolve(component, label)?;
        varmap
            .load(&path)
            .map_err(|e| Error::Checkpoint(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "loaded parameters");
        Ok(path)
    }

    pub fn save_tensors(&self, component: &str, label: &str, tensors: &HashMap<String, Tensor>) -> Result<PathBuf> {
        let path = self.prepare(component, label)?;
        candle_core::safetensors::save(tensors, &path)?;
        debug!(path = %path.display(), "saved tensors");
        Ok(path)
    }

    pub fn load_tensors(&self, component: &str, label: &str, device: &Device) -> Result<HashMap<String, Tensor>> {
        let path = self.resolve(component, label)?;
        candle_core::safetensors::load(&path, device)
            .map_err(|e| Error::Checkpoint(format!("{}: {e}", path.display())))
    }

    pub fn save_options(&self, cfg: &RunConfig) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(OPTIONS_FILE);
        fs::write(&path, serde_json::to_string_pretty(cfg)?)?;
        Ok(path)
    }

    pub fn load_options(&self) -> Result<RunConfig> {
        let path = self.dir.join(OPTIONS_FILE);
        if !path.is_file() {
            return Err(Error::MissingFile(path));
        }
        let cfg: RunConfig = serde_json::from_str(&fs::read_to_string(&path)?)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};
    use std::time::Duration;

    fn set_mtime(path: &Path, secs: u64) -> Result<()> {
        let file = fs::File::options().write(true).open(path)?;
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))?;
        Ok(())
    }

    #[test]
    fn test_attribute_encoder_id() {
        assert_eq!(attribute_encoder_id("AE_1.0"), "AE_1.0");
        assert_eq!(attribute_encoder_id("1.0"), "AE_1.0");
    }

    #[test]
    fn test_varmap_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path().join("run"));
        let device = Device::Cpu;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        vb.get_with_hints((2, 3), "w", Init::Const(0.5))?;
        store.save_varmap("netG", "3", &varmap)?;

        let mut other = VarMap::new();
        let w = VarBuilder::from_varmap(&other, DType::F32, &device).get_with_hints((2, 3), "w", Init::Const(0.0))?;
        store.load_varmap("netG", "3", &mut other)?;
        assert_eq!(w.flatten_all()?.to_vec1::<f32>()?, vec![0.5; 6]);

        assert!(matches!(store.load_varmap("netG", "4", &mut other), Err(Error::MissingFile(_))));
        Ok(())
    }

    #[test]
    fn test_latest_picks_newest_of_component() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path());
        let device = Device::Cpu;
        let t = |v: f32| -> Result<HashMap<String, Tensor>> {
            Ok(HashMap::from([("x".to_string(), Tensor::new(&[v], &device)?)]))
        };

        let old = store.save_tensors("optim", "2", &t(2.0)?)?;
        let new = store.save_tensors("optim", "5", &t(5.0)?)?;
        let other = store.save_tensors("optim_D", "9", &t(9.0)?)?;
        set_mtime(&old, 100)?;
        set_mtime(&new, 200)?;
        set_mtime(&other, 300)?;

        assert_eq!(store.resolve("optim", LATEST)?, new);
        let loaded = store.load_tensors("optim", LATEST, &device)?;
        assert_eq!(loaded["x"].to_vec1::<f32>()?, vec![5.0]);
        assert_eq!(store.resolve("optim_D", LATEST)?, other);
        assert!(store.resolve("netD", LATEST).is_err());
        Ok(())
    }

    #[test]
    fn test_options_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path());
        let mut cfg = RunConfig::default();
        cfg.id = "AE_test".into();
        cfg.attribute.n_attr = 7;
        store.save_options(&cfg)?;
        let loaded = store.load_options()?;
        assert_eq!(loaded.id, "AE_test");
        assert_eq!(loaded.attribute.n_attr, 7);
        Ok(())
    }
}
