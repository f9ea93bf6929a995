use crate::{
    architecture::BaseArchitecture,
    error::{InferenceError, InferenceResult},
    network::HeadNetwork,
};
use serde::{Deserialize, Serialize};
use std::{fs, io::Write, path::Path};

/// Serialized classifier head together with the label set it was trained on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierCheckpoint {
    pub arch: BaseArchitecture,
    pub classes: Vec<String>,
    pub network: HeadNetwork,
}

impl ClassifierCheckpoint {
    pub fn load(path: &Path) -> InferenceResult<Self> {
        let bytes = fs::read(path)?;
        let checkpoint: ClassifierCheckpoint = serde_json::from_slice(&bytes)?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    /// Writes to a sibling temp file then renames it over `path`, so readers
    /// never see a partial checkpoint.
    pub fn save(&self, path: &Path) -> InferenceResult<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, self)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| InferenceError::Io(e.error))?;

        tracing::debug!("Saved checkpoint to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> InferenceResult<()> {
        if self.classes.is_empty() {
            return Err(InferenceError::internal("checkpoint has no classes"));
        }
        if self.network.input_dim() != Some(self.arch.feature_dim()) {
            return Err(InferenceError::internal(format!(
                "checkpoint input dimension {:?} does not match {} features",
                self.network.input_dim(),
                self.arch
            )));
        }
        if self.network.output_dim() != Some(self.classes.len()) {
            return Err(InferenceError::internal(format!(
                "checkpoint head has {:?} outputs for {} classes",
                self.network.output_dim(),
                self.classes.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn checkpoint(classes: &[&str]) -> ClassifierCheckpoint {
        let mut rng = StdRng::seed_from_u64(11);
        ClassifierCheckpoint {
            arch: BaseArchitecture::Vit,
            classes: classes.iter().map(|c| c.to_string()).collect(),
            network: BaseArchitecture::Vit.build_head(classes.len(), true, &mut rng),
        }
    }

    #[test]
    fn save_then_load_preserves_classes_and_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vit.json");
        let original = checkpoint(&["drone", "tank"]);
        original.save(&path).unwrap();

        let loaded = ClassifierCheckpoint::load(&path).unwrap();
        assert_eq!(loaded.classes, original.classes);
        assert_eq!(loaded.arch, BaseArchitecture::Vit);
        let a = original.network.linear_layers().last().unwrap();
        let b = loaded.network.linear_layers().last().unwrap();
        assert_eq!(a.weight, b.weight);
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn load_rejects_mismatched_head() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let mut bad = checkpoint(&["drone", "tank"]);
        bad.classes.push("jet".into());
        std::fs::write(&path, serde_json::to_vec(&bad).unwrap()).unwrap();
        assert!(ClassifierCheckpoint::load(&path).is_err());
    }
}
