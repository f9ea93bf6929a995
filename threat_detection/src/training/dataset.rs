use crate::error::{InferenceError, InferenceResult};
use rand::{seq::SliceRandom, Rng};
use std::{
    fs,
    path::{Path, PathBuf},
};

const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "gif", "webp", "tif", "tiff"];

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub classes: Vec<String>,
    pub train: Vec<Sample>,
    pub val: Vec<Sample>,
}

/// Reads an image-folder dataset: `root/train` and `root/val` when both
/// exist, otherwise `root` itself split randomly by `val_split`.
pub fn discover<R: Rng + ?Sized>(
    root: &Path,
    val_split: f32,
    rng: &mut R,
) -> InferenceResult<DatasetSplit> {
    let train_dir = root.join("train");
    let val_dir = root.join("val");

    let split = if train_dir.is_dir() && val_dir.is_dir() {
        let (classes, train) = image_folder(&train_dir)?;
        let (val_classes, val) = image_folder(&val_dir)?;
        let val = val
            .into_iter()
            .map(|sample| {
                let name = &val_classes[sample.label];
                let label = classes.iter().position(|c| c == name).ok_or_else(|| {
                    InferenceError::invalid_input(format!(
                        "validation class '{}' has no training images",
                        name
                    ))
                })?;
                Ok(Sample { label, ..sample })
            })
            .collect::<InferenceResult<Vec<_>>>()?;
        DatasetSplit { classes, train, val }
    } else {
        let (classes, mut samples) = image_folder(root)?;
        samples.shuffle(rng);
        let val_size = (samples.len() as f32 * val_split.clamp(0.0, 1.0)) as usize;
        let val = samples.split_off(samples.len() - val_size);
        DatasetSplit {
            classes,
            train: samples,
            val,
        }
    };

    if split.train.is_empty() {
        return Err(InferenceError::invalid_input(format!(
            "no training images found under {}",
            root.display()
        )));
    }

    tracing::info!(
        "Dataset {}: {} classes, {} train / {} val images",
        root.display(),
        split.classes.len(),
        split.train.len(),
        split.val.len()
    );
    Ok(split)
}

/// One class per subdirectory, sorted by name.
fn image_folder(dir: &Path) -> InferenceResult<(Vec<String>, Vec<Sample>)> {
    let mut classes: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(String::from))
        .collect();
    classes.sort();

    if classes.is_empty() {
        return Err(InferenceError::invalid_input(format!(
            "no class folders found in {}",
            dir.display()
        )));
    }

    let mut samples = Vec::new();
    for (label, class) in classes.iter().enumerate() {
        let mut files: Vec<PathBuf> = fs::read_dir(dir.join(class))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        files.sort();
        samples.extend(files.into_iter().map(|path| Sample { path, label }));
    }

    Ok((classes, samples))
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn touch(dir: &Path, class: &str, names: &[&str]) {
        let class_dir = dir.join(class);
        fs::create_dir_all(&class_dir).unwrap();
        for name in names {
            fs::write(class_dir.join(name), b"x").unwrap();
        }
    }

    #[test]
    fn presplit_dataset_maps_val_labels_by_name() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("train"), "tank", &["a.jpg", "b.png"]);
        touch(&root.path().join("train"), "drone", &["c.jpg", "notes.txt"]);
        touch(&root.path().join("val"), "tank", &["d.jpg"]);

        let split = discover(root.path(), 0.2, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(split.classes, vec!["drone".to_string(), "tank".to_string()]);
        assert_eq!(split.train.len(), 3);
        assert_eq!(split.val.len(), 1);
        assert_eq!(split.val[0].label, 1);
    }

    #[test]
    fn single_folder_is_split_by_ratio() {
        let root = tempfile::tempdir().unwrap();
        touch(root.path(), "a", &["1.jpg", "2.jpg", "3.jpg", "4.jpg", "5.jpg"]);
        touch(root.path(), "b", &["1.jpg", "2.jpg", "3.jpg", "4.jpg", "5.jpg"]);

        let split = discover(root.path(), 0.2, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(split.train.len(), 8);
        assert_eq!(split.val.len(), 2);
        assert!(split.val.iter().all(|s| !split.train.contains(s)));
    }

    #[test]
    fn seeded_split_is_reproducible() {
        let root = tempfile::tempdir().unwrap();
        touch(root.path(), "a", &["1.jpg", "2.jpg", "3.jpg", "4.jpg"]);
        touch(root.path(), "b", &["1.jpg", "2.jpg", "3.jpg", "4.jpg"]);

        let first = discover(root.path(), 0.25, &mut StdRng::seed_from_u64(9)).unwrap();
        let second = discover(root.path(), 0.25, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(first.val, second.val);
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        assert!(discover(root.path(), 0.2, &mut StdRng::seed_from_u64(0)).is_err());
        touch(root.path(), "empty", &[]);
        assert!(discover(root.path(), 0.2, &mut StdRng::seed_from_u64(0)).is_err());
    }

    #[test]
    fn unknown_validation_class_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("train"), "tank", &["a.jpg"]);
        touch(&root.path().join("val"), "ship", &["b.jpg"]);
        assert!(discover(root.path(), 0.2, &mut StdRng::seed_from_u64(0)).is_err());
    }
}
